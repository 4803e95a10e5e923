// 具體協作者：快照、審計、宿主程序偵測與設定檔重設

pub mod audit;
pub mod backup;
pub mod host;
pub mod telemetry_file;

pub use audit::{MemoryAuditSink, TracingAuditSink};
pub use backup::FileSnapshotStore;
pub use host::{HostProbe, HostProcess};
