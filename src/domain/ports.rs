use crate::domain::model::{IdType, PhaseEvent};
use crate::utils::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// 備份快照識別碼
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackupId(String);

impl BackupId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 備份協作者：遷移前建立快照，無法恢復時還原。保留策略不在此介面內。
pub trait SnapshotStore: Send + Sync {
    fn create_snapshot(&self, path: &Path) -> Result<BackupId>;
    fn restore_snapshot(&self, id: &BackupId, path: &Path) -> Result<()>;
    /// 快照內容的 SHA-256（小寫 hex）
    fn snapshot_digest(&self, id: &BackupId) -> Result<String>;
    fn snapshot_path(&self, id: &BackupId) -> Result<PathBuf>;
}

/// 審計協作者：每次階段轉換收到一個事件，持久性由實作自行負責
pub trait AuditSink: Send + Sync {
    fn emit(&self, event: &PhaseEvent);
}

/// 原始識別碼來源；熵檢查由 IdentityGenerator 負責
pub trait IdSource: Send {
    fn generate(&mut self, id_type: IdType) -> String;
}
