pub mod adapters;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::CliConfig;

pub use adapters::{FileSnapshotStore, MemoryAuditSink, TracingAuditSink};
pub use config::MigrationConfig;
pub use core::orchestrator::{MigrationOrchestrator, MigrationReport, RunOptions};
pub use domain::model::{ConflictStrategy, MigrationMode, Phase, RecoveryState};
pub use utils::error::{MigrationError, Result};
