use crate::domain::model::{Phase, RecoveryState};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Invalid value for '{field}': {value} ({reason})")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required configuration field: {field}")]
    MissingConfigError { field: String },

    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Unsafe query rejected: {reason}")]
    UnsafeQuery { reason: String },

    #[error("Generated {id_type} identifier failed the entropy check twice")]
    LowEntropy { id_type: String },

    #[error("Key conflict on '{key}'")]
    Conflict { key: String },

    #[error("Integrity check failed: {details}")]
    Integrity { details: String },

    #[error("Timed out after {waited_ms}ms waiting for lock {path} (held by pid {holder_pid:?})")]
    LockTimeout {
        path: String,
        holder_pid: Option<u32>,
        waited_ms: u64,
    },

    #[error("Validation failed: {failed} check(s) failed ({details})")]
    ValidationFailed { failed: usize, details: String },

    #[error("Phase {phase} exceeded its deadline of {timeout_ms}ms")]
    PhaseTimeout { phase: String, timeout_ms: u64 },

    #[error("Transaction error: {message}")]
    TransactionError { message: String },

    #[error("Backup error: {message}")]
    BackupError { message: String },

    #[error("Batch of {size} records exceeds the maximum of {max}")]
    BatchTooLarge { size: usize, max: usize },

    #[error("Migration aborted during {phase}: {cause} [{recovery}]")]
    Aborted {
        phase: Phase,
        cause: Box<MigrationError>,
        recovery: RecoveryState,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Storage,
    Security,
    Transformation,
    Concurrency,
    Validation,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl MigrationError {
    pub fn config(message: impl Into<String>) -> Self {
        MigrationError::ConfigError {
            message: message.into(),
        }
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        MigrationError::TransactionError {
            message: message.into(),
        }
    }

    pub fn backup(message: impl Into<String>) -> Self {
        MigrationError::BackupError {
            message: message.into(),
        }
    }

    /// 取得錯誤分類（包裝錯誤以內部原因為準）
    pub fn category(&self) -> ErrorCategory {
        match self {
            MigrationError::ConfigError { .. }
            | MigrationError::InvalidConfigValueError { .. }
            | MigrationError::MissingConfigError { .. }
            | MigrationError::InvalidPattern { .. } => ErrorCategory::Configuration,
            MigrationError::SqliteError(_)
            | MigrationError::Integrity { .. }
            | MigrationError::BackupError { .. } => ErrorCategory::Storage,
            MigrationError::UnsafeQuery { .. } => ErrorCategory::Security,
            MigrationError::LowEntropy { .. }
            | MigrationError::SerializationError(_)
            | MigrationError::BatchTooLarge { .. } => ErrorCategory::Transformation,
            MigrationError::Conflict { .. }
            | MigrationError::LockTimeout { .. }
            | MigrationError::PhaseTimeout { .. }
            | MigrationError::TransactionError { .. } => ErrorCategory::Concurrency,
            MigrationError::ValidationFailed { .. } => ErrorCategory::Validation,
            MigrationError::IoError(_) => ErrorCategory::System,
            MigrationError::Aborted { cause, .. } => cause.category(),
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            MigrationError::Conflict { .. } => ErrorSeverity::Low,
            MigrationError::LockTimeout { .. } | MigrationError::PhaseTimeout { .. } => {
                ErrorSeverity::Medium
            }
            MigrationError::Integrity { .. } | MigrationError::IoError(_) => {
                ErrorSeverity::Critical
            }
            MigrationError::Aborted { recovery, cause, .. } => match recovery {
                RecoveryState::Unrestored => ErrorSeverity::Critical,
                _ => cause.severity().max(ErrorSeverity::High),
            },
            _ => ErrorSeverity::High,
        }
    }

    /// 可在本地重試的錯誤（鎖等待與階段逾時）
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MigrationError::LockTimeout { .. } | MigrationError::PhaseTimeout { .. }
        )
    }

    /// 對應 CLI 的退出碼：0 成功、1 驗證/轉換失敗、2 配置/使用錯誤
    pub fn exit_code(&self) -> i32 {
        match self {
            MigrationError::UnsafeQuery { .. } => 2,
            _ if self.category() == ErrorCategory::Configuration => 2,
            _ => 1,
        }
    }

    pub fn recovery_suggestion(&self) -> String {
        match self {
            MigrationError::ConfigError { .. }
            | MigrationError::InvalidConfigValueError { .. }
            | MigrationError::MissingConfigError { .. }
            | MigrationError::InvalidPattern { .. } => {
                "Check the configuration file against the documented sections".to_string()
            }
            MigrationError::UnsafeQuery { .. } => {
                "Custom queries must be a single read-only SELECT statement".to_string()
            }
            MigrationError::LockTimeout { holder_pid, .. } => match holder_pid {
                Some(pid) => format!("Wait for process {} to finish, then retry", pid),
                None => "Another migration holds the lock; retry later".to_string(),
            },
            MigrationError::PhaseTimeout { .. } => {
                "Close the host application and raise migration.query_timeout_ms".to_string()
            }
            MigrationError::Integrity { .. } => {
                "The database file is damaged; restore it from a backup first".to_string()
            }
            MigrationError::LowEntropy { .. } => {
                "The system random source looks broken; do not retry on this host".to_string()
            }
            MigrationError::Aborted { recovery, .. } => match recovery {
                RecoveryState::Unrestored => {
                    "Restore the database manually from the backup directory".to_string()
                }
                _ => "The original database is intact; fix the cause and rerun".to_string(),
            },
            _ => "Rerun with --verbose for details".to_string(),
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self {
            MigrationError::Aborted {
                phase,
                cause,
                recovery,
            } => format!(
                "Migration failed during {} ({}). Database state: {}",
                phase, cause, recovery
            ),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MigrationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_follow_category() {
        assert_eq!(MigrationError::config("bad").exit_code(), 2);
        assert_eq!(
            MigrationError::UnsafeQuery {
                reason: "multiple statements".to_string()
            }
            .exit_code(),
            2
        );
        assert_eq!(
            MigrationError::ValidationFailed {
                failed: 1,
                details: "KeyUniqueness".to_string()
            }
            .exit_code(),
            1
        );

        let aborted = MigrationError::Aborted {
            phase: Phase::Insert,
            cause: Box::new(MigrationError::Conflict {
                key: "k".to_string(),
            }),
            recovery: RecoveryState::RolledBack,
        };
        assert_eq!(aborted.exit_code(), 1);
        assert_eq!(aborted.category(), ErrorCategory::Concurrency);
        assert_eq!(aborted.severity(), ErrorSeverity::High);
    }

    #[test]
    fn test_unrestored_abort_is_critical() {
        let aborted = MigrationError::Aborted {
            phase: Phase::Commit,
            cause: Box::new(MigrationError::transaction("commit failed")),
            recovery: RecoveryState::Unrestored,
        };
        assert_eq!(aborted.severity(), ErrorSeverity::Critical);
        assert!(aborted.user_friendly_message().contains("unrestored"));
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(MigrationError::PhaseTimeout {
            phase: "insert".to_string(),
            timeout_ms: 10
        }
        .is_recoverable());
        assert!(!MigrationError::UnsafeQuery {
            reason: "drop".to_string()
        }
        .is_recoverable());
    }
}
