pub mod extractor;
pub mod identity;
pub mod inserter;
pub mod lock;
pub mod matcher;
pub mod orchestrator;
pub mod performance;
pub mod rules;
pub mod store;
pub mod transaction;
pub mod validator;

pub use crate::domain::model::{Record, TransformationRule};
pub use crate::domain::ports::{AuditSink, IdSource, SnapshotStore};
pub use crate::utils::error::Result;
