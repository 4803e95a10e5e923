use crate::core::store::TableName;
use crate::core::transaction::Transaction;
use crate::domain::model::{BatchResult, ConflictStrategy, Record, ValueType};
use crate::utils::error::{MigrationError, Result};
use rusqlite::types::Value;
use rusqlite::{params, Connection};
use std::time::Duration;

/// 單一批次的硬上限
pub const HARD_MAX_BATCH_SIZE: usize = 10_000;
pub const DEFAULT_MAX_BATCH_SIZE: usize = 1_000;

const BATCH_SAVEPOINT: &str = "batch_insert";

/// 在外層交易內以批次寫回紀錄，每批包在一個 savepoint 中
#[derive(Debug, Clone)]
pub struct BatchInserter {
    max_batch_size: usize,
    timeout: Option<Duration>,
}

impl BatchInserter {
    pub fn new(max_batch_size: usize, timeout: Option<Duration>) -> Self {
        Self {
            max_batch_size: max_batch_size.clamp(1, HARD_MAX_BATCH_SIZE),
            timeout,
        }
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// 寫入一批；出錯時整批回滾到 savepoint，批內任何變更都不可見
    pub fn insert_batch(
        &self,
        tx: &mut Transaction,
        records: &[Record],
        strategy: ConflictStrategy,
    ) -> Result<BatchResult> {
        if records.len() > self.max_batch_size {
            return Err(MigrationError::BatchTooLarge {
                size: records.len(),
                max: self.max_batch_size,
            });
        }
        if records.is_empty() {
            return Ok(BatchResult::default());
        }

        let table = tx.store().table().clone();
        tx.savepoint(BATCH_SAVEPOINT)?;

        let outcome = tx.with_deadline("insert", self.timeout, |conn| {
            write_records(conn, &table, records, strategy)
        });

        match outcome {
            Ok(result) => {
                tx.release_savepoint(BATCH_SAVEPOINT)?;
                tracing::debug!(
                    "Batch of {} written: {} inserted, {} conflicts",
                    result.attempted,
                    result.inserted,
                    result.conflicts
                );
                Ok(result)
            }
            Err(e) => {
                if let Err(rollback_err) = tx
                    .rollback_to_savepoint(BATCH_SAVEPOINT)
                    .and_then(|_| tx.release_savepoint(BATCH_SAVEPOINT))
                {
                    tracing::error!("Failed to undo batch savepoint: {}", rollback_err);
                }
                Err(e)
            }
        }
    }
}

fn write_records(
    conn: &Connection,
    table: &TableName,
    records: &[Record],
    strategy: ConflictStrategy,
) -> Result<BatchResult> {
    let t = table.quoted();
    let mut exists = conn.prepare_cached(&format!("SELECT 1 FROM {} WHERE key = ?1", t))?;
    let mut insert =
        conn.prepare_cached(&format!("INSERT INTO {} (key, value) VALUES (?1, ?2)", t))?;
    let mut delete = conn.prepare_cached(&format!("DELETE FROM {} WHERE key = ?1", t))?;
    let mut update = conn.prepare_cached(&format!("UPDATE {} SET value = ?2 WHERE key = ?1", t))?;

    let mut result = BatchResult::default();
    for record in records {
        result.attempted += 1;

        if !exists.exists([&record.key])? {
            insert.execute(params![record.key, stored_value(record)])?;
            result.inserted += 1;
            continue;
        }

        match strategy {
            ConflictStrategy::Ignore => {
                result.conflicts += 1;
            }
            ConflictStrategy::Replace => {
                delete.execute([&record.key])?;
                insert.execute(params![record.key, stored_value(record)])?;
                result.conflicts += 1;
                result.inserted += 1;
            }
            ConflictStrategy::Update => {
                update.execute(params![record.key, stored_value(record)])?;
                result.conflicts += 1;
                result.inserted += 1;
            }
            ConflictStrategy::Fail => {
                return Err(MigrationError::Conflict {
                    key: record.key.clone(),
                });
            }
        }
    }

    Ok(result)
}

/// 依擷取時的原始型別綁定 value
fn stored_value(record: &Record) -> Value {
    match record.value_type {
        ValueType::Null => Value::Null,
        ValueType::Integer => record
            .value
            .parse()
            .map(Value::Integer)
            .unwrap_or_else(|_| Value::Text(record.value.clone())),
        ValueType::Real => record
            .value
            .parse()
            .map(Value::Real)
            .unwrap_or_else(|_| Value::Text(record.value.clone())),
        ValueType::Blob => Value::Blob(record.value.as_bytes().to_vec()),
        ValueType::Text => Value::Text(record.value.clone()),
    }
}
