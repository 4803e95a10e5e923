use crate::core::lock::{FileLock, LockOptions};
use crate::core::performance::{apply_bulk_pragmas, restore_pragmas, PragmaSnapshot};
use crate::core::store::{Store, TableName};
use crate::domain::model::{Savepoint, TxState};
use crate::utils::error::{MigrationError, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct TransactionOptions {
    pub lock: LockOptions,
    pub bulk_pragmas: bool,
    pub operation: String,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            lock: LockOptions::default(),
            bulk_pragmas: true,
            operation: "migrate".to_string(),
        }
    }
}

/// 對單一資料庫檔案的獨佔寫入交易。
///
/// 欄位順序即 drop 順序：連線先關閉，鎖最後釋放。
pub struct Transaction {
    id: String,
    target_path: PathBuf,
    state: TxState,
    savepoints: Vec<Savepoint>,
    pragmas: Option<PragmaSnapshot>,
    store: Store,
    lock: Option<FileLock>,
}

impl Transaction {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target_path(&self) -> &Path {
        &self.target_path
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn savepoints(&self) -> &[Savepoint] {
        &self.savepoints
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state != TxState::Active {
            return Err(MigrationError::transaction(format!(
                "transaction {} is {:?}, not active",
                self.id, self.state
            )));
        }
        // 寫入語句被中斷時 SQLite 會自行回滾整個交易
        if self.store.conn().is_autocommit() {
            return Err(MigrationError::transaction(format!(
                "transaction {} was rolled back by the storage engine",
                self.id
            )));
        }
        Ok(())
    }

    pub fn savepoint(&mut self, name: &str) -> Result<()> {
        self.ensure_active()?;
        validate_savepoint_name(name)?;
        self.store.conn().execute_batch(&format!("SAVEPOINT {}", name))?;
        self.savepoints.push(Savepoint {
            name: name.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    /// 回到 savepoint 當時的狀態；該 savepoint 仍保留，其後建立的被捨棄
    pub fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        self.ensure_active()?;
        let index = self.savepoint_index(name)?;
        self.store
            .conn()
            .execute_batch(&format!("ROLLBACK TO SAVEPOINT {}", name))?;
        self.savepoints.truncate(index + 1);
        Ok(())
    }

    pub fn release_savepoint(&mut self, name: &str) -> Result<()> {
        self.ensure_active()?;
        let index = self.savepoint_index(name)?;
        self.store
            .conn()
            .execute_batch(&format!("RELEASE SAVEPOINT {}", name))?;
        self.savepoints.truncate(index);
        Ok(())
    }

    fn savepoint_index(&self, name: &str) -> Result<usize> {
        self.savepoints
            .iter()
            .rposition(|sp| sp.name == name)
            .ok_or_else(|| MigrationError::transaction(format!("unknown savepoint '{}'", name)))
    }

    /// 在交易連線上執行有期限的工作
    pub fn with_deadline<T>(
        &self,
        phase: &str,
        timeout: Option<Duration>,
        f: impl FnOnce(&rusqlite::Connection) -> Result<T>,
    ) -> Result<T> {
        self.ensure_active()?;
        self.store.with_deadline(phase, timeout, f)
    }

    fn commit_inner(&mut self) -> Result<()> {
        self.ensure_active()?;
        if let Err(e) = self.store.conn().execute_batch("COMMIT") {
            tracing::error!("Commit of {} failed, rolling back: {}", self.id, e);
            if let Err(rollback_err) = self.rollback_inner() {
                tracing::error!(
                    "Rollback after failed commit of {} also failed: {}",
                    self.id,
                    rollback_err
                );
            }
            return Err(e.into());
        }
        self.state = TxState::Committed;
        self.savepoints.clear();
        self.finish();
        Ok(())
    }

    fn rollback_inner(&mut self) -> Result<()> {
        let result = if self.store.conn().is_autocommit() {
            // 引擎已自動回滾
            Ok(())
        } else {
            self.store
                .conn()
                .execute_batch("ROLLBACK")
                .map_err(MigrationError::from)
        };
        self.state = TxState::RolledBack;
        self.savepoints.clear();
        self.finish();
        result
    }

    /// 還原 pragma 並釋放鎖；在任何結束路徑都會執行
    fn finish(&mut self) {
        if let Some(snapshot) = self.pragmas.take() {
            if let Err(e) = restore_pragmas(self.store.conn(), &snapshot) {
                tracing::warn!("Failed to restore pragmas for {}: {}", self.id, e);
            }
        }
        if let Some(lock) = self.lock.take() {
            if let Err(e) = lock.release() {
                tracing::warn!("Failed to release lock for {}: {}", self.id, e);
            }
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TxState::Active {
            tracing::warn!("Transaction {} dropped while active, rolling back", self.id);
            if let Err(e) = self.rollback_inner() {
                tracing::error!("Rollback of dropped transaction {} failed: {}", self.id, e);
            }
        }
    }
}

/// 擁有所有進行中交易的登錄表
pub struct TransactionManager {
    options: TransactionOptions,
    active: HashMap<String, Transaction>,
}

impl TransactionManager {
    pub fn new(options: TransactionOptions) -> Self {
        Self {
            options,
            active: HashMap::new(),
        }
    }

    /// 取得檔案鎖、開啟連線、套用 bulk pragma，最後 BEGIN IMMEDIATE
    pub fn begin(&mut self, path: &Path, table: &TableName) -> Result<String> {
        let lock = FileLock::acquire(path, &self.options.operation, self.options.lock)?;
        self.begin_locked(path, table, lock)
    }

    /// async 版本；等鎖期間讓出 runtime
    pub async fn begin_async(&mut self, path: &Path, table: &TableName) -> Result<String> {
        let lock =
            FileLock::acquire_async(path, &self.options.operation, self.options.lock).await?;
        self.begin_locked(path, table, lock)
    }

    fn begin_locked(&mut self, path: &Path, table: &TableName, lock: FileLock) -> Result<String> {
        let store = Store::open(path, table)?;

        let pragmas = if self.options.bulk_pragmas {
            Some(apply_bulk_pragmas(store.conn())?)
        } else {
            None
        };

        let mut tx = Transaction {
            id: Uuid::new_v4().to_string(),
            target_path: path.to_path_buf(),
            state: TxState::Active,
            savepoints: Vec::new(),
            pragmas,
            store,
            lock: Some(lock),
        };

        if let Err(e) = tx.store.conn().execute_batch("BEGIN IMMEDIATE") {
            tx.state = TxState::RolledBack;
            tx.finish();
            return Err(e.into());
        }

        let id = tx.id.clone();
        tracing::info!("Transaction {} started on {}", id, path.display());
        self.active.insert(id.clone(), tx);
        Ok(id)
    }

    pub fn transaction(&self, id: &str) -> Result<&Transaction> {
        self.active
            .get(id)
            .ok_or_else(|| MigrationError::transaction(format!("no active transaction {}", id)))
    }

    pub fn transaction_mut(&mut self, id: &str) -> Result<&mut Transaction> {
        self.active
            .get_mut(id)
            .ok_or_else(|| MigrationError::transaction(format!("no active transaction {}", id)))
    }

    /// 提交失敗時會先自動回滾再回傳錯誤；鎖一定釋放
    pub fn commit(&mut self, id: &str) -> Result<()> {
        let mut tx = self.take(id)?;
        tx.commit_inner()?;
        tracing::info!("Transaction {} committed", id);
        Ok(())
    }

    pub fn rollback(&mut self, id: &str) -> Result<()> {
        let mut tx = self.take(id)?;
        tx.rollback_inner()?;
        tracing::info!("Transaction {} rolled back", id);
        Ok(())
    }

    /// 強制回滾目標檔案已消失或無法通過完整性檢查的交易，回傳處理數量
    pub fn cleanup_orphaned(&mut self) -> usize {
        let orphaned: Vec<String> = self
            .active
            .iter()
            .filter(|(_, tx)| {
                !tx.target_path.exists()
                    || !matches!(tx.store.integrity_problems(), Ok(ref problems) if problems.is_empty())
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &orphaned {
            tracing::warn!("Force rolling back orphaned transaction {}", id);
            if let Err(e) = self.rollback(id) {
                tracing::error!("Orphan rollback of {} failed: {}", id, e);
            }
        }
        orphaned.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    fn take(&mut self, id: &str) -> Result<Transaction> {
        self.active
            .remove(id)
            .ok_or_else(|| MigrationError::transaction(format!("no active transaction {}", id)))
    }
}

fn validate_savepoint_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false)
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(MigrationError::transaction(format!(
            "invalid savepoint name '{}'",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::lock::FileLock;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (PathBuf, TableName) {
        let path = dir.path().join("state.vscdb");
        let table = TableName::parse("ItemTable").unwrap();
        let store = Store::create(&path, &table).unwrap();
        store
            .conn()
            .execute("INSERT INTO ItemTable (key, value) VALUES ('a', '1')", [])
            .unwrap();
        (path, table)
    }

    fn manager() -> TransactionManager {
        TransactionManager::new(TransactionOptions {
            lock: LockOptions {
                timeout: Duration::from_millis(100),
                poll_interval: Duration::from_millis(20),
            },
            ..TransactionOptions::default()
        })
    }

    fn insert(tx: &Transaction, key: &str) {
        tx.store()
            .conn()
            .execute(
                "INSERT INTO ItemTable (key, value) VALUES (?1, 'x')",
                [key],
            )
            .unwrap();
    }

    #[test]
    fn test_commit_persists_and_releases_lock() {
        let dir = TempDir::new().unwrap();
        let (path, table) = setup(&dir);
        let mut manager = manager();

        let id = manager.begin(&path, &table).unwrap();
        assert!(FileLock::lock_path_for(&path).exists());
        insert(manager.transaction(&id).unwrap(), "b");
        manager.commit(&id).unwrap();

        assert!(!FileLock::lock_path_for(&path).exists());
        assert_eq!(manager.active_count(), 0);
        assert_eq!(Store::open(&path, &table).unwrap().row_count().unwrap(), 2);
        assert!(manager.commit(&id).is_err());
    }

    #[test]
    fn test_rollback_discards_changes() {
        let dir = TempDir::new().unwrap();
        let (path, table) = setup(&dir);
        let mut manager = manager();

        let id = manager.begin(&path, &table).unwrap();
        insert(manager.transaction(&id).unwrap(), "b");
        manager.rollback(&id).unwrap();

        assert!(!FileLock::lock_path_for(&path).exists());
        assert_eq!(Store::open(&path, &table).unwrap().row_count().unwrap(), 1);
    }

    #[test]
    fn test_savepoints_nest() {
        let dir = TempDir::new().unwrap();
        let (path, table) = setup(&dir);
        let mut manager = manager();
        let id = manager.begin(&path, &table).unwrap();

        let tx = manager.transaction_mut(&id).unwrap();
        tx.savepoint("phase_extract").unwrap();
        insert(tx, "b");
        tx.savepoint("phase_insert").unwrap();
        insert(tx, "c");
        assert_eq!(tx.store().row_count().unwrap(), 3);

        tx.rollback_to_savepoint("phase_extract").unwrap();
        assert_eq!(tx.state(), TxState::Active);
        assert_eq!(tx.store().row_count().unwrap(), 1);
        assert_eq!(tx.savepoints().len(), 1);

        tx.release_savepoint("phase_extract").unwrap();
        assert!(tx.savepoints().is_empty());
        assert!(tx.savepoint("bad name; DROP").is_err());
        assert!(tx.rollback_to_savepoint("missing").is_err());

        manager.commit(&id).unwrap();
    }

    #[test]
    fn test_failed_commit_rolls_back_and_releases_lock() {
        let dir = TempDir::new().unwrap();
        let (path, table) = setup(&dir);
        let mut manager = manager();
        let id = manager.begin(&path, &table).unwrap();
        let tx = manager.transaction(&id).unwrap();
        tx.store().conn().busy_timeout(Duration::ZERO).unwrap();
        insert(tx, "b");

        // 讀者持有 SHARED 鎖，COMMIT 拿不到 EXCLUSIVE
        let reader = rusqlite::Connection::open(&path).unwrap();
        reader.execute_batch("BEGIN").unwrap();
        let _: i64 = reader
            .query_row("SELECT COUNT(*) FROM ItemTable", [], |r| r.get(0))
            .unwrap();

        assert!(manager.commit(&id).is_err());
        assert_eq!(manager.active_count(), 0);
        assert!(!FileLock::lock_path_for(&path).exists());

        reader.execute_batch("COMMIT").unwrap();
        assert_eq!(Store::open(&path, &table).unwrap().row_count().unwrap(), 1);
    }

    #[test]
    fn test_second_writer_waits_for_lock() {
        let dir = TempDir::new().unwrap();
        let (path, table) = setup(&dir);
        let mut first = manager();
        let mut second = manager();

        let id = first.begin(&path, &table).unwrap();
        assert!(matches!(
            second.begin(&path, &table),
            Err(MigrationError::LockTimeout { .. })
        ));
        first.rollback(&id).unwrap();
        let id = second.begin(&path, &table).unwrap();
        second.rollback(&id).unwrap();
    }

    #[test]
    fn test_cleanup_orphaned_when_target_removed() {
        let dir = TempDir::new().unwrap();
        let (path, table) = setup(&dir);
        let mut manager = manager();
        let id = manager.begin(&path, &table).unwrap();
        insert(manager.transaction(&id).unwrap(), "b");

        assert_eq!(manager.cleanup_orphaned(), 0);

        let moved = dir.path().join("moved.vscdb");
        std::fs::rename(&path, &moved).unwrap();
        assert_eq!(manager.cleanup_orphaned(), 1);
        assert_eq!(manager.active_count(), 0);
        assert!(!FileLock::lock_path_for(&path).exists());
    }

    #[test]
    fn test_drop_rolls_back_active_transaction() {
        let dir = TempDir::new().unwrap();
        let (path, table) = setup(&dir);
        {
            let mut manager = manager();
            let id = manager.begin(&path, &table).unwrap();
            insert(manager.transaction(&id).unwrap(), "b");
        }
        assert!(!FileLock::lock_path_for(&path).exists());
        assert_eq!(Store::open(&path, &table).unwrap().row_count().unwrap(), 1);
    }
}
