use crate::utils::error::{MigrationError, Result};
use rusqlite::{Connection, ErrorCode, OpenFlags, OptionalExtension};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// 進度回呼每執行這麼多個 VM 指令檢查一次期限
const DEADLINE_CHECK_OPS: i32 = 1000;

/// 經過驗證的資料表名稱，只允許 `[A-Za-z_][A-Za-z0-9_]*`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName(String);

impl TableName {
    pub fn parse(name: &str) -> Result<Self> {
        let mut chars = name.chars();
        let valid_start = chars
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false);
        if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(MigrationError::InvalidConfigValueError {
                field: "migration.table".to_string(),
                value: name.to_string(),
                reason: "Table name must be a plain SQL identifier".to_string(),
            });
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// SQL 中使用的引號形式
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

/// 單一鍵值表的 SQLite 檔案
pub struct Store {
    conn: Connection,
    path: PathBuf,
    table: TableName,
}

impl Store {
    /// 以讀寫模式開啟既有的資料庫檔案
    pub fn open(path: &Path, table: &TableName) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        Self::open_with(path, table, flags)
    }

    pub fn open_read_only(path: &Path, table: &TableName) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        Self::open_with(path, table, flags)
    }

    /// 建立（或開啟）資料庫並確保鍵值表存在
    pub fn create(path: &Path, table: &TableName) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (key TEXT UNIQUE ON CONFLICT REPLACE, value BLOB)",
            table.quoted()
        ))?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
            table: table.clone(),
        })
    }

    fn open_with(path: &Path, table: &TableName, flags: OpenFlags) -> Result<Self> {
        if !path.exists() {
            return Err(MigrationError::IoError(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Database file not found: {}", path.display()),
            )));
        }
        let conn = Connection::open_with_flags(path, flags)?;
        conn.busy_timeout(Duration::from_secs(5))?;

        let store = Self {
            conn,
            path: path.to_path_buf(),
            table: table.clone(),
        };
        if !store.table_exists()? {
            return Err(MigrationError::config(format!(
                "Table {} does not exist in {}",
                table.as_str(),
                path.display()
            )));
        }
        Ok(store)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    fn table_exists(&self) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [self.table.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn row_count(&self) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", self.table.quoted()),
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let value: Option<Option<String>> = self
            .conn
            .query_row(
                &format!("SELECT CAST(value AS TEXT) FROM {} WHERE key = ?1", self.table.quoted()),
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.map(|v| v.unwrap_or_default()))
    }

    /// 執行 `PRAGMA integrity_check`，回傳非 "ok" 的訊息；空列表代表通過
    pub fn integrity_problems(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("PRAGMA integrity_check")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut problems = Vec::new();
        for row in rows {
            let message = row?;
            if message != "ok" {
                problems.push(message);
            }
        }
        Ok(problems)
    }

    /// 在期限內執行 `f`；超過期限時進行中的語句被中斷並回報 PhaseTimeout
    pub fn with_deadline<T>(
        &self,
        phase: &str,
        timeout: Option<Duration>,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        let Some(timeout) = timeout else {
            return f(&self.conn);
        };

        let deadline = Instant::now() + timeout;
        self.conn
            .progress_handler(DEADLINE_CHECK_OPS, Some(move || Instant::now() >= deadline));
        let result = f(&self.conn);
        self.conn.progress_handler(0, None::<fn() -> bool>);

        result.map_err(|e| match e {
            MigrationError::SqliteError(ref inner) if is_interrupted(inner) => {
                MigrationError::PhaseTimeout {
                    phase: phase.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                }
            }
            other => other,
        })
    }
}

pub fn is_interrupted(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _) if inner.code == ErrorCode::OperationInterrupted
    )
}

/// 計算檔案的 SHA-256（小寫 hex）
pub fn file_digest(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}
