use crate::utils::error::{MigrationError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessesToUpdate, System};

const LOCK_SUFFIX: &str = ".migrate.lock";

/// 鎖檔內容
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub created_at: DateTime<Utc>,
    pub operation: String,
}

#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// 目標檔案的獨佔建議鎖，以 `<db>.migrate.lock` 表示；drop 時移除
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    released: bool,
}

impl FileLock {
    pub fn lock_path_for(db_path: &Path) -> PathBuf {
        let mut name = db_path.as_os_str().to_os_string();
        name.push(LOCK_SUFFIX);
        PathBuf::from(name)
    }

    /// 取得鎖；持有者已不存在（或鎖檔連續兩次無法解析）時回收。
    /// 等待時阻塞目前執行緒，async 呼叫端改用 [`FileLock::acquire_async`]
    pub fn acquire(db_path: &Path, operation: &str, options: LockOptions) -> Result<Self> {
        let mut waiter = LockWaiter::new(db_path, options);
        loop {
            match waiter.attempt(operation)? {
                Attempt::Acquired(lock) => return Ok(lock),
                Attempt::Wait(delay) => std::thread::sleep(delay),
            }
        }
    }

    /// 與 [`FileLock::acquire`] 相同，但以 tokio 計時器等待，不佔住 worker 執行緒
    pub async fn acquire_async(
        db_path: &Path,
        operation: &str,
        options: LockOptions,
    ) -> Result<Self> {
        let mut waiter = LockWaiter::new(db_path, options);
        loop {
            match waiter.attempt(operation)? {
                Attempt::Acquired(lock) => return Ok(lock),
                Attempt::Wait(delay) => tokio::time::sleep(delay).await,
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = fs::remove_file(&self.path) {
                if e.kind() != ErrorKind::NotFound {
                    tracing::warn!("Failed to remove lock {}: {}", self.path.display(), e);
                }
            }
        }
    }
}

enum Attempt {
    Acquired(FileLock),
    Wait(Duration),
}

/// 單次取得鎖的嘗試與等待狀態；同步與 async 版本共用
struct LockWaiter {
    path: PathBuf,
    options: LockOptions,
    started: Instant,
    corrupt_seen: bool,
}

impl LockWaiter {
    fn new(db_path: &Path, options: LockOptions) -> Self {
        Self {
            path: FileLock::lock_path_for(db_path),
            options,
            started: Instant::now(),
            corrupt_seen: false,
        }
    }

    fn attempt(&mut self, operation: &str) -> Result<Attempt> {
        loop {
            if let Some(lock) = self.try_create(operation)? {
                return Ok(Attempt::Acquired(lock));
            }

            let holder = read_holder(&self.path);
            let stale = match &holder {
                Some(info) => !pid_alive(info.pid),
                None if self.corrupt_seen => true,
                None => {
                    self.corrupt_seen = true;
                    false
                }
            };

            if stale {
                tracing::warn!(
                    "Reclaiming stale lock {} (holder pid {:?})",
                    self.path.display(),
                    holder.as_ref().map(|h| h.pid)
                );
                match fs::remove_file(&self.path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                self.corrupt_seen = false;
                continue;
            }

            let waited = self.started.elapsed();
            if waited >= self.options.timeout {
                return Err(MigrationError::LockTimeout {
                    path: self.path.display().to_string(),
                    holder_pid: holder.map(|h| h.pid),
                    waited_ms: waited.as_millis() as u64,
                });
            }
            return Ok(Attempt::Wait(
                self.options.poll_interval.min(self.options.timeout - waited),
            ));
        }
    }

    fn try_create(&self, operation: &str) -> Result<Option<FileLock>> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let info = LockInfo {
            pid: std::process::id(),
            created_at: Utc::now(),
            operation: operation.to_string(),
        };
        let written = serde_json::to_vec(&info)
            .map_err(MigrationError::from)
            .and_then(|body| {
                file.write_all(&body)?;
                file.sync_all()?;
                Ok(())
            });
        if let Err(e) = written {
            let _ = fs::remove_file(&self.path);
            return Err(e);
        }
        tracing::debug!("Acquired lock {}", self.path.display());
        Ok(Some(FileLock {
            path: self.path.clone(),
            released: false,
        }))
    }
}

pub fn read_holder(lock_path: &Path) -> Option<LockInfo> {
    let body = fs::read(lock_path).ok()?;
    serde_json::from_slice(&body).ok()
}

pub fn pid_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_some()
}
