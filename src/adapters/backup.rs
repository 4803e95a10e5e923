use crate::core::store::file_digest;
use crate::domain::ports::{BackupId, SnapshotStore};
use crate::utils::error::{MigrationError, Result};
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};

const SNAPSHOT_EXT: &str = "bak";
const DIGEST_EXT: &str = "sha256";

/// SQLite 在目標旁可能留下的附屬檔；還原時必須一併清除
const SIDECAR_SUFFIXES: [&str; 3] = ["-journal", "-wal", "-shm"];

/// 以檔案複製實作的快照：先寫暫存檔再 rename，失敗的部分複本會被刪除
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    directory: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// 預設放在資料庫同層的 `migration-backups/`
    pub fn beside(db_path: &Path) -> Self {
        let parent = db_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        Self::new(parent.join("migration-backups"))
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn file_for(&self, id: &BackupId, ext: &str) -> Result<PathBuf> {
        let raw = id.as_str();
        if raw.is_empty() || raw.contains(['/', '\\']) || raw.starts_with('.') {
            return Err(MigrationError::backup(format!("invalid backup id '{}'", raw)));
        }
        Ok(self.directory.join(format!("{}.{}", raw, ext)))
    }

    fn new_id(source: &Path) -> BackupId {
        let stem = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "database".to_string());
        BackupId::new(format!(
            "{}-{}-{:08x}",
            stem,
            Utc::now().format("%Y%m%dT%H%M%S"),
            rand::random::<u32>()
        ))
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn create_snapshot(&self, source: &Path) -> Result<BackupId> {
        if !source.is_file() {
            return Err(MigrationError::backup(format!(
                "source {} is not a file",
                source.display()
            )));
        }
        fs::create_dir_all(&self.directory)?;

        let id = Self::new_id(source);
        let target = self.file_for(&id, SNAPSHOT_EXT)?;
        let partial = self.directory.join(format!(".{}.partial", id));

        let digest = match copy_verified(source, &partial) {
            Ok(digest) => digest,
            Err(e) => {
                let _ = fs::remove_file(&partial);
                return Err(e);
            }
        };
        fs::rename(&partial, &target)?;
        fs::write(self.file_for(&id, DIGEST_EXT)?, &digest)?;

        tracing::info!("Snapshot {} created ({})", id, &digest[..12]);
        Ok(id)
    }

    fn restore_snapshot(&self, id: &BackupId, target: &Path) -> Result<()> {
        let snapshot = self.snapshot_path(id)?;
        let expected = self.snapshot_digest(id)?;
        if file_digest(&snapshot)? != expected {
            return Err(MigrationError::backup(format!(
                "snapshot {} does not match its recorded digest",
                id
            )));
        }

        let mut staging = target.as_os_str().to_os_string();
        staging.push(".restore");
        let staging = PathBuf::from(staging);

        if let Err(e) = copy_verified(&snapshot, &staging) {
            let _ = fs::remove_file(&staging);
            return Err(e);
        }
        for suffix in SIDECAR_SUFFIXES {
            let mut sidecar = target.as_os_str().to_os_string();
            sidecar.push(suffix);
            let sidecar = PathBuf::from(sidecar);
            if sidecar.exists() {
                fs::remove_file(&sidecar)?;
            }
        }
        fs::rename(&staging, target)?;

        tracing::warn!("Restored {} from snapshot {}", target.display(), id);
        Ok(())
    }

    fn snapshot_digest(&self, id: &BackupId) -> Result<String> {
        let path = self.file_for(id, DIGEST_EXT)?;
        let digest = fs::read_to_string(&path)
            .map_err(|e| MigrationError::backup(format!("digest for {} unreadable: {}", id, e)))?;
        Ok(digest.trim().to_string())
    }

    fn snapshot_path(&self, id: &BackupId) -> Result<PathBuf> {
        let path = self.file_for(id, SNAPSHOT_EXT)?;
        if !path.is_file() {
            return Err(MigrationError::backup(format!("snapshot {} not found", id)));
        }
        Ok(path)
    }
}

/// 複製後比對雜湊，回傳雜湊值
fn copy_verified(from: &Path, to: &Path) -> Result<String> {
    fs::copy(from, to)?;
    fs::File::open(to)?.sync_all()?;
    let source_digest = file_digest(from)?;
    let copy_digest = file_digest(to)?;
    if source_digest != copy_digest {
        return Err(MigrationError::backup(format!(
            "copy of {} is incomplete",
            from.display()
        )));
    }
    Ok(copy_digest)
}
