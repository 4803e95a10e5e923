#![allow(dead_code)]

use kvstate_migrate::adapters::{FileSnapshotStore, MemoryAuditSink};
use kvstate_migrate::core::store::{Store, TableName};
use kvstate_migrate::{MigrationConfig, MigrationOrchestrator};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub type TestOrchestrator = MigrationOrchestrator<FileSnapshotStore, Arc<MemoryAuditSink>>;

pub fn table() -> TableName {
    TableName::parse("ItemTable").unwrap()
}

/// 建立測試用的鍵值資料庫
pub fn seed_db(dir: &Path, rows: &[(&str, &str)]) -> PathBuf {
    let path = dir.join("state.vscdb");
    let store = Store::create(&path, &table()).unwrap();
    for (key, value) in rows {
        store
            .conn()
            .execute(
                "INSERT INTO ItemTable (key, value) VALUES (?1, ?2)",
                rusqlite::params![key, value],
            )
            .unwrap();
    }
    path
}

pub fn read_rows(path: &Path) -> Vec<(String, String)> {
    let store = Store::open_read_only(path, &table()).unwrap();
    let mut stmt = store
        .conn()
        .prepare("SELECT key, CAST(value AS TEXT) FROM ItemTable ORDER BY key")
        .unwrap();
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .unwrap()
        .collect::<Result<Vec<(String, String)>, _>>()
        .unwrap();
    rows
}

pub fn value_of(path: &Path, key: &str) -> Option<String> {
    Store::open_read_only(path, &table()).unwrap().get(key).unwrap()
}

/// 內建規則，關閉資源取樣並縮短退避
pub fn quiet_config() -> MigrationConfig {
    let mut config = MigrationConfig::builtin().unwrap();
    config.monitoring.enabled = false;
    config.migration.retry_backoff_ms = 10;
    config.backup.retry_delay_ms = 10;
    config
}

pub fn orchestrator(
    config: MigrationConfig,
    backup_dir: &Path,
) -> (TestOrchestrator, Arc<MemoryAuditSink>) {
    let audit = Arc::new(MemoryAuditSink::new());
    let orchestrator = MigrationOrchestrator::new(
        config,
        FileSnapshotStore::new(backup_dir),
        Arc::clone(&audit),
    )
    .unwrap();
    (orchestrator, audit)
}

/// 典型的遙測狀態：混合純量值、JSON 值與無關的設定
pub const TELEMETRY_ROWS: [(&str, &str); 8] = [
    ("telemetry.machineId", "4f1c2a9b0d8e"),
    (
        "machineId:legacy-7f3a",
        r#"{"machineId":"legacy-7f3a","installs":3}"#,
    ),
    (
        "telemetry.devDeviceId",
        "6c1e0f52-9a1b-4c3d-8e2f-0a1b2c3d4e5f",
    ),
    ("telemetry.sqmId", "9f2b1c3d-1111-2222-3333-444455556666"),
    ("workbench.sessionId", "s-81d2c7"),
    ("workbench.colorTheme", "Default Dark+"),
    ("editor.fontSize", "14"),
    ("history.recentlyOpened", r#"{"entries":[]}"#),
];

pub const OLD_IDS: [&str; 5] = [
    "4f1c2a9b0d8e",
    "legacy-7f3a",
    "6c1e0f52-9a1b-4c3d-8e2f-0a1b2c3d4e5f",
    "9f2b1c3d-1111-2222-3333-444455556666",
    "s-81d2c7",
];
