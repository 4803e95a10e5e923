use crate::core::identity::IdentityGenerator;
use crate::core::matcher::JsonPath;
use crate::domain::model::IdType;
use crate::domain::ports::{BackupId, IdSource, SnapshotStore};
use crate::utils::error::{MigrationError, Result};
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

struct TelemetryField {
    key: &'static str,
    id_type: IdType,
    /// 不存在時是否新增
    required: bool,
}

const FIELDS: [TelemetryField; 5] = [
    TelemetryField {
        key: "telemetry.machineId",
        id_type: IdType::Hex64,
        required: true,
    },
    TelemetryField {
        key: "telemetry.devDeviceId",
        id_type: IdType::UuidV4,
        required: true,
    },
    TelemetryField {
        key: "telemetry.sqmId",
        id_type: IdType::UuidV4,
        required: true,
    },
    TelemetryField {
        key: "telemetry.sessionId",
        id_type: IdType::SessionId,
        required: false,
    },
    TelemetryField {
        key: "telemetry.instanceId",
        id_type: IdType::UuidV4,
        required: false,
    },
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldChange {
    pub field: String,
    pub old: Option<String>,
    pub new: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TelemetryReset {
    pub path: PathBuf,
    pub changes: Vec<FieldChange>,
    pub backup_id: Option<BackupId>,
    pub written: bool,
}

/// 重設 JSON 設定檔中的遙測識別碼。
///
/// 欄位可以是平面的 `"telemetry.machineId"` 或巢狀的 `telemetry.machineId`；
/// 其他 key 的順序保持不變。`preview` 時只回報變更，不寫入也不建立快照。
pub fn reset_storage_json<S, I>(
    path: &Path,
    snapshots: &S,
    generator: &mut IdentityGenerator<I>,
    preview: bool,
) -> Result<TelemetryReset>
where
    S: SnapshotStore + ?Sized,
    I: IdSource,
{
    let content = fs::read_to_string(path)?;
    let mut doc: Value = serde_json::from_str(&content)?;
    if !doc.is_object() {
        return Err(MigrationError::config(format!(
            "{} is not a JSON object",
            path.display()
        )));
    }

    let mut changes = Vec::new();
    for field in &FIELDS {
        let new_id = match locate(&mut doc, field.key)? {
            Some(node) => {
                let old = match &*node {
                    Value::String(s) => Some(s.clone()),
                    Value::Null => None,
                    other => Some(other.to_string()),
                };
                let new_id = generator.generate(field.id_type)?;
                *node = Value::String(new_id.clone());
                changes.push(FieldChange {
                    field: field.key.to_string(),
                    old,
                    new: new_id.clone(),
                });
                new_id
            }
            None if field.required => {
                let new_id = generator.generate(field.id_type)?;
                if let Some(map) = doc.as_object_mut() {
                    map.insert(field.key.to_string(), Value::String(new_id.clone()));
                }
                changes.push(FieldChange {
                    field: field.key.to_string(),
                    old: None,
                    new: new_id.clone(),
                });
                new_id
            }
            None => continue,
        };
        tracing::debug!("{} -> {}", field.key, new_id);
    }

    if preview {
        return Ok(TelemetryReset {
            path: path.to_path_buf(),
            changes,
            backup_id: None,
            written: false,
        });
    }

    let backup_id = snapshots.create_snapshot(path)?;
    write_atomically(path, serde_json::to_string_pretty(&doc)?.as_bytes())?;
    tracing::info!(
        "Reset {} telemetry field(s) in {} (backup {})",
        changes.len(),
        path.display(),
        backup_id
    );

    Ok(TelemetryReset {
        path: path.to_path_buf(),
        changes,
        backup_id: Some(backup_id),
        written: true,
    })
}

/// 先找平面 key，再找巢狀路徑
fn locate<'a>(doc: &'a mut Value, key: &str) -> Result<Option<&'a mut Value>> {
    let flat = JsonPath::parse(&format!("$['{}']", key))?;
    if flat.lookup(doc).is_some() {
        return Ok(flat.lookup_mut(doc));
    }
    let nested = JsonPath::parse(&format!("$.{}", key))?;
    Ok(nested.lookup_mut(doc))
}

fn write_atomically(path: &Path, body: &[u8]) -> Result<()> {
    let mut staging = path.as_os_str().to_os_string();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);

    let written = fs::File::create(&staging).and_then(|mut file| {
        file.write_all(body)?;
        file.sync_all()
    });
    if let Err(e) = written {
        let _ = fs::remove_file(&staging);
        return Err(e.into());
    }
    fs::rename(&staging, path)?;
    Ok(())
}
