use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 欄位在儲存引擎中的原始型別；寫回時沿用，避免 NULL 或數值被改存成 TEXT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    #[default]
    Text,
    Blob,
    Integer,
    Real,
    Null,
}

/// 鍵值表中的一列；value 可能是純量或序列化後的 JSON 物件
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    /// 文字形式；NULL 為空字串
    pub value: String,
    #[serde(default)]
    pub value_type: ValueType,
}

impl Record {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::typed(key, value, ValueType::Text)
    }

    pub fn typed(key: impl Into<String>, value: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            value_type,
        }
    }

    /// 改寫 value；BLOB 維持 BLOB，其餘改存 TEXT
    pub fn set_value(&mut self, value: String) {
        self.value = value;
        if self.value_type != ValueType::Blob {
            self.value_type = ValueType::Text;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    Exact,
    Contains,
    StartsWith,
    EndsWith,
    Regex,
    JsonPath,
}

/// pattern 比對的欄位範圍；`Exact` 永遠只看 key，`JsonPath` 只看 value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchScope {
    #[default]
    Any,
    Key,
    Value,
}

impl MatchScope {
    pub fn includes_key(self) -> bool {
        self != MatchScope::Value
    }

    pub fn includes_value(self) -> bool {
        self != MatchScope::Key
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pattern {
    pub kind: PatternKind,
    pub value: String,
    #[serde(default)]
    pub scope: MatchScope,
}

impl Pattern {
    pub fn new(kind: PatternKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
            scope: MatchScope::Any,
        }
    }

    pub fn contains(value: impl Into<String>) -> Self {
        Self::new(PatternKind::Contains, value)
    }

    pub fn in_scope(mut self, scope: MatchScope) -> Self {
        self.scope = scope;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    ReplaceId,
    TransformValue,
    /// 刪除整列，不寫回
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdType {
    #[default]
    Hex64,
    #[serde(rename = "uuid_v4", alias = "uuid")]
    UuidV4,
    SessionId,
}

impl fmt::Display for IdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdType::Hex64 => write!(f, "hex64"),
            IdType::UuidV4 => write!(f, "uuid_v4"),
            IdType::SessionId => write!(f, "session_id"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleTarget {
    Key,
    #[default]
    Value,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueTransform {
    Uppercase,
    Lowercase,
    Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformationRule {
    pub name: String,
    pub pattern: Pattern,
    pub action: RuleAction,
    #[serde(default)]
    pub id_type: IdType,
    #[serde(default)]
    pub target: RuleTarget,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 僅 TransformValue 使用
    #[serde(default)]
    pub transform: Option<ValueTransform>,
}

fn default_enabled() -> bool {
    true
}

/// 單一批次的寫入結果，由 orchestrator 彙總；`failed` 為重試用盡後仍失敗的批次紀錄數
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub attempted: usize,
    pub inserted: usize,
    pub conflicts: usize,
    pub failed: usize,
}

impl BatchResult {
    pub fn merge(&mut self, other: &BatchResult) {
        self.attempted += other.attempted;
        self.inserted += other.inserted;
        self.conflicts += other.conflicts;
        self.failed += other.failed;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    Ignore,
    #[default]
    Replace,
    Update,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxState {
    Active,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Savepoint {
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    Basic,
    #[default]
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckName {
    Integrity,
    RecordCount,
    DataFormat,
    KeyUniqueness,
    ValueValidity,
    TransformationAccuracy,
}

impl fmt::Display for CheckName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckOutcome {
    Passed,
    Warning,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: CheckName,
    pub outcome: CheckOutcome,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub checks_run: Vec<CheckName>,
    pub passed: usize,
    pub failed: usize,
    pub warnings: Vec<String>,
    pub overall_ok: bool,
    pub results: Vec<CheckResult>,
}

impl ValidationReport {
    pub fn failed_checks(&self) -> Vec<CheckName> {
        self.results
            .iter()
            .filter(|r| r.outcome == CheckOutcome::Failed)
            .map(|r| r.name)
            .collect()
    }

    pub fn result(&self, name: CheckName) -> Option<&CheckResult> {
        self.results.iter().find(|r| r.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    PreBackup,
    BeginTx,
    Extract,
    Transform,
    DeleteOriginals,
    Insert,
    Validate,
    Commit,
    Rollback,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::PreBackup => "pre_backup",
            Phase::BeginTx => "begin_tx",
            Phase::Extract => "extract",
            Phase::Transform => "transform",
            Phase::DeleteOriginals => "delete_originals",
            Phase::Insert => "insert",
            Phase::Validate => "validate",
            Phase::Commit => "commit",
            Phase::Rollback => "rollback",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Completed,
    Failed,
}

/// 每次階段轉換送往審計 sink 的事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseEvent {
    pub phase: Phase,
    pub status: PhaseStatus,
    pub duration_ms: u64,
    pub records_affected: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// 失敗後目標檔案的狀態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryState {
    /// 失敗發生在任何寫入之前
    Untouched,
    /// 交易回滾且檔案與備份逐位元組相同
    RolledBack,
    /// 回滾後檔案不一致，已由備份覆蓋
    RestoredFromBackup,
    Unrestored,
}

impl fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RecoveryState::Untouched => "untouched",
            RecoveryState::RolledBack => "rolled back, original bytes verified",
            RecoveryState::RestoredFromBackup => "restored from backup",
            RecoveryState::Unrestored => "unrestored",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationMode {
    #[default]
    Full,
    ExtractOnly,
    TransformOnly,
    InsertOnly,
    ValidateOnly,
}

impl fmt::Display for MigrationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MigrationMode::Full => "full",
            MigrationMode::ExtractOnly => "extract-only",
            MigrationMode::TransformOnly => "transform-only",
            MigrationMode::InsertOnly => "insert-only",
            MigrationMode::ValidateOnly => "validate-only",
        };
        f.write_str(name)
    }
}

impl FromStr for MigrationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "full" => Ok(MigrationMode::Full),
            "extract-only" => Ok(MigrationMode::ExtractOnly),
            "transform-only" => Ok(MigrationMode::TransformOnly),
            "insert-only" => Ok(MigrationMode::InsertOnly),
            "validate-only" => Ok(MigrationMode::ValidateOnly),
            other => Err(format!(
                "unknown mode '{}' (expected full, extract-only, transform-only, insert-only or validate-only)",
                other
            )),
        }
    }
}
