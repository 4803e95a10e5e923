use crate::adapters::host::DEFAULT_HOST_PROCESSES;
use crate::core::inserter::HARD_MAX_BATCH_SIZE;
use crate::core::lock::LockOptions;
use crate::core::matcher::PatternSet;
use crate::core::rules::RuleSet;
use crate::core::store::TableName;
use crate::domain::model::{ConflictStrategy, Pattern, TransformationRule, ValidationMode};
use crate::utils::error::{MigrationError, Result};
use crate::utils::validation::{
    validate_non_empty_string, validate_path, validate_positive_number, validate_range,
    validate_unique, Validate,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

/// `--config` 未指定時使用的內建設定
pub const DEFAULT_CONFIG: &str = r#"
[migration]
name = "telemetry-reset"
table = "ItemTable"
conflict_strategy = "replace"

[[rules]]
name = "machine-id"
pattern = { kind = "contains", value = "machineId" }
action = "replace_id"
id_type = "hex64"
target = "both"

[[rules]]
name = "dev-device-id"
pattern = { kind = "contains", value = "devDeviceId" }
action = "replace_id"
id_type = "uuid_v4"
target = "value"

[[rules]]
name = "sqm-id"
pattern = { kind = "contains", value = "sqmId" }
action = "replace_id"
id_type = "uuid_v4"
target = "value"

[[rules]]
name = "session-id"
pattern = { kind = "contains", value = "sessionId" }
action = "replace_id"
id_type = "session_id"
target = "value"

[[rules]]
name = "purge-extension-state"
pattern = { kind = "regex", value = "(?i)augment|context7", scope = "key" }
action = "delete"
"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    pub migration: MigrationSection,
    /// 額外的擷取 pattern；規則的 pattern 會自動加入
    #[serde(default)]
    pub patterns: Vec<Pattern>,
    #[serde(default)]
    pub rules: Vec<TransformationRule>,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub performance: PerformanceConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub host: HostConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationSection {
    pub name: String,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,
    /// 0 代表不設期限
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    #[serde(default = "default_phase_retries")]
    pub phase_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_preview_limit")]
    pub preview_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_size")]
    pub initial_size: usize,
    #[serde(default = "default_min_batch_size")]
    pub min_size: usize,
    #[serde(default = "default_batch_size")]
    pub max_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            initial_size: default_batch_size(),
            min_size: default_min_batch_size(),
            max_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    #[serde(default = "default_threshold_pct")]
    pub memory_threshold_pct: f32,
    #[serde(default = "default_threshold_pct")]
    pub cpu_threshold_pct: f32,
    #[serde(default = "default_true")]
    pub bulk_pragmas: bool,
    #[serde(default = "default_sample_interval_secs")]
    pub sample_interval_secs: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            memory_threshold_pct: default_threshold_pct(),
            cpu_threshold_pct: default_threshold_pct(),
            bulk_pragmas: true,
            sample_interval_secs: default_sample_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default)]
    pub mode: ValidationMode,
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
    /// 殘留檢查使用的來源名稱，不分大小寫比對 key 與 value
    #[serde(default = "default_residual_patterns")]
    pub residual_patterns: Vec<String>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            mode: ValidationMode::Full,
            sample_size: default_sample_size(),
            residual_patterns: default_residual_patterns(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_lock_poll_ms")]
    pub poll_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_lock_timeout_secs(),
            poll_interval_ms: default_lock_poll_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// 未設定時放在資料庫同層的 migration-backups/
    pub directory: Option<String>,
    #[serde(default = "default_backup_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backup_retry_ms")]
    pub retry_delay_ms: u64,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            directory: None,
            max_attempts: default_backup_attempts(),
            retry_delay_ms: default_backup_retry_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// 背景資源取樣；關閉時批次大小只依耗時調整
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default = "default_host_processes")]
    pub process_names: Vec<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            process_names: default_host_processes(),
        }
    }
}

fn default_table() -> String {
    "ItemTable".to_string()
}

fn default_query_timeout_ms() -> u64 {
    30_000
}

fn default_phase_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    1_000
}

fn default_preview_limit() -> usize {
    20
}

fn default_batch_size() -> usize {
    1_000
}

fn default_min_batch_size() -> usize {
    100
}

fn default_threshold_pct() -> f32 {
    80.0
}

fn default_true() -> bool {
    true
}

fn default_sample_interval_secs() -> u64 {
    5
}

fn default_sample_size() -> usize {
    crate::core::validator::DEFAULT_SAMPLE_SIZE
}

fn default_residual_patterns() -> Vec<String> {
    ["machineId", "deviceId", "sqmId", "uuid", "session"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_lock_timeout_secs() -> u64 {
    30
}

fn default_lock_poll_ms() -> u64 {
    1_000
}

fn default_backup_attempts() -> u32 {
    5
}

fn default_backup_retry_ms() -> u64 {
    500
}

fn default_host_processes() -> Vec<String> {
    DEFAULT_HOST_PROCESSES.iter().map(|s| s.to_string()).collect()
}

impl MigrationConfig {
    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            MigrationError::config(format!(
                "cannot read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// 從 TOML 字串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = Self::substitute_env_vars(content);

        toml::from_str(&processed_content)
            .map_err(|e| MigrationError::config(format!("TOML parsing error: {}", e)))
    }

    pub fn builtin() -> Result<Self> {
        Self::from_toml_str(DEFAULT_CONFIG)
    }

    /// 替換環境變數 (例如 ${BACKUP_DIR})；未定義的變數保留原樣
    fn substitute_env_vars(content: &str) -> String {
        static ENV_VAR: OnceLock<Option<Regex>> = OnceLock::new();
        let Some(re) = ENV_VAR
            .get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").ok())
            .as_ref()
        else {
            return content.to_string();
        };

        re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
        })
        .into_owned()
    }

    pub fn table_name(&self) -> Result<TableName> {
        TableName::parse(&self.migration.table)
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        match self.migration.query_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.migration.retry_backoff_ms)
    }

    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            timeout: Duration::from_secs(self.lock.timeout_secs),
            poll_interval: Duration::from_millis(self.lock.poll_interval_ms),
        }
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.performance.sample_interval_secs)
    }

    /// 擷取用 pattern：`[[patterns]]` 加上啟用中規則的 pattern，去除重複
    pub fn extraction_patterns(&self) -> Vec<Pattern> {
        let mut patterns: Vec<Pattern> = Vec::new();
        let from_rules = self
            .rules
            .iter()
            .filter(|r| r.enabled)
            .map(|r| &r.pattern);
        for pattern in self.patterns.iter().chain(from_rules) {
            if !patterns.contains(pattern) {
                patterns.push(pattern.clone());
            }
        }
        patterns
    }

    pub fn residual_markers(&self) -> Vec<String> {
        self.validation.residual_patterns.clone()
    }

    /// 驗證配置的合理性
    pub fn validate_config(&self) -> Result<()> {
        validate_non_empty_string("migration.name", &self.migration.name)?;
        self.table_name()?;

        if self.patterns.is_empty() && self.rules.is_empty() {
            return Err(MigrationError::config(
                "at least one [[patterns]] or [[rules]] entry is required",
            ));
        }
        validate_unique("rules.name", self.rules.iter().map(|r| r.name.as_str()))?;
        PatternSet::compile(&self.extraction_patterns())?;
        for marker in &self.validation.residual_patterns {
            validate_non_empty_string("validation.residual_patterns", marker)?;
        }
        RuleSet::compile(&self.rules)?;

        validate_positive_number("batch.min_size", self.batch.min_size, 1)?;
        validate_range("batch.max_size", self.batch.max_size, 1, HARD_MAX_BATCH_SIZE)?;
        validate_range(
            "batch.initial_size",
            self.batch.initial_size,
            self.batch.min_size,
            self.batch.max_size,
        )?;

        validate_range(
            "performance.memory_threshold_pct",
            self.performance.memory_threshold_pct,
            1.0,
            100.0,
        )?;
        validate_range(
            "performance.cpu_threshold_pct",
            self.performance.cpu_threshold_pct,
            1.0,
            100.0,
        )?;
        validate_positive_number(
            "performance.sample_interval_secs",
            self.performance.sample_interval_secs as usize,
            1,
        )?;

        validate_positive_number("validation.sample_size", self.validation.sample_size, 1)?;
        validate_positive_number("lock.poll_interval_ms", self.lock.poll_interval_ms as usize, 1)?;
        validate_positive_number("backup.max_attempts", self.backup.max_attempts as usize, 1)?;
        if let Some(directory) = &self.backup.directory {
            validate_path("backup.directory", directory)?;
        }

        Ok(())
    }
}

impl Validate for MigrationConfig {
    fn validate(&self) -> Result<()> {
        self.validate_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{IdType, MatchScope, PatternKind, RuleAction, RuleTarget};
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_builtin_config_is_valid() {
        let config = MigrationConfig::builtin().unwrap();
        assert!(config.validate().is_ok());

        assert_eq!(config.migration.table, "ItemTable");
        assert_eq!(config.migration.conflict_strategy, ConflictStrategy::Replace);
        assert_eq!(config.rules.len(), 5);
        assert_eq!(config.rules[4].action, RuleAction::Delete);
        assert_eq!(config.rules[4].pattern.scope, MatchScope::Key);
        assert_eq!(config.rules[0].target, RuleTarget::Both);
        assert_eq!(config.rules[1].id_type, IdType::UuidV4);
        assert_eq!(config.batch.max_size, 1000);
        assert_eq!(config.lock.timeout_secs, 30);
        assert_eq!(config.validation.mode, ValidationMode::Full);
        assert_eq!(config.query_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.extraction_patterns().len(), 5);
    }

    #[test]
    fn test_parse_full_document() {
        let toml_content = r#"
[migration]
name = "custom"
table = "kv"
conflict_strategy = "ignore"
query_timeout_ms = 0

[[patterns]]
kind = "starts_with"
value = "trial."

[[rules]]
name = "device"
pattern = { kind = "json_path", value = "$.telemetry.devDeviceId" }
action = "replace_id"
id_type = "uuid"

[[rules]]
name = "lower"
pattern = { kind = "regex", value = "^Cache\\." }
action = "transform_value"
transform = "lowercase"

[batch]
initial_size = 200
min_size = 50
max_size = 5000

[validation]
mode = "basic"
residual_patterns = ["deviceId"]
"#;

        let config = MigrationConfig::from_toml_str(toml_content).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.migration.conflict_strategy, ConflictStrategy::Ignore);
        assert_eq!(config.query_timeout(), None);
        assert_eq!(config.patterns[0].kind, PatternKind::StartsWith);
        assert_eq!(config.extraction_patterns().len(), 3);
        assert_eq!(config.validation.mode, ValidationMode::Basic);
        assert_eq!(config.residual_markers(), vec!["deviceId".to_string()]);
    }

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("KVSTATE_TEST_TABLE", "FromEnv");

        let toml_content = r#"
[migration]
name = "env"
table = "${KVSTATE_TEST_TABLE}"

[[patterns]]
kind = "contains"
value = "${KVSTATE_UNSET_VARIABLE}"
"#;

        let config = MigrationConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.migration.table, "FromEnv");
        assert_eq!(config.patterns[0].value, "${KVSTATE_UNSET_VARIABLE}");

        std::env::remove_var("KVSTATE_TEST_TABLE");
    }

    #[test]
    fn test_config_validation_rejects_bad_values() {
        let base = MigrationConfig::builtin().unwrap();

        let mut config = base.clone();
        config.batch.max_size = 20_000;
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.migration.table = "Item Table".to_string();
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.rules[0].pattern = Pattern::new(PatternKind::Regex, "(");
        assert!(matches!(
            config.validate(),
            Err(MigrationError::InvalidPattern { .. })
        ));

        let mut config = base.clone();
        config.rules[1].name = config.rules[0].name.clone();
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.validation.residual_patterns.push(String::new());
        assert!(config.validate().is_err());

        let mut config = base;
        config.rules.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_schema_violation_is_config_error() {
        let result = MigrationConfig::from_toml_str(
            r#"
[migration]
name = "x"
conflict_strategy = "merge"
"#,
        );
        let err = result.unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_config_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(DEFAULT_CONFIG.as_bytes()).unwrap();

        let config = MigrationConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(config.migration.name, "telemetry-reset");
        assert!(MigrationConfig::from_file("/definitely/missing.toml").is_err());
    }
}
