use crate::core::orchestrator::RunOptions;
use crate::domain::model::MigrationMode;
use crate::utils::error::{MigrationError, Result};
use crate::utils::validation::{validate_path, validate_positive_number, Validate};
use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "migrate")]
#[command(about = "Transactional identity reset for key/value SQLite state stores")]
pub struct CliConfig {
    /// 目標 SQLite 資料庫
    #[arg(long)]
    pub db: PathBuf,

    #[arg(
        long,
        default_value = "full",
        help = "full | extract-only | transform-only | insert-only | validate-only"
    )]
    pub mode: MigrationMode,

    #[arg(long, help = "Extract and transform only; never writes")]
    pub dry_run: bool,

    #[arg(long, help = "TOML configuration file (built-in rules when omitted)")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Also reset telemetry ids in this storage.json file")]
    pub storage_json: Option<PathBuf>,

    #[arg(long, help = "Run even if the host application appears to be running")]
    pub force: bool,

    #[arg(long, help = "Custom read-only SELECT returning key, value")]
    pub query: Option<String>,

    #[arg(long, help = "Maximum records to extract in preview modes")]
    pub limit: Option<usize>,

    #[arg(long, help = "Backup directory (overrides [backup].directory)")]
    pub backup_dir: Option<PathBuf>,

    #[arg(short, long, help = "Enable verbose output")]
    pub verbose: bool,

    #[arg(long, help = "Emit logs as JSON lines")]
    pub json_logs: bool,

    #[arg(long, help = "Print the final report as JSON on stdout")]
    pub json: bool,
}

impl CliConfig {
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            mode: self.mode,
            dry_run: self.dry_run,
            query: self.query.clone(),
            limit: self.limit,
            abort_after: None,
        }
    }
}

impl Validate for CliConfig {
    fn validate(&self) -> Result<()> {
        validate_path("db", &self.db.to_string_lossy())?;
        if let Some(config) = &self.config {
            if !config.is_file() {
                return Err(MigrationError::InvalidConfigValueError {
                    field: "config".to_string(),
                    value: config.display().to_string(),
                    reason: "file not found".to_string(),
                });
            }
        }
        if let Some(limit) = self.limit {
            validate_positive_number("limit", limit, 1)?;
        }
        if self.query.is_some() && self.mode == MigrationMode::ValidateOnly {
            return Err(MigrationError::config(
                "--query cannot be combined with --mode validate-only",
            ));
        }
        Ok(())
    }
}
