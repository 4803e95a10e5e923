use crate::config::toml_config::MigrationConfig;
use crate::core::extractor::{sanitize_query, Extractor, RecordStream};
use crate::core::inserter::BatchInserter;
use crate::core::matcher::PatternSet;
use crate::core::performance::PerformanceController;
use crate::core::rules::{RuleEngine, RuleSet};
use crate::core::store::{file_digest, Store, TableName};
use crate::core::transaction::{Transaction, TransactionManager, TransactionOptions};
use crate::core::validator::{ConsistencyValidator, ResidualReference, ValidationReference};
use crate::domain::model::{
    BatchResult, CheckName, CheckOutcome, ConflictStrategy, MigrationMode, Phase,
    PhaseEvent, PhaseStatus, Record, RecoveryState, ValidationMode, ValidationReport,
};
use crate::domain::ports::{AuditSink, BackupId, SnapshotStore};
use crate::utils::error::{MigrationError, Result};
use crate::utils::monitor::ResourceSampler;
use crate::utils::validation::Validate;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const DELETE_SAVEPOINT: &str = "phase_delete";

/// 單次執行的選項（由 CLI 組成）
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub mode: MigrationMode,
    pub dry_run: bool,
    /// 自訂擷取查詢，會先經過 sanitizer
    pub query: Option<String>,
    /// 僅在唯讀預覽時生效
    pub limit: Option<usize>,
    /// 在指定階段完成後強制失敗，用來演練回滾與還原
    pub abort_after: Option<Phase>,
}

impl RunOptions {
    pub fn new(mode: MigrationMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    fn is_transactional(&self) -> bool {
        !self.dry_run && matches!(self.mode, MigrationMode::Full | MigrationMode::InsertOnly)
    }
}

/// 單筆紀錄的前後對照，供預覽與報表使用
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordChange {
    pub original_key: String,
    pub key: String,
    pub old_value: String,
    pub new_value: String,
    pub rules: Vec<String>,
    /// 被刪除規則命中
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub mode: MigrationMode,
    pub dry_run: bool,
    pub db_path: PathBuf,
    pub extracted: usize,
    pub scanned: usize,
    pub transformed: usize,
    pub rules_applied: usize,
    pub deleted: usize,
    /// 被刪除規則移除、不寫回的列
    pub purged: usize,
    pub insert: BatchResult,
    pub batches: usize,
    pub pre_validation: Option<ValidationReport>,
    pub validation: Option<ValidationReport>,
    pub backup_id: Option<String>,
    pub transaction_id: Option<String>,
    pub committed: bool,
    pub events: Vec<PhaseEvent>,
    /// 受 `preview_limit` 限制
    pub changes: Vec<RecordChange>,
    /// extract-only 模式的擷取樣本
    pub preview: Vec<Record>,
    pub duration_ms: u64,
}

impl MigrationReport {
    fn new(db_path: &Path, options: &RunOptions) -> Self {
        Self {
            mode: options.mode,
            dry_run: options.dry_run,
            db_path: db_path.to_path_buf(),
            extracted: 0,
            scanned: 0,
            transformed: 0,
            rules_applied: 0,
            deleted: 0,
            purged: 0,
            insert: BatchResult::default(),
            batches: 0,
            pre_validation: None,
            validation: None,
            backup_id: None,
            transaction_id: None,
            committed: false,
            events: Vec::new(),
            changes: Vec::new(),
            preview: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn validation_ok(&self) -> bool {
        self.validation.as_ref().map_or(true, |v| v.overall_ok)
    }

    pub fn phase_event(&self, phase: Phase) -> Option<&PhaseEvent> {
        self.events.iter().find(|e| e.phase == phase)
    }
}

/// 轉換階段的彙總
#[derive(Debug, Default)]
struct TransformOutput {
    /// 需要寫回的紀錄（只含有變動且非刪除者）
    records: Vec<Record>,
    /// 需要先刪除的原始鍵
    delete_keys: Vec<String>,
    purged: usize,
    changes: Vec<RecordChange>,
    transformed: usize,
    rules_applied: usize,
    replaced: Vec<String>,
}

struct PhaseTimer {
    phase: Phase,
    started_at: DateTime<Utc>,
    start: Instant,
}

impl PhaseTimer {
    fn start(phase: Phase) -> Self {
        tracing::info!("▶ {} started", phase);
        Self {
            phase,
            started_at: Utc::now(),
            start: Instant::now(),
        }
    }

    fn finish(self, status: PhaseStatus, records_affected: usize) -> PhaseEvent {
        let elapsed = self.start.elapsed();
        match status {
            PhaseStatus::Completed => tracing::info!(
                "✅ {} completed in {:?} ({} records)",
                self.phase,
                elapsed,
                records_affected
            ),
            PhaseStatus::Failed => tracing::warn!("❌ {} failed after {:?}", self.phase, elapsed),
        }
        PhaseEvent {
            phase: self.phase,
            status,
            duration_ms: elapsed.as_millis() as u64,
            records_affected,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

/// 依序執行 PreBackup → BeginTx → Extract → Transform → DeleteOriginals → Insert →
/// Validate → Commit；任何階段失敗都會回滾，必要時以備份覆蓋目標檔案。
pub struct MigrationOrchestrator<S: SnapshotStore, A: AuditSink> {
    config: MigrationConfig,
    table: TableName,
    patterns: PatternSet,
    residual_markers: Vec<String>,
    rules: RuleSet,
    snapshots: S,
    audit: A,
    transactions: TransactionManager,
    engine: RuleEngine,
    extractor: Extractor,
    inserter: BatchInserter,
    validator: ConsistencyValidator,
    performance: PerformanceController,
    sampler: ResourceSampler,
}

impl<S: SnapshotStore, A: AuditSink> MigrationOrchestrator<S, A> {
    pub fn new(config: MigrationConfig, snapshots: S, audit: A) -> Result<Self> {
        config.validate()?;

        let table = config.table_name()?;
        let patterns = PatternSet::compile(&config.extraction_patterns())?;
        let rules = RuleSet::compile(&config.rules)?;
        let timeout = config.query_timeout();

        let transactions = TransactionManager::new(TransactionOptions {
            lock: config.lock_options(),
            bulk_pragmas: config.performance.bulk_pragmas,
            operation: format!("migrate:{}", config.migration.name),
        });
        let performance = PerformanceController::new(
            config.batch.min_size,
            config.batch.max_size,
            config.performance.memory_threshold_pct,
            config.performance.cpu_threshold_pct,
        );

        Ok(Self {
            table,
            patterns,
            residual_markers: config.residual_markers(),
            rules,
            snapshots,
            audit,
            transactions,
            engine: RuleEngine::new(),
            extractor: Extractor::new(timeout),
            inserter: BatchInserter::new(config.batch.max_size, timeout),
            validator: ConsistencyValidator::new(config.validation.sample_size, timeout),
            performance,
            sampler: ResourceSampler::new(config.sample_interval()),
            config,
        })
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn snapshots(&self) -> &S {
        &self.snapshots
    }

    pub async fn run(&mut self, db_path: &Path, options: &RunOptions) -> Result<MigrationReport> {
        if !db_path.is_file() {
            return Err(MigrationError::InvalidConfigValueError {
                field: "db".to_string(),
                value: db_path.display().to_string(),
                reason: "database file not found".to_string(),
            });
        }
        if let Some(query) = &options.query {
            sanitize_query(query)?;
        }

        tracing::info!(
            "Starting migration '{}' on {} (mode: {}, dry run: {})",
            self.config.migration.name,
            db_path.display(),
            options.mode,
            options.dry_run
        );

        let started = Instant::now();
        let mut report = MigrationReport::new(db_path, options);

        if self.config.monitoring.enabled {
            self.sampler.start();
        }

        let outcome = if options.mode == MigrationMode::ValidateOnly {
            self.run_validate_only(db_path, &mut report)
        } else if options.is_transactional() {
            self.run_transactional(db_path, options, &mut report).await
        } else {
            self.run_preview(db_path, options, &mut report)
        };

        self.sampler.log_stats("migration");
        self.sampler.stop().await;
        report.duration_ms = started.elapsed().as_millis() as u64;

        outcome.map(|_| {
            tracing::info!(
                "Migration finished in {}ms: {} extracted, {} transformed, {} inserted",
                report.duration_ms,
                report.extracted,
                report.transformed,
                report.insert.inserted
            );
            report
        })
    }

    /// 唯讀路徑：extract-only、transform-only 與所有 dry run
    fn run_preview(
        &mut self,
        db_path: &Path,
        options: &RunOptions,
        report: &mut MigrationReport,
    ) -> Result<()> {
        let store = Store::open_read_only(db_path, &self.table)?;

        let timer = PhaseTimer::start(Phase::Extract);
        let extracted = self.extract_from(&store, options.query.as_deref(), options.limit);
        let stream = self.settle(report, timer, extracted, RecordStream::len)?;
        report.extracted = stream.len();
        report.scanned = stream.scanned;

        if options.mode == MigrationMode::ExtractOnly {
            report.preview = stream
                .records
                .iter()
                .take(self.config.migration.preview_limit)
                .cloned()
                .collect();
            return Ok(());
        }

        let timer = PhaseTimer::start(Phase::Transform);
        let transformed = self.transform_all(&stream.records);
        let output = self.settle(report, timer, transformed, |o| o.transformed)?;
        report.transformed = output.transformed;
        report.rules_applied = output.rules_applied;
        report.purged = output.purged;
        report.changes = output.changes;

        if options.dry_run {
            tracing::info!(
                "💡 Dry run: {} of {} records would change; nothing was written",
                report.transformed,
                report.extracted
            );
        }
        Ok(())
    }

    fn run_validate_only(&mut self, db_path: &Path, report: &mut MigrationReport) -> Result<()> {
        let store = Store::open_read_only(db_path, &self.table)?;

        let timer = PhaseTimer::start(Phase::Validate);
        // 沒有舊值可比，靠標記與規則辨認未遷移的列
        let reference = ValidationReference {
            expected_rows: None,
            residuals: Some(ResidualReference {
                markers: self.residual_markers.clone(),
                rules: self.rules.clone(),
                old_values: Vec::new(),
            }),
        };
        let validated = self
            .validator
            .validate(&store, ValidationMode::Full, Some(&reference));
        let validation = self.settle(report, timer, validated, |_| 0)?;
        if !validation.overall_ok {
            tracing::error!("Validation failed: {:?}", validation.failed_checks());
        }
        report.validation = Some(validation);
        Ok(())
    }

    async fn run_transactional(
        &mut self,
        db_path: &Path,
        options: &RunOptions,
        report: &mut MigrationReport,
    ) -> Result<()> {
        let orphans = self.transactions.cleanup_orphaned();
        if orphans > 0 {
            tracing::warn!("Rolled back {} orphaned transaction(s)", orphans);
        }
        if options.limit.is_some() {
            tracing::warn!("--limit only applies to previews; migrating every matching record");
        }

        let timer = PhaseTimer::start(Phase::PreBackup);
        let backup = self.create_backup(db_path).await;
        let backup_id = self
            .settle(report, timer, backup, |_| 1)
            .map_err(|e| self.abort_untouched(report, Phase::PreBackup, e))?;
        report.backup_id = Some(backup_id.to_string());

        let original_digest = self
            .snapshots
            .snapshot_digest(&backup_id)
            .map_err(|e| self.abort_untouched(report, Phase::PreBackup, e))?;
        let pre_rows = match self.pre_validate(&backup_id) {
            Ok((validation, rows)) => {
                report.pre_validation = Some(validation);
                rows
            }
            Err(e) => return Err(self.abort_untouched(report, Phase::PreBackup, e)),
        };
        rehearse(options, Phase::PreBackup)
            .map_err(|e| self.abort_untouched(report, Phase::PreBackup, e))?;

        let timer = PhaseTimer::start(Phase::BeginTx);
        let begun = self.transactions.begin_async(db_path, &self.table).await;
        let tx_id = self
            .settle(report, timer, begun, |_| 0)
            .map_err(|e| self.abort_untouched(report, Phase::BeginTx, e))?;
        report.transaction_id = Some(tx_id.clone());

        let body = self.run_phases(&tx_id, options, pre_rows, report).await;
        let (phase, cause) = match body {
            Ok(()) => {
                let inserted = report.insert.inserted;
                let timer = PhaseTimer::start(Phase::Commit);
                let committed = self.transactions.commit(&tx_id);
                match self.settle(report, timer, committed, |_| inserted) {
                    Ok(()) => {
                        report.committed = true;
                        return Ok(());
                    }
                    Err(e) => (Phase::Commit, e),
                }
            }
            Err(failure) => failure,
        };

        Err(self.recover(db_path, &tx_id, &backup_id, &original_digest, phase, cause, report))
    }

    /// BeginTx 之後的階段；錯誤附帶失敗的階段
    async fn run_phases(
        &mut self,
        tx_id: &str,
        options: &RunOptions,
        pre_rows: u64,
        report: &mut MigrationReport,
    ) -> std::result::Result<(), (Phase, MigrationError)> {
        rehearse(options, Phase::BeginTx).map_err(|e| (Phase::BeginTx, e))?;

        let timer = PhaseTimer::start(Phase::Extract);
        let extracted = self.extract_in_tx(tx_id, options.query.as_deref()).await;
        let stream = self
            .settle(report, timer, extracted, RecordStream::len)
            .map_err(|e| (Phase::Extract, e))?;
        report.extracted = stream.len();
        report.scanned = stream.scanned;
        rehearse(options, Phase::Extract).map_err(|e| (Phase::Extract, e))?;

        let timer = PhaseTimer::start(Phase::Transform);
        let transformed = self.transform_all(&stream.records);
        let output = self
            .settle(report, timer, transformed, |o| o.transformed)
            .map_err(|e| (Phase::Transform, e))?;
        report.transformed = output.transformed;
        report.rules_applied = output.rules_applied;
        rehearse(options, Phase::Transform).map_err(|e| (Phase::Transform, e))?;

        if options.mode == MigrationMode::Full {
            let timer = PhaseTimer::start(Phase::DeleteOriginals);
            let deleted = self.delete_originals(tx_id, &output.delete_keys).await;
            let deleted = self
                .settle(report, timer, deleted, |n| *n)
                .map_err(|e| (Phase::DeleteOriginals, e))?;
            report.deleted = deleted;
            report.purged = output.purged;
            rehearse(options, Phase::DeleteOriginals).map_err(|e| (Phase::DeleteOriginals, e))?;
        } else if output.purged > 0 {
            tracing::warn!(
                "⚠️ {} record(s) match purge rules; insert-only mode leaves them in place",
                output.purged
            );
        }

        let timer = PhaseTimer::start(Phase::Insert);
        let mut insert = BatchResult::default();
        let inserted = self
            .insert_all(tx_id, &output.records, &mut report.batches, &mut insert)
            .await;
        let count = insert.inserted;
        report.insert = insert;
        self.settle(report, timer, inserted, |_| count)
            .map_err(|e| (Phase::Insert, e))?;
        rehearse(options, Phase::Insert).map_err(|e| (Phase::Insert, e))?;

        let reference = ValidationReference {
            expected_rows: Some(expected_rows(
                pre_rows,
                report.deleted,
                &report.insert,
                self.config.migration.conflict_strategy,
            )),
            residuals: Some(ResidualReference {
                markers: self.residual_markers.clone(),
                rules: self.rules.clone(),
                old_values: output.replaced,
            }),
        };
        let mode = match options.mode {
            MigrationMode::InsertOnly => ValidationMode::Basic,
            _ => self.config.validation.mode,
        };

        let timer = PhaseTimer::start(Phase::Validate);
        let validated = self
            .transactions
            .transaction(tx_id)
            .and_then(|tx| self.validator.validate(tx.store(), mode, Some(&reference)))
            .and_then(|validation| {
                if validation.overall_ok {
                    Ok(validation)
                } else {
                    let failed = validation.failed_checks();
                    let details = validation
                        .results
                        .iter()
                        .filter(|r| r.outcome == CheckOutcome::Failed)
                        .map(|r| format!("{}: {}", r.name, r.message))
                        .collect::<Vec<_>>()
                        .join("; ");
                    Err(MigrationError::ValidationFailed {
                        failed: failed.len(),
                        details,
                    })
                }
            });
        let validation = self
            .settle(report, timer, validated, |_| 0)
            .map_err(|e| (Phase::Validate, e))?;
        report.validation = Some(validation);
        report.changes = output.changes;
        rehearse(options, Phase::Validate).map_err(|e| (Phase::Validate, e))?;

        Ok(())
    }

    fn extract_from(
        &self,
        store: &Store,
        query: Option<&str>,
        limit: Option<usize>,
    ) -> Result<RecordStream> {
        match query {
            Some(query) => self.extractor.extract_query(store, query, limit),
            None => self.extractor.extract(store, &self.patterns, limit),
        }
    }

    async fn extract_in_tx(&self, tx_id: &str, query: Option<&str>) -> Result<RecordStream> {
        let Self {
            config,
            transactions,
            extractor,
            patterns,
            ..
        } = self;

        with_retries(
            Phase::Extract,
            config.migration.phase_retries,
            config.retry_backoff(),
            || {
                let tx = transactions.transaction(tx_id)?;
                match query {
                    Some(query) => extractor.extract_query(tx.store(), query, None),
                    None => extractor.extract(tx.store(), patterns, None),
                }
            },
        )
        .await
    }

    /// 套用規則集；任一紀錄失敗則整個階段失敗。只有變動過的紀錄會被刪除與重寫。
    fn transform_all(&mut self, records: &[Record]) -> Result<TransformOutput> {
        let preview_limit = self.config.migration.preview_limit;
        let mut output = TransformOutput::default();

        for record in records {
            let transformed = self.engine.apply(record, &self.rules)?;
            if !transformed.is_changed() {
                continue;
            }
            output.transformed += 1;
            output.rules_applied += transformed.applied;
            if output.changes.len() < preview_limit {
                output.changes.push(RecordChange {
                    original_key: record.key.clone(),
                    key: transformed.record.key.clone(),
                    old_value: record.value.clone(),
                    new_value: transformed.record.value.clone(),
                    rules: transformed.applied_rules.clone(),
                    deleted: transformed.purge,
                });
            }
            for token in transformed.replaced {
                if !output.replaced.contains(&token) {
                    output.replaced.push(token);
                }
            }
            output.delete_keys.push(record.key.clone());
            if transformed.purge {
                output.purged += 1;
            } else {
                output.records.push(transformed.record);
            }
        }

        tracing::debug!(
            "Transformed {} of {} records ({} rule applications, {} purged)",
            output.transformed,
            records.len(),
            output.rules_applied,
            output.purged
        );
        Ok(output)
    }

    async fn delete_originals(&mut self, tx_id: &str, keys: &[String]) -> Result<usize> {
        let Self {
            config,
            transactions,
            table,
            ..
        } = self;
        let timeout = config.query_timeout();
        let sql = format!("DELETE FROM {} WHERE key = ?1", table.quoted());

        with_retries(
            Phase::DeleteOriginals,
            config.migration.phase_retries,
            config.retry_backoff(),
            || {
                let tx = transactions.transaction_mut(tx_id)?;
                in_savepoint(tx, DELETE_SAVEPOINT, |tx| {
                    tx.with_deadline("delete_originals", timeout, |conn| {
                        let mut stmt = conn.prepare_cached(&sql)?;
                        let mut deleted = 0;
                        for key in keys {
                            deleted += stmt.execute([key])?;
                        }
                        Ok(deleted)
                    })
                })
            },
        )
        .await
    }

    /// 依資源量表調整批次大小，逐批寫入；逾時的批次會重試
    async fn insert_all(
        &mut self,
        tx_id: &str,
        records: &[Record],
        batches: &mut usize,
        total: &mut BatchResult,
    ) -> Result<()> {
        let Self {
            config,
            transactions,
            inserter,
            performance,
            sampler,
            ..
        } = self;
        let gauges = sampler.gauges();
        let strategy = config.migration.conflict_strategy;
        let max = inserter.max_batch_size();

        let mut size = performance.clamp(config.batch.initial_size).min(max);
        let mut offset = 0;

        while offset < records.len() {
            let end = (offset + size).min(records.len());
            let batch = &records[offset..end];
            let started = Instant::now();

            let result = with_retries(
                Phase::Insert,
                config.migration.phase_retries,
                config.retry_backoff(),
                || {
                    let tx = transactions.transaction_mut(tx_id)?;
                    inserter.insert_batch(tx, batch, strategy)
                },
            )
            .await;
            let result = match result {
                Ok(result) => result,
                Err(e) => {
                    total.attempted += batch.len();
                    total.failed += batch.len();
                    tracing::error!("❌ Batch of {} records failed: {}", batch.len(), e);
                    return Err(e);
                }
            };

            total.merge(&result);
            *batches += 1;
            offset = end;
            size = performance
                .next_batch_size(size, started.elapsed(), gauges.memory_pct(), gauges.cpu_pct())
                .min(max);
        }

        sampler.log_stats("insert");
        Ok(())
    }

    /// 備份失敗沒有副作用，可在上限內重試
    async fn create_backup(&self, db_path: &Path) -> Result<BackupId> {
        let attempts = self.config.backup.max_attempts.max(1);
        let delay = Duration::from_millis(self.config.backup.retry_delay_ms);
        let mut attempt = 1;

        loop {
            match self.snapshots.create_snapshot(db_path) {
                Ok(id) => {
                    tracing::info!("Backup {} created", id);
                    return Ok(id);
                }
                Err(e) if attempt < attempts => {
                    tracing::warn!(
                        "Backup attempt {}/{} failed: {}; retrying in {:?}",
                        attempt,
                        attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 在備份快照上做 Basic 檢查，不與寫入端爭用目標檔案
    fn pre_validate(&self, backup_id: &BackupId) -> Result<(ValidationReport, u64)> {
        let snapshot = self.snapshots.snapshot_path(backup_id)?;
        let store = Store::open_read_only(&snapshot, &self.table)?;
        let validation = self.validator.validate(&store, ValidationMode::Basic, None)?;

        if let Some(check) = validation
            .result(CheckName::Integrity)
            .filter(|c| c.outcome == CheckOutcome::Failed)
        {
            return Err(MigrationError::Integrity {
                details: check.message.clone(),
            });
        }
        for warning in &validation.warnings {
            tracing::warn!("Pre-migration check: {}", warning);
        }

        let rows = store.row_count()?;
        Ok((validation, rows))
    }

    /// 回滾交易；檔案若與備份不同則由備份覆蓋
    #[allow(clippy::too_many_arguments)]
    fn recover(
        &mut self,
        db_path: &Path,
        tx_id: &str,
        backup_id: &BackupId,
        original_digest: &str,
        phase: Phase,
        cause: MigrationError,
        report: &mut MigrationReport,
    ) -> MigrationError {
        tracing::error!("Phase {} failed: {}; rolling back", phase, cause);
        let timer = PhaseTimer::start(Phase::Rollback);

        if self.transactions.transaction(tx_id).is_ok() {
            if let Err(e) = self.transactions.rollback(tx_id) {
                tracing::error!("Rollback of {} failed: {}", tx_id, e);
            }
        }

        let recovery = match file_digest(db_path) {
            Ok(digest) if digest == original_digest => RecoveryState::RolledBack,
            current => {
                match current {
                    Ok(_) => tracing::warn!("Database differs from backup after rollback"),
                    Err(e) => tracing::warn!("Cannot hash database after rollback: {}", e),
                }
                match self.snapshots.restore_snapshot(backup_id, db_path) {
                    Ok(()) => {
                        tracing::info!("Database restored from backup {}", backup_id);
                        RecoveryState::RestoredFromBackup
                    }
                    Err(e) => {
                        tracing::error!("Restore from backup {} failed: {}", backup_id, e);
                        RecoveryState::Unrestored
                    }
                }
            }
        };

        let status = match recovery {
            RecoveryState::Unrestored => PhaseStatus::Failed,
            _ => PhaseStatus::Completed,
        };
        self.emit(report, timer.finish(status, 0));
        self.emit(report, PhaseTimer::start(Phase::Failed).finish(PhaseStatus::Failed, 0));

        tracing::error!("❌ Migration aborted during {}: {}", phase, recovery);
        MigrationError::Aborted {
            phase,
            cause: Box::new(cause),
            recovery,
        }
    }

    fn abort_untouched(
        &self,
        report: &mut MigrationReport,
        phase: Phase,
        cause: MigrationError,
    ) -> MigrationError {
        self.emit(report, PhaseTimer::start(Phase::Failed).finish(PhaseStatus::Failed, 0));
        tracing::error!("❌ Migration aborted during {} before any write: {}", phase, cause);
        MigrationError::Aborted {
            phase,
            cause: Box::new(cause),
            recovery: RecoveryState::Untouched,
        }
    }

    /// 記錄階段事件並原樣回傳結果
    fn settle<T>(
        &self,
        report: &mut MigrationReport,
        timer: PhaseTimer,
        outcome: Result<T>,
        affected: impl FnOnce(&T) -> usize,
    ) -> Result<T> {
        let event = match &outcome {
            Ok(value) => timer.finish(PhaseStatus::Completed, affected(value)),
            Err(e) => {
                tracing::warn!("{}: {}", timer.phase, e);
                timer.finish(PhaseStatus::Failed, 0)
            }
        };
        self.emit(report, event);
        outcome
    }

    fn emit(&self, report: &mut MigrationReport, event: PhaseEvent) {
        self.audit.emit(&event);
        report.events.push(event);
    }
}

/// 驗證用的預期列數。Replace/Update 的衝突也計入 inserted，但不增加列數。
fn expected_rows(
    pre_rows: u64,
    deleted: usize,
    insert: &BatchResult,
    strategy: ConflictStrategy,
) -> u64 {
    let new_rows = match strategy {
        ConflictStrategy::Replace | ConflictStrategy::Update => {
            insert.inserted.saturating_sub(insert.conflicts)
        }
        ConflictStrategy::Ignore | ConflictStrategy::Fail => insert.inserted,
    };
    (pre_rows + new_rows as u64).saturating_sub(deleted as u64)
}

fn rehearse(options: &RunOptions, phase: Phase) -> Result<()> {
    if options.abort_after == Some(phase) {
        return Err(MigrationError::transaction(format!(
            "rollback rehearsal requested after {}",
            phase
        )));
    }
    Ok(())
}

/// 可恢復的錯誤（逾時、鎖等待）以線性退避重試整個階段，最多 `retries` 次
async fn with_retries<T>(
    phase: Phase,
    retries: u32,
    backoff: Duration,
    mut attempt: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut tries = 0u32;
    loop {
        match attempt() {
            Err(e) if e.is_recoverable() && tries < retries => {
                tries += 1;
                let delay = backoff * tries;
                tracing::warn!(
                    "{} attempt {} failed: {}; retrying in {:?}",
                    phase,
                    tries,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

/// 在 savepoint 內執行；失敗時回到 savepoint，讓階段可以安全重試
fn in_savepoint<T>(
    tx: &mut Transaction,
    name: &str,
    work: impl FnOnce(&mut Transaction) -> Result<T>,
) -> Result<T> {
    tx.savepoint(name)?;
    match work(tx) {
        Ok(value) => {
            tx.release_savepoint(name)?;
            Ok(value)
        }
        Err(e) => {
            if let Err(undo) = tx
                .rollback_to_savepoint(name)
                .and_then(|_| tx.release_savepoint(name))
            {
                tracing::error!("Failed to undo savepoint {}: {}", name, undo);
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{FileSnapshotStore, MemoryAuditSink};
    use std::cell::Cell;

    fn timeout() -> MigrationError {
        MigrationError::PhaseTimeout {
            phase: "insert".to_string(),
            timeout_ms: 10,
        }
    }

    #[tokio::test]
    async fn test_with_retries_recovers_from_timeouts() {
        let calls = Cell::new(0);
        let result = with_retries(Phase::Insert, 3, Duration::ZERO, || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(timeout())
            } else {
                Ok(calls.get())
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn test_with_retries_is_bounded() {
        let calls = Cell::new(0);
        let result: Result<()> = with_retries(Phase::Insert, 2, Duration::ZERO, || {
            calls.set(calls.get() + 1);
            Err(timeout())
        })
        .await;

        assert!(matches!(result, Err(MigrationError::PhaseTimeout { .. })));
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn test_with_retries_does_not_retry_fatal_errors() {
        let calls = Cell::new(0);
        let result: Result<()> = with_retries(Phase::Extract, 3, Duration::ZERO, || {
            calls.set(calls.get() + 1);
            Err(MigrationError::UnsafeQuery {
                reason: "multiple statements".to_string(),
            })
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_expected_rows_per_strategy() {
        let insert = BatchResult {
            attempted: 10,
            inserted: 10,
            conflicts: 2,
            failed: 0,
        };
        assert_eq!(expected_rows(100, 10, &insert, ConflictStrategy::Replace), 98);
        assert_eq!(expected_rows(100, 10, &insert, ConflictStrategy::Update), 98);

        let ignored = BatchResult {
            attempted: 10,
            inserted: 8,
            conflicts: 2,
            failed: 0,
        };
        assert_eq!(expected_rows(100, 10, &ignored, ConflictStrategy::Ignore), 98);
        assert_eq!(expected_rows(5, 0, &BatchResult::default(), ConflictStrategy::Fail), 5);
    }

    #[tokio::test]
    async fn test_failed_batch_is_counted() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("state.vscdb");
        let table = TableName::parse("ItemTable").unwrap();
        Store::create(&path, &table)
            .unwrap()
            .conn()
            .execute("INSERT INTO ItemTable (key, value) VALUES ('k', 'v1')", [])
            .unwrap();

        let mut config = MigrationConfig::builtin().unwrap();
        config.monitoring.enabled = false;
        config.migration.conflict_strategy = ConflictStrategy::Fail;
        config.migration.retry_backoff_ms = 1;
        let mut orchestrator = MigrationOrchestrator::new(
            config,
            FileSnapshotStore::new(dir.path().join("backups")),
            MemoryAuditSink::new(),
        )
        .unwrap();

        let tx_id = orchestrator.transactions.begin(&path, &table).unwrap();
        let records = vec![Record::new("fresh", "1"), Record::new("k", "v2")];
        let mut batches = 0;
        let mut total = BatchResult::default();
        let result = orchestrator
            .insert_all(&tx_id, &records, &mut batches, &mut total)
            .await;

        assert!(matches!(result, Err(MigrationError::Conflict { .. })));
        assert_eq!(total.attempted, 2);
        assert_eq!(total.failed, 2);
        assert_eq!(total.inserted, 0);
        assert_eq!(batches, 0);
        orchestrator.transactions.rollback(&tx_id).unwrap();
    }

    #[test]
    fn test_rehearsal_only_fires_for_requested_phase() {
        let options = RunOptions {
            abort_after: Some(Phase::Insert),
            ..RunOptions::new(MigrationMode::Full)
        };
        assert!(rehearse(&options, Phase::Extract).is_ok());
        assert!(matches!(
            rehearse(&options, Phase::Insert),
            Err(MigrationError::TransactionError { .. })
        ));
    }

    #[test]
    fn test_transactional_modes() {
        assert!(RunOptions::new(MigrationMode::Full).is_transactional());
        assert!(RunOptions::new(MigrationMode::InsertOnly).is_transactional());
        assert!(!RunOptions::new(MigrationMode::TransformOnly).is_transactional());
        let dry = RunOptions {
            dry_run: true,
            ..RunOptions::new(MigrationMode::Full)
        };
        assert!(!dry.is_transactional());
    }

    #[test]
    fn test_phase_timer_event() {
        let event = PhaseTimer::start(Phase::Transform).finish(PhaseStatus::Completed, 7);
        assert_eq!(event.phase, Phase::Transform);
        assert_eq!(event.records_affected, 7);
        assert!(event.finished_at >= event.started_at);
    }
}
