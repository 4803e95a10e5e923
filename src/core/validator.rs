use crate::core::rules::RuleSet;
use crate::core::store::Store;
use crate::domain::model::{
    CheckName, CheckOutcome, CheckResult, Record, ValidationMode, ValidationReport,
};
use crate::utils::error::Result;
use rusqlite::types::ValueRef;
use std::time::Duration;

pub const DEFAULT_SAMPLE_SIZE: usize = 1000;

/// 取樣中格式錯誤比例超過此值即失敗
const FORMAT_FAILURE_RATE: f64 = 0.05;
/// 可疑值的容忍度較高
const VALUE_FAILURE_RATE: f64 = 0.10;

const SUSPICIOUS_TOKENS: [&str; 5] = ["null", "undefined", "NaN", "<script", "javascript:"];

/// 列出殘留時最多顯示幾個 key
const MAX_REPORTED_KEYS: usize = 5;

/// 遷移前快照與舊識別碼，供 RecordCount 與 TransformationAccuracy 比對
#[derive(Debug, Clone, Default)]
pub struct ValidationReference {
    pub expected_rows: Option<u64>,
    pub residuals: Option<ResidualReference>,
}

/// 殘留檢查的依據
#[derive(Debug, Clone, Default)]
pub struct ResidualReference {
    /// 來源名稱（machineId、deviceId ...），不分大小寫比對 key 與 value
    pub markers: Vec<String>,
    /// 命中規則卻仍帶著非新格式識別碼、或命中刪除規則的列都算殘留
    pub rules: RuleSet,
    /// 本次被取代掉的舊識別碼
    pub old_values: Vec<String>,
}

pub struct ConsistencyValidator {
    sample_size: usize,
    timeout: Option<Duration>,
}

impl ConsistencyValidator {
    pub fn new(sample_size: usize, timeout: Option<Duration>) -> Self {
        Self {
            sample_size: sample_size.max(1),
            timeout,
        }
    }

    pub fn validate(
        &self,
        store: &Store,
        mode: ValidationMode,
        reference: Option<&ValidationReference>,
    ) -> Result<ValidationReport> {
        let mut report = ValidationReport::default();

        let integrity = self.check_integrity(store)?;
        let fatal = integrity.outcome == CheckOutcome::Failed;
        record(&mut report, integrity);
        if fatal {
            tracing::error!("Integrity check failed; skipping remaining checks");
            return Ok(finish(report));
        }

        record(&mut report, self.check_record_count(store, reference)?);

        let sample = self.sample(store)?;
        record(&mut report, check_data_format(&sample));

        if mode == ValidationMode::Full {
            record(&mut report, self.check_key_uniqueness(store)?);
            record(&mut report, check_value_validity(&sample));
            record(
                &mut report,
                self.check_transformation_accuracy(store, reference.and_then(|r| r.residuals.as_ref()))?,
            );
        }

        let report = finish(report);
        tracing::info!(
            "Validation ({:?}): {} passed, {} failed, {} warnings",
            mode,
            report.passed,
            report.failed,
            report.warnings.len()
        );
        Ok(report)
    }

    fn check_integrity(&self, store: &Store) -> Result<CheckResult> {
        let problems = store.with_deadline("validate", self.timeout, |_| store.integrity_problems())?;
        Ok(if problems.is_empty() {
            passed(CheckName::Integrity, "integrity_check ok")
        } else {
            failed(CheckName::Integrity, problems.join("; "))
        })
    }

    fn check_record_count(
        &self,
        store: &Store,
        reference: Option<&ValidationReference>,
    ) -> Result<CheckResult> {
        let count = store.row_count()?;
        let expected = reference.and_then(|r| r.expected_rows);

        Ok(match expected {
            Some(expected) if expected != count => failed(
                CheckName::RecordCount,
                format!("expected {} rows, found {}", expected, count),
            ),
            _ if count == 0 => warning(CheckName::RecordCount, "table is empty"),
            _ => passed(CheckName::RecordCount, format!("{} rows", count)),
        })
    }

    fn check_key_uniqueness(&self, store: &Store) -> Result<CheckResult> {
        let duplicates: i64 = store.conn().query_row(
            &format!(
                "SELECT COUNT(*) - COUNT(DISTINCT key) FROM {}",
                store.table().quoted()
            ),
            [],
            |row| row.get(0),
        )?;
        Ok(if duplicates == 0 {
            passed(CheckName::KeyUniqueness, "all keys unique")
        } else {
            failed(
                CheckName::KeyUniqueness,
                format!("{} duplicate key(s)", duplicates),
            )
        })
    }

    /// 全表掃描：來源列中不得再出現舊識別碼，規則目標上的識別碼必須是新格式
    fn check_transformation_accuracy(
        &self,
        store: &Store,
        residuals: Option<&ResidualReference>,
    ) -> Result<CheckResult> {
        let Some(residuals) = residuals else {
            return Ok(passed(
                CheckName::TransformationAccuracy,
                "no residual reference supplied",
            ));
        };
        let markers: Vec<String> = residuals
            .markers
            .iter()
            .filter(|m| !m.is_empty())
            .map(|m| m.to_lowercase())
            .collect();
        let old_values: Vec<&str> = residuals
            .old_values
            .iter()
            .map(String::as_str)
            .filter(|v| !v.is_empty())
            .collect();
        if residuals.rules.is_empty() && (markers.is_empty() || old_values.is_empty()) {
            return Ok(passed(CheckName::TransformationAccuracy, "nothing to verify"));
        }

        let offenders = store.with_deadline("validate", self.timeout, |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT key, value FROM {} ORDER BY rowid",
                store.table().quoted()
            ))?;
            let mut rows = stmt.query([])?;
            let mut offenders = Vec::new();
            while let Some(row) = rows.next()? {
                let record = Record::new(text(row.get_ref(0)?), text(row.get_ref(1)?));
                if let Some(reason) = residuals.rules.stale_identifier(&record) {
                    offenders.push(format!("{} {}", record.key, reason));
                    continue;
                }
                if !old_values.is_empty() && mentions_any(&record, &markers) {
                    if let Some(old) = old_values.iter().find(|old| {
                        contains_token(&record.key, old) || contains_token(&record.value, old)
                    }) {
                        offenders.push(format!("{} still holds '{}'", record.key, old));
                    }
                }
            }
            Ok(offenders)
        })?;

        Ok(if offenders.is_empty() {
            passed(CheckName::TransformationAccuracy, "no residual identifiers")
        } else {
            let shown: Vec<&str> = offenders
                .iter()
                .take(MAX_REPORTED_KEYS)
                .map(String::as_str)
                .collect();
            failed(
                CheckName::TransformationAccuracy,
                format!(
                    "{} row(s) still carry old identifiers: {}",
                    offenders.len(),
                    shown.join(", ")
                ),
            )
        })
    }

    fn sample(&self, store: &Store) -> Result<Vec<Record>> {
        let mut stmt = store.conn().prepare(&format!(
            "SELECT key, value FROM {} ORDER BY rowid LIMIT ?1",
            store.table().quoted()
        ))?;
        let rows = stmt.query_map([self.sample_size as i64], |row| {
            Ok(Record::new(text(row.get_ref(0)?), text(row.get_ref(1)?)))
        })?;
        let mut sample = Vec::new();
        for row in rows {
            sample.push(row?);
        }
        Ok(sample)
    }
}

fn check_data_format(sample: &[Record]) -> CheckResult {
    let malformed = sample
        .iter()
        .filter(|r| looks_like_json(&r.value))
        .filter(|r| serde_json::from_str::<serde_json::Value>(&r.value).is_err())
        .count();
    rate_check(
        CheckName::DataFormat,
        malformed,
        sample.len(),
        FORMAT_FAILURE_RATE,
        "malformed JSON value(s)",
    )
}

fn check_value_validity(sample: &[Record]) -> CheckResult {
    let suspicious = sample
        .iter()
        .filter(|r| SUSPICIOUS_TOKENS.iter().any(|t| r.value.contains(t)))
        .count();
    rate_check(
        CheckName::ValueValidity,
        suspicious,
        sample.len(),
        VALUE_FAILURE_RATE,
        "suspicious value(s)",
    )
}

fn rate_check(
    name: CheckName,
    bad: usize,
    total: usize,
    failure_rate: f64,
    what: &str,
) -> CheckResult {
    if bad == 0 || total == 0 {
        return passed(name, format!("{} sampled rows clean", total));
    }
    let rate = bad as f64 / total as f64;
    let message = format!("{} of {} sampled: {} ({:.1}%)", bad, total, what, rate * 100.0);
    if rate > failure_rate {
        failed(name, message)
    } else {
        warning(name, message)
    }
}

fn looks_like_json(value: &str) -> bool {
    let trimmed = value.trim();
    (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'))
}

fn mentions_any(record: &Record, markers: &[String]) -> bool {
    if markers.is_empty() {
        return false;
    }
    let key = record.key.to_lowercase();
    let value = record.value.to_lowercase();
    markers
        .iter()
        .any(|m| key.contains(m.as_str()) || value.contains(m.as_str()))
}

/// 以識別碼字元為邊界的子字串比對
fn contains_token(haystack: &str, token: &str) -> bool {
    let is_token = |c: char| c.is_ascii_alphanumeric() || c == '-';
    haystack.match_indices(token).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + token.len()..].chars().next();
        !before.is_some_and(is_token) && !after.is_some_and(is_token)
    })
}

fn text(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => String::new(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn passed(name: CheckName, message: impl Into<String>) -> CheckResult {
    CheckResult {
        name,
        outcome: CheckOutcome::Passed,
        message: message.into(),
    }
}

fn warning(name: CheckName, message: impl Into<String>) -> CheckResult {
    CheckResult {
        name,
        outcome: CheckOutcome::Warning,
        message: message.into(),
    }
}

fn failed(name: CheckName, message: impl Into<String>) -> CheckResult {
    CheckResult {
        name,
        outcome: CheckOutcome::Failed,
        message: message.into(),
    }
}

fn record(report: &mut ValidationReport, result: CheckResult) {
    report.checks_run.push(result.name);
    match result.outcome {
        CheckOutcome::Passed => report.passed += 1,
        CheckOutcome::Warning => {
            report.passed += 1;
            tracing::warn!("{}: {}", result.name, result.message);
            report
                .warnings
                .push(format!("{}: {}", result.name, result.message));
        }
        CheckOutcome::Failed => {
            report.failed += 1;
            tracing::error!("{} failed: {}", result.name, result.message);
        }
    }
    report.results.push(result);
}

fn finish(mut report: ValidationReport) -> ValidationReport {
    report.overall_ok = report.failed == 0;
    report
}
