use crate::core::matcher::PatternSet;
use crate::core::store::Store;
use crate::domain::model::{PatternKind, Record, ValueType};
use crate::utils::error::{MigrationError, Result};
use rusqlite::types::ValueRef;
use rusqlite::Row;
use std::time::Duration;

const FORBIDDEN_KEYWORDS: [&str; 8] = [
    "drop", "delete", "update", "insert", "alter", "create", "truncate", "pragma",
];

/// 擷取結果；`scanned` 為 SQL 預篩選後實際讀到的列數
#[derive(Debug, Clone, Default)]
pub struct RecordStream {
    pub records: Vec<Record>,
    pub scanned: usize,
}

impl RecordStream {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.records.iter().map(|r| r.key.clone()).collect()
    }
}

impl IntoIterator for RecordStream {
    type Item = Record;
    type IntoIter = std::vec::IntoIter<Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

/// 唯讀擷取器；查詢錯誤直接回傳，不在此重試
pub struct Extractor {
    timeout: Option<Duration>,
}

impl Extractor {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    /// 依 pattern 集合擷取：可下推的條件以 OR 組合成 SQL，再由 matcher 精確過濾
    pub fn extract(
        &self,
        store: &Store,
        patterns: &PatternSet,
        limit: Option<usize>,
    ) -> Result<RecordStream> {
        if patterns.is_empty() || limit == Some(0) {
            return Ok(RecordStream::default());
        }

        let (where_clause, params) = build_prefilter(patterns);
        let sql = match where_clause {
            Some(clause) => format!(
                "SELECT key, value FROM {} WHERE {} ORDER BY rowid",
                store.table().quoted(),
                clause
            ),
            None => format!(
                "SELECT key, value FROM {} ORDER BY rowid",
                store.table().quoted()
            ),
        };
        tracing::debug!("Extraction query: {}", sql);

        store.with_deadline("extract", self.timeout, |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
            let mut stream = RecordStream::default();

            while let Some(row) = rows.next()? {
                stream.scanned += 1;
                let record = read_record(row)?;
                if patterns.matches_any(&record) {
                    stream.records.push(record);
                    if limit.is_some_and(|n| stream.records.len() >= n) {
                        break;
                    }
                }
            }
            Ok(stream)
        })
    }

    /// 執行呼叫者提供的查詢；必須先通過 [`sanitize_query`]
    pub fn extract_query(
        &self,
        store: &Store,
        query: &str,
        limit: Option<usize>,
    ) -> Result<RecordStream> {
        let sql = sanitize_query(query)?;
        if limit == Some(0) {
            return Ok(RecordStream::default());
        }
        tracing::debug!("Custom extraction query: {}", sql);

        store.with_deadline("extract", self.timeout, |conn| {
            let mut stmt = conn.prepare(&sql)?;
            if stmt.column_count() < 2 {
                return Err(MigrationError::UnsafeQuery {
                    reason: "query must select key and value columns".to_string(),
                });
            }
            let mut rows = stmt.query([])?;
            let mut stream = RecordStream::default();

            while let Some(row) = rows.next()? {
                stream.scanned += 1;
                stream.records.push(read_record(row)?);
                if limit.is_some_and(|n| stream.records.len() >= n) {
                    break;
                }
            }
            Ok(stream)
        })
    }
}

/// 自訂查詢的授權邊界：只允許單一 SELECT
pub fn sanitize_query(query: &str) -> Result<String> {
    let trimmed = query.trim();
    let lower = trimmed.to_lowercase();

    if let Some(keyword) = FORBIDDEN_KEYWORDS.iter().find(|k| lower.contains(*k)) {
        return Err(MigrationError::UnsafeQuery {
            reason: format!("statement contains forbidden keyword '{}'", keyword),
        });
    }

    if !lower.starts_with("select") {
        return Err(MigrationError::UnsafeQuery {
            reason: "statement must start with SELECT".to_string(),
        });
    }

    if let Some(pos) = trimmed.find(';') {
        if !trimmed[pos + 1..].trim().is_empty() {
            return Err(MigrationError::UnsafeQuery {
                reason: "multiple statements are not allowed".to_string(),
            });
        }
        return Ok(trimmed[..pos].trim_end().to_string());
    }

    Ok(trimmed.to_string())
}

/// 產生 WHERE 子句與參數；任一 pattern 無法下推時回傳 None（全表掃描）
fn build_prefilter(patterns: &PatternSet) -> (Option<String>, Vec<String>) {
    let mut conditions = Vec::new();
    let mut params = Vec::new();

    for pattern in patterns.patterns() {
        let value = &pattern.source().value;
        let glob = match pattern.kind() {
            PatternKind::Exact => {
                params.push(value.clone());
                conditions.push(format!("key = ?{}", params.len()));
                continue;
            }
            PatternKind::Contains => format!("*{}*", escape_glob(value)),
            PatternKind::StartsWith => format!("{}*", escape_glob(value)),
            PatternKind::EndsWith => format!("*{}", escape_glob(value)),
            PatternKind::Regex | PatternKind::JsonPath => return (None, Vec::new()),
        };
        params.push(glob);
        let n = params.len();
        let scope = pattern.source().scope;
        conditions.push(match (scope.includes_key(), scope.includes_value()) {
            (true, false) => format!("key GLOB ?{n}"),
            (false, true) => format!("CAST(value AS TEXT) GLOB ?{n}"),
            _ => format!("(key GLOB ?{n} OR CAST(value AS TEXT) GLOB ?{n})"),
        });
    }

    (Some(conditions.join(" OR ")), params)
}

fn escape_glob(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for c in literal.chars() {
        match c {
            '*' => escaped.push_str("[*]"),
            '?' => escaped.push_str("[?]"),
            '[' => escaped.push_str("[[]"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn read_record(row: &Row<'_>) -> Result<Record> {
    let (key, _) = column_text(row, 0)?;
    let (value, value_type) = column_text(row, 1)?;
    Ok(Record::typed(key, value, value_type))
}

/// value 欄位可能是 TEXT、BLOB、數值或 NULL；NULL 視為空字串，原始型別另外保留
fn column_text(row: &Row<'_>, idx: usize) -> rusqlite::Result<(String, ValueType)> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Null => (String::new(), ValueType::Null),
        ValueRef::Integer(i) => (i.to_string(), ValueType::Integer),
        ValueRef::Real(f) => (f.to_string(), ValueType::Real),
        ValueRef::Text(bytes) => (String::from_utf8_lossy(bytes).into_owned(), ValueType::Text),
        ValueRef::Blob(bytes) => (String::from_utf8_lossy(bytes).into_owned(), ValueType::Blob),
    })
}
