use crate::domain::model::{Pattern, PatternKind, Record};
use crate::utils::error::{MigrationError, Result};
use regex::Regex;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathSegment {
    Key(String),
    Index(usize),
}

/// 型別化的 JSON 路徑，例如 `$.telemetry.machineId`、`$['telemetry.machineId']`、`items[0].id`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    raw: String,
    segments: Vec<PathSegment>,
}

impl JsonPath {
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |reason: &str| MigrationError::InvalidPattern {
            pattern: raw.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = raw.trim();
        let body = trimmed.strip_prefix('$').unwrap_or(trimmed);
        let chars: Vec<char> = body.chars().collect();
        let mut segments = Vec::new();
        let mut i = 0;

        // 允許省略開頭的 `$.`
        if !chars.is_empty() && chars[0] != '.' && chars[0] != '[' {
            let (name, next) = read_name(&chars, 0);
            segments.push(PathSegment::Key(name));
            i = next;
        }

        while i < chars.len() {
            match chars[i] {
                '.' => {
                    let (name, next) = read_name(&chars, i + 1);
                    if name.is_empty() {
                        return Err(invalid("empty field name"));
                    }
                    segments.push(PathSegment::Key(name));
                    i = next;
                }
                '[' => {
                    let start = i + 1;
                    match chars.get(start) {
                        Some(&quote) if quote == '\'' || quote == '"' => {
                            let close = chars[start + 1..]
                                .iter()
                                .position(|&c| c == quote)
                                .map(|p| p + start + 1)
                                .ok_or_else(|| invalid("unterminated quoted field"))?;
                            if chars.get(close + 1) != Some(&']') {
                                return Err(invalid("expected ']' after quoted field"));
                            }
                            let name: String = chars[start + 1..close].iter().collect();
                            segments.push(PathSegment::Key(name));
                            i = close + 2;
                        }
                        _ => {
                            let close = chars[start..]
                                .iter()
                                .position(|&c| c == ']')
                                .map(|p| p + start)
                                .ok_or_else(|| invalid("unterminated index"))?;
                            let digits: String = chars[start..close].iter().collect();
                            let index = digits
                                .trim()
                                .parse::<usize>()
                                .map_err(|_| invalid("array index must be a non-negative integer"))?;
                            segments.push(PathSegment::Index(index));
                            i = close + 1;
                        }
                    }
                }
                _ => return Err(invalid("unexpected character")),
            }
        }

        if segments.is_empty() {
            return Err(invalid("path has no segments"));
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn lookup<'a>(&self, doc: &'a Value) -> Option<&'a Value> {
        self.segments
            .iter()
            .try_fold(doc, |node, segment| match segment {
                PathSegment::Key(name) => node.as_object()?.get(name),
                PathSegment::Index(index) => node.as_array()?.get(*index),
            })
    }

    pub fn lookup_mut<'a>(&self, doc: &'a mut Value) -> Option<&'a mut Value> {
        self.segments
            .iter()
            .try_fold(doc, |node, segment| match segment {
                PathSegment::Key(name) => node.as_object_mut()?.get_mut(name),
                PathSegment::Index(index) => node.as_array_mut()?.get_mut(*index),
            })
    }

    /// 最後一個欄位名稱，用於在 key 中定位
    pub fn last_key(&self) -> Option<&str> {
        self.segments.iter().rev().find_map(|segment| match segment {
            PathSegment::Key(name) => Some(name.as_str()),
            PathSegment::Index(_) => None,
        })
    }
}

fn read_name(chars: &[char], start: usize) -> (String, usize) {
    let end = chars[start..]
        .iter()
        .position(|&c| c == '.' || c == '[')
        .map(|p| p + start)
        .unwrap_or(chars.len());
    (chars[start..end].iter().collect(), end)
}

#[derive(Debug, Clone)]
enum Matcher {
    Exact(String),
    Contains(String),
    StartsWith(String),
    EndsWith(String),
    Regex(Regex),
    JsonPath(JsonPath),
}

/// 載入時編譯一次的 pattern；評估是純函式
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    source: Pattern,
    matcher: Matcher,
}

impl CompiledPattern {
    pub fn compile(pattern: &Pattern) -> Result<Self> {
        if pattern.value.is_empty() {
            return Err(MigrationError::InvalidPattern {
                pattern: format!("{:?}", pattern.kind),
                reason: "pattern value cannot be empty".to_string(),
            });
        }

        let value = pattern.value.clone();
        let matcher = match pattern.kind {
            PatternKind::Exact => Matcher::Exact(value),
            PatternKind::Contains => Matcher::Contains(value),
            PatternKind::StartsWith => Matcher::StartsWith(value),
            PatternKind::EndsWith => Matcher::EndsWith(value),
            PatternKind::Regex => {
                let regex = Regex::new(&value).map_err(|e| MigrationError::InvalidPattern {
                    pattern: value.clone(),
                    reason: e.to_string(),
                })?;
                Matcher::Regex(regex)
            }
            PatternKind::JsonPath => Matcher::JsonPath(JsonPath::parse(&value)?),
        };

        Ok(Self {
            source: pattern.clone(),
            matcher,
        })
    }

    pub fn source(&self) -> &Pattern {
        &self.source
    }

    pub fn kind(&self) -> PatternKind {
        self.source.kind
    }

    pub fn json_path(&self) -> Option<&JsonPath> {
        match &self.matcher {
            Matcher::JsonPath(path) => Some(path),
            _ => None,
        }
    }

    /// 先比對 key，再比對 value；JsonPath 只看 value 解析後的文件
    pub fn matches(&self, record: &Record) -> bool {
        match &self.matcher {
            Matcher::Exact(literal) => record.key == *literal,
            Matcher::JsonPath(path) => match serde_json::from_str::<Value>(&record.value) {
                Ok(doc) => path.lookup(&doc).is_some(),
                Err(_) => false,
            },
            _ => {
                let scope = self.source.scope;
                (scope.includes_key() && self.matches_text(&record.key))
                    || (scope.includes_value() && self.matches_text(&record.value))
            }
        }
    }

    fn matches_text(&self, text: &str) -> bool {
        match &self.matcher {
            Matcher::Exact(literal) => text == literal,
            Matcher::Contains(literal) => text.contains(literal.as_str()),
            Matcher::StartsWith(literal) => text.starts_with(literal.as_str()),
            Matcher::EndsWith(literal) => text.ends_with(literal.as_str()),
            Matcher::Regex(regex) => regex.is_match(text),
            Matcher::JsonPath(_) => false,
        }
    }

    /// 第一個符合處之後的位置（位元組索引）；替換從這裡開始
    pub fn anchor_in(&self, text: &str) -> Option<usize> {
        match &self.matcher {
            Matcher::Exact(literal)
            | Matcher::Contains(literal)
            | Matcher::StartsWith(literal)
            | Matcher::EndsWith(literal) => text.find(literal.as_str()).map(|i| i + literal.len()),
            Matcher::Regex(regex) => regex.find(text).map(|m| m.end()),
            Matcher::JsonPath(path) => {
                let name = path.last_key()?;
                text.find(name).map(|i| i + name.len())
            }
        }
    }
}

/// 有序的 pattern 集合，任一符合即視為符合
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    patterns: Vec<CompiledPattern>,
}

impl PatternSet {
    pub fn compile(patterns: &[Pattern]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(CompiledPattern::compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn patterns(&self) -> &[CompiledPattern] {
        &self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches_any(&self, record: &Record) -> bool {
        self.patterns.iter().any(|p| p.matches(record))
    }
}
