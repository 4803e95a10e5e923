use crate::core::identity::{is_degenerate, IdentityGenerator, OsIdSource};
use crate::core::matcher::CompiledPattern;
use crate::domain::model::{
    Pattern, Record, RuleAction, RuleTarget, TransformationRule, ValueTransform,
};
use crate::domain::ports::IdSource;
use crate::utils::error::{MigrationError, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// pattern 之後、識別碼之前可略過的分隔字元
const DELIMITERS: [char; 6] = ['"', '\'', ':', '=', '-', '_'];

#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub rule: TransformationRule,
    pub pattern: CompiledPattern,
}

/// 載入一次、之後唯讀的規則集
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    pub fn compile(rules: &[TransformationRule]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            if rule.name.trim().is_empty() {
                return Err(MigrationError::MissingConfigError {
                    field: "rules.name".to_string(),
                });
            }
            if rule.action == RuleAction::TransformValue && rule.transform.is_none() {
                return Err(MigrationError::InvalidConfigValueError {
                    field: format!("rules.{}.transform", rule.name),
                    value: "none".to_string(),
                    reason: "transform_value rules need uppercase, lowercase or hash".to_string(),
                });
            }
            let pattern = CompiledPattern::compile(&rule.pattern)?;
            compiled.push(CompiledRule {
                rule: rule.clone(),
                pattern,
            });
        }
        Ok(Self { rules: compiled })
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// 啟用中規則的 pattern，供擷取與殘留檢查使用
    pub fn patterns(&self) -> Vec<Pattern> {
        self.rules
            .iter()
            .filter(|r| r.rule.enabled)
            .map(|r| r.rule.pattern.clone())
            .collect()
    }

    /// 這筆紀錄若仍需要規則處理，回傳原因：刪除規則命中的列，
    /// 或 ReplaceId 目標位置上的識別碼不是新產生的格式
    pub fn stale_identifier(&self, record: &Record) -> Option<String> {
        for compiled in self.rules.iter().filter(|r| r.rule.enabled) {
            if !compiled.pattern.matches(record) {
                continue;
            }
            match compiled.rule.action {
                RuleAction::Delete => {
                    return Some(format!("matches purge rule '{}'", compiled.rule.name));
                }
                RuleAction::ReplaceId => {
                    if let Some(token) = current_tokens(compiled, record)
                        .into_iter()
                        .find(|token| is_degenerate(compiled.rule.id_type, token))
                    {
                        return Some(format!(
                            "'{}' is not a fresh {} ({})",
                            token, compiled.rule.id_type, compiled.rule.name
                        ));
                    }
                }
                RuleAction::TransformValue => {}
            }
        }
        None
    }
}

/// 單筆紀錄套用規則後的結果
#[derive(Debug, Clone, PartialEq)]
pub struct Transformed {
    pub record: Record,
    pub applied: usize,
    pub applied_rules: Vec<String>,
    /// 被取代掉的舊識別碼
    pub replaced: Vec<String>,
    /// 被刪除規則命中，不寫回
    pub purge: bool,
}

impl Transformed {
    pub fn unchanged(record: &Record) -> Self {
        Self {
            record: record.clone(),
            applied: 0,
            applied_rules: Vec::new(),
            replaced: Vec::new(),
            purge: false,
        }
    }

    pub fn is_changed(&self) -> bool {
        self.applied > 0
    }
}

pub struct RuleEngine<S: IdSource = OsIdSource> {
    generator: IdentityGenerator<S>,
}

impl RuleEngine<OsIdSource> {
    pub fn new() -> Self {
        Self {
            generator: IdentityGenerator::new(),
        }
    }
}

impl Default for RuleEngine<OsIdSource> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: IdSource> RuleEngine<S> {
    pub fn with_generator(generator: IdentityGenerator<S>) -> Self {
        Self { generator }
    }

    /// 依序套用規則；每條規則對同一筆紀錄最多執行一次，後面的規則看到前面的結果。
    /// 任一動作失敗則整筆紀錄失敗，不會回傳部分轉換。
    pub fn apply(&mut self, record: &Record, rules: &RuleSet) -> Result<Transformed> {
        let mut out = Transformed::unchanged(record);

        for compiled in rules.rules() {
            if !compiled.rule.enabled || !compiled.pattern.matches(&out.record) {
                continue;
            }

            let changed = match compiled.rule.action {
                RuleAction::ReplaceId => self.replace_id(compiled, &mut out)?,
                RuleAction::TransformValue => transform_value(compiled, &mut out.record),
                RuleAction::Delete => {
                    out.purge = true;
                    true
                }
            };

            if changed {
                out.applied += 1;
                out.applied_rules.push(compiled.rule.name.clone());
                tracing::trace!(rule = %compiled.rule.name, key = %out.record.key, "Rule applied");
            }
            if out.purge {
                break;
            }
        }

        Ok(out)
    }

    fn replace_id(&mut self, compiled: &CompiledRule, out: &mut Transformed) -> Result<bool> {
        let new_id = self.generator.generate(compiled.rule.id_type)?;
        let target = compiled.rule.target;
        let mut changed = false;

        if matches!(target, RuleTarget::Key | RuleTarget::Both) {
            if let Some((key, old)) = substitute_in_key(&compiled.pattern, &out.record.key, &new_id)
            {
                out.record.key = key;
                out.replaced.push(old);
                changed = true;
            }
        }

        if matches!(target, RuleTarget::Value | RuleTarget::Both) {
            if let Some((value, old)) =
                substitute_in_value(&compiled.pattern, &out.record.value, &new_id)?
            {
                out.record.set_value(value);
                out.replaced.push(old);
                changed = true;
            }
        }

        Ok(changed)
    }
}

/// 規則目前會取代的識別碼（不產生新值）
fn current_tokens(compiled: &CompiledRule, record: &Record) -> Vec<String> {
    let target = compiled.rule.target;
    let mut tokens = Vec::new();
    if matches!(target, RuleTarget::Key | RuleTarget::Both) {
        if let Some((_, old)) = substitute_in_key(&compiled.pattern, &record.key, "") {
            tokens.push(old);
        }
    }
    if matches!(target, RuleTarget::Value | RuleTarget::Both) {
        if let Ok(Some((_, old))) = substitute_in_value(&compiled.pattern, &record.value, "") {
            tokens.push(old);
        }
    }
    tokens
}

fn substitute_in_key(pattern: &CompiledPattern, key: &str, id: &str) -> Option<(String, String)> {
    let anchor = pattern.anchor_in(key)?;
    substitute_after(key, anchor, id)
}

fn substitute_in_value(
    pattern: &CompiledPattern,
    value: &str,
    id: &str,
) -> Result<Option<(String, String)>> {
    if let Some(path) = pattern.json_path() {
        let Ok(mut doc) = serde_json::from_str::<Value>(value) else {
            return Ok(None);
        };
        let Some(node) = path.lookup_mut(&mut doc) else {
            return Ok(None);
        };
        let old = match node {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return Ok(None),
        };
        *node = Value::String(id.to_string());
        return Ok(Some((serde_json::to_string(&doc)?, old)));
    }

    match pattern.anchor_in(value) {
        Some(anchor) => Ok(substitute_after(value, anchor, id)),
        // 只由 key 命中時，value 本身就是識別碼
        None => Ok(replace_whole_token(value, id)),
    }
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-'
}

/// 取代 `anchor` 之後第一段連續識別碼字元（第一個符合處，非全部）
fn substitute_after(text: &str, anchor: usize, id: &str) -> Option<(String, String)> {
    let rest = text.get(anchor..)?;
    let skip = rest
        .char_indices()
        .find(|(_, c)| !(c.is_whitespace() || DELIMITERS.contains(c)))
        .map(|(i, _)| i)?;
    let start = anchor + skip;

    let token_len = text[start..]
        .char_indices()
        .find(|(_, c)| !is_token_char(*c))
        .map(|(i, _)| i)
        .unwrap_or(text.len() - start);
    if token_len == 0 {
        return None;
    }

    let end = start + token_len;
    let old = text[start..end].to_string();
    Some((format!("{}{}{}", &text[..start], id, &text[end..]), old))
}

/// value 整體（可帶 JSON 引號）是單一識別碼時整段取代
fn replace_whole_token(value: &str, id: &str) -> Option<(String, String)> {
    let trimmed = value.trim();
    let (inner, quoted) = match trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
    {
        Some(inner) => (inner, true),
        None => (trimmed, false),
    };
    if inner.is_empty() || !inner.chars().all(is_token_char) {
        return None;
    }

    let replacement = if quoted {
        format!("\"{}\"", id)
    } else {
        id.to_string()
    };
    Some((replacement, inner.to_string()))
}

fn transform_value(compiled: &CompiledRule, record: &mut Record) -> bool {
    let Some(transform) = compiled.rule.transform else {
        return false;
    };
    let next = match transform {
        ValueTransform::Uppercase => record.value.to_uppercase(),
        ValueTransform::Lowercase => record.value.to_lowercase(),
        ValueTransform::Hash => hex::encode(Sha256::digest(record.value.as_bytes())),
    };
    if next == record.value {
        return false;
    }
    record.set_value(next);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{IdType, MatchScope, PatternKind, ValueType};

    struct FixedSource(Vec<String>, usize);

    impl IdSource for FixedSource {
        fn generate(&mut self, _id_type: IdType) -> String {
            let id = self.0[self.1 % self.0.len()].clone();
            self.1 += 1;
            id
        }
    }

    fn fixed_engine(ids: &[&str]) -> RuleEngine<FixedSource> {
        RuleEngine::with_generator(IdentityGenerator::with_source(FixedSource(
            ids.iter().map(|s| s.to_string()).collect(),
            0,
        )))
    }

    fn rule(name: &str, pattern: Pattern, target: RuleTarget) -> TransformationRule {
        TransformationRule {
            name: name.to_string(),
            pattern,
            action: RuleAction::ReplaceId,
            id_type: IdType::Hex64,
            target,
            enabled: true,
            transform: None,
        }
    }

    const NEW_ID: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[test]
    fn test_both_target_uses_same_id() {
        let rules = RuleSet::compile(&[rule(
            "machine",
            Pattern::contains("machineId"),
            RuleTarget::Both,
        )])
        .unwrap();
        let record = Record::new("cache.machineId-old1", r#"{"machineId":"old2","x":1}"#);

        let out = fixed_engine(&[NEW_ID]).apply(&record, &rules).unwrap();
        assert_eq!(out.record.key, format!("cache.machineId-{}", NEW_ID));
        assert_eq!(out.record.value, format!(r#"{{"machineId":"{}","x":1}}"#, NEW_ID));
        assert_eq!(out.applied, 1);
        assert_eq!(out.replaced, vec!["old1", "old2"]);
    }

    #[test]
    fn test_first_match_only() {
        let rules =
            RuleSet::compile(&[rule("m", Pattern::contains("machineId"), RuleTarget::Value)])
                .unwrap();
        let record = Record::new("k", "machineId=aaa machineId=bbb");

        let out = fixed_engine(&[NEW_ID]).apply(&record, &rules).unwrap();
        assert_eq!(out.record.value, format!("machineId={} machineId=bbb", NEW_ID));
    }

    #[test]
    fn test_key_match_replaces_bare_value() {
        let rules = RuleSet::compile(&[rule(
            "m",
            Pattern::new(PatternKind::Exact, "telemetry.machineId"),
            RuleTarget::Value,
        )])
        .unwrap();

        let out = fixed_engine(&[NEW_ID])
            .apply(&Record::new("telemetry.machineId", "\"abc123\""), &rules)
            .unwrap();
        assert_eq!(out.record.value, format!("\"{}\"", NEW_ID));
        assert_eq!(out.replaced, vec!["abc123"]);

        // 非識別碼形狀的 value 不動
        let out = fixed_engine(&[NEW_ID])
            .apply(&Record::new("telemetry.machineId", "{\"a\": [1]}"), &rules)
            .unwrap();
        assert_eq!(out.applied, 0);
    }

    #[test]
    fn test_json_path_value_target() {
        let rules = RuleSet::compile(&[rule(
            "device",
            Pattern::new(PatternKind::JsonPath, "$.telemetry.devDeviceId"),
            RuleTarget::Value,
        )])
        .unwrap();
        let record = Record::new(
            "storage",
            r#"{"telemetry":{"devDeviceId":"old","sqmId":"s"},"z":true}"#,
        );

        let out = fixed_engine(&[NEW_ID]).apply(&record, &rules).unwrap();
        assert_eq!(
            out.record.value,
            format!(
                r#"{{"telemetry":{{"devDeviceId":"{}","sqmId":"s"}},"z":true}}"#,
                NEW_ID
            )
        );
        assert_eq!(out.replaced, vec!["old"]);
    }

    #[test]
    fn test_rules_chain_in_order_and_skip_disabled() {
        let mut disabled = rule("off", Pattern::contains("x"), RuleTarget::Value);
        disabled.enabled = false;
        let upper = TransformationRule {
            name: "upper".to_string(),
            pattern: Pattern::contains("session"),
            action: RuleAction::TransformValue,
            id_type: IdType::Hex64,
            target: RuleTarget::Value,
            enabled: true,
            transform: Some(ValueTransform::Uppercase),
        };
        let mut session = rule("s", Pattern::contains("session"), RuleTarget::Value);
        session.id_type = IdType::UuidV4;
        let rules = RuleSet::compile(&[
            session,
            disabled,
            upper,
        ])
        .unwrap();

        let out = fixed_engine(&["abcdef12-0000-4000-8000-00000000000a"])
            .apply(&Record::new("session", "session: old-token"), &rules)
            .unwrap();
        assert_eq!(out.applied, 2);
        assert_eq!(out.applied_rules, vec!["s", "upper"]);
        assert_eq!(out.record.value, "SESSION: ABCDEF12-0000-4000-8000-00000000000A");
    }

    #[test]
    fn test_hash_transform() {
        let rules = RuleSet::compile(&[TransformationRule {
            name: "hash".to_string(),
            pattern: Pattern::new(PatternKind::Exact, "secret"),
            action: RuleAction::TransformValue,
            id_type: IdType::Hex64,
            target: RuleTarget::Value,
            enabled: true,
            transform: Some(ValueTransform::Hash),
        }])
        .unwrap();

        let out = RuleEngine::new()
            .apply(&Record::new("secret", "abc"), &rules)
            .unwrap();
        assert_eq!(
            out.record.value,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_entropy_failure_aborts_record() {
        let rules =
            RuleSet::compile(&[rule("m", Pattern::contains("machineId"), RuleTarget::Value)])
                .unwrap();
        let zeros = "0".repeat(64);
        let result = fixed_engine(&[zeros.as_str()])
            .apply(&Record::new("machineId", "machineId=abc"), &rules);
        assert!(matches!(result, Err(MigrationError::LowEntropy { .. })));
    }

    #[test]
    fn test_transform_value_requires_transform() {
        let mut bad = rule("t", Pattern::contains("x"), RuleTarget::Value);
        bad.action = RuleAction::TransformValue;
        assert!(RuleSet::compile(&[bad]).is_err());
    }

    #[test]
    fn test_delete_rule_marks_purge_and_stops_chain() {
        let mut purge = rule(
            "purge",
            Pattern::new(PatternKind::Regex, "(?i)augment").in_scope(MatchScope::Key),
            RuleTarget::Value,
        );
        purge.action = RuleAction::Delete;
        let rules = RuleSet::compile(&[
            purge,
            rule("m", Pattern::contains("machineId"), RuleTarget::Value),
        ])
        .unwrap();

        let out = fixed_engine(&[NEW_ID])
            .apply(&Record::new("Augment.machineId", "abc"), &rules)
            .unwrap();
        assert!(out.purge);
        assert_eq!(out.applied_rules, vec!["purge"]);
        assert_eq!(out.record.value, "abc");

        let out = fixed_engine(&[NEW_ID])
            .apply(&Record::new("telemetry.machineId", "abc"), &rules)
            .unwrap();
        assert!(!out.purge);
        assert_eq!(out.record.value, NEW_ID);
    }

    #[test]
    fn test_blob_value_stays_blob_after_replacement() {
        let rules =
            RuleSet::compile(&[rule("m", Pattern::contains("machineId"), RuleTarget::Value)])
                .unwrap();
        let record = Record::typed("telemetry.machineId", "abc", ValueType::Blob);
        let out = fixed_engine(&[NEW_ID]).apply(&record, &rules).unwrap();
        assert_eq!(out.record.value_type, ValueType::Blob);

        let null = Record::typed("telemetry.machineId", "", ValueType::Null);
        let out = fixed_engine(&[NEW_ID]).apply(&null, &rules).unwrap();
        assert!(!out.is_changed());
        assert_eq!(out.record.value_type, ValueType::Null);
    }

    #[test]
    fn test_stale_identifier_detects_unmigrated_rows() {
        let mut purge = rule(
            "purge",
            Pattern::new(PatternKind::Regex, "(?i)context7").in_scope(MatchScope::Key),
            RuleTarget::Value,
        );
        purge.action = RuleAction::Delete;
        let mut device = rule("device", Pattern::contains("devDeviceId"), RuleTarget::Value);
        device.id_type = IdType::UuidV4;
        let rules = RuleSet::compile(&[
            rule("machine", Pattern::contains("machineId"), RuleTarget::Both),
            device,
            purge,
        ])
        .unwrap();

        let stale = rules.stale_identifier(&Record::new("telemetry.machineId", "4f1c2a9b0d8e"));
        assert!(stale.unwrap().contains("4f1c2a9b0d8e"));
        assert!(rules
            .stale_identifier(&Record::new("telemetry.devDeviceId", "not-a-uuid"))
            .is_some());
        assert!(rules
            .stale_identifier(&Record::new("Context7.cache", "{}"))
            .is_some());

        // 已是新格式的識別碼不算殘留
        let fresh = RuleEngine::new()
            .apply(&Record::new("machineId:legacy-7f3a", r#"{"machineId":"legacy-7f3a"}"#), &rules)
            .unwrap();
        assert_eq!(rules.stale_identifier(&fresh.record), None);
        assert_eq!(
            rules.stale_identifier(&Record::new(
                "telemetry.devDeviceId",
                "6f9619ff-8b86-4011-b42d-00c04fc964ff"
            )),
            None
        );
        assert_eq!(rules.stale_identifier(&Record::new("workbench.theme", "dark")), None);
    }

    #[test]
    fn test_unmatched_record_untouched() {
        let rules =
            RuleSet::compile(&[rule("m", Pattern::contains("machineId"), RuleTarget::Both)])
                .unwrap();
        let record = Record::new("workbench.theme", "dark");
        let out = RuleEngine::new().apply(&record, &rules).unwrap();
        assert_eq!(out, Transformed::unchanged(&record));
    }
}
