use crate::domain::model::IdType;
use crate::domain::ports::IdSource;
use crate::utils::error::{MigrationError, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use uuid::{Builder, Uuid, Variant};

/// 作業系統 CSPRNG 來源
#[derive(Debug, Default, Clone, Copy)]
pub struct OsIdSource;

impl IdSource for OsIdSource {
    fn generate(&mut self, id_type: IdType) -> String {
        match id_type {
            IdType::Hex64 => {
                let mut bytes = [0u8; 32];
                OsRng.fill_bytes(&mut bytes);
                hex::encode(bytes)
            }
            IdType::UuidV4 | IdType::SessionId => {
                let mut bytes = [0u8; 16];
                OsRng.fill_bytes(&mut bytes);
                Builder::from_random_bytes(bytes).into_uuid().to_string()
            }
        }
    }
}

/// 產生新識別碼，並以熵檢查擋下退化輸出（最多重新產生一次）
pub struct IdentityGenerator<S: IdSource = OsIdSource> {
    source: S,
}

impl IdentityGenerator<OsIdSource> {
    pub fn new() -> Self {
        Self {
            source: OsIdSource,
        }
    }
}

impl Default for IdentityGenerator<OsIdSource> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: IdSource> IdentityGenerator<S> {
    pub fn with_source(source: S) -> Self {
        Self { source }
    }

    pub fn generate(&mut self, id_type: IdType) -> Result<String> {
        let first = self.source.generate(id_type);
        if !is_degenerate(id_type, &first) {
            return Ok(first);
        }

        tracing::warn!("Generated {} identifier failed the entropy check, regenerating", id_type);
        let second = self.source.generate(id_type);
        if !is_degenerate(id_type, &second) {
            return Ok(second);
        }

        Err(MigrationError::LowEntropy {
            id_type: id_type.to_string(),
        })
    }

    pub fn source(&self) -> &S {
        &self.source
    }
}

/// 格式錯誤、單一字元重複、全零或 UUID 版本/變體位元不符皆視為退化
pub fn is_degenerate(id_type: IdType, id: &str) -> bool {
    let significant: Vec<char> = id.chars().filter(|c| *c != '-').collect();
    let Some(first) = significant.first() else {
        return true;
    };
    if significant.iter().all(|c| c == first) {
        return true;
    }

    match id_type {
        IdType::Hex64 => {
            id.len() != 64
                || !id
                    .chars()
                    .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        }
        IdType::UuidV4 | IdType::SessionId => match Uuid::parse_str(id) {
            Ok(uuid) => {
                id.len() != 36
                    || uuid.get_version_num() != 4
                    || uuid.get_variant() != Variant::RFC4122
            }
            Err(_) => true,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 依序回傳預先設定的輸出並記錄呼叫次數
    struct ScriptedSource {
        outputs: Vec<String>,
        calls: usize,
    }

    impl ScriptedSource {
        fn new(outputs: &[&str]) -> Self {
            Self {
                outputs: outputs.iter().map(|s| s.to_string()).collect(),
                calls: 0,
            }
        }
    }

    impl IdSource for ScriptedSource {
        fn generate(&mut self, _id_type: IdType) -> String {
            let out = self.outputs[self.calls.min(self.outputs.len() - 1)].clone();
            self.calls += 1;
            out
        }
    }

    #[test]
    fn test_os_source_formats() {
        let mut generator = IdentityGenerator::new();

        let hex = generator.generate(IdType::Hex64).unwrap();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        let uuid = generator.generate(IdType::UuidV4).unwrap();
        let parsed = Uuid::parse_str(&uuid).unwrap();
        assert_eq!(parsed.get_version_num(), 4);
        assert_eq!(parsed.get_variant(), Variant::RFC4122);

        let session = generator.generate(IdType::SessionId).unwrap();
        assert_ne!(session, uuid);
    }

    #[test]
    fn test_all_zero_regenerates_once_then_fails() {
        let zeros = "0".repeat(64);
        let mut generator = IdentityGenerator::with_source(ScriptedSource::new(&[&zeros]));

        let result = generator.generate(IdType::Hex64);
        assert!(matches!(result, Err(MigrationError::LowEntropy { .. })));
        assert_eq!(generator.source().calls, 2);
    }

    #[test]
    fn test_single_retry_recovers() {
        let good = "a1".repeat(32);
        let mut generator =
            IdentityGenerator::with_source(ScriptedSource::new(&["ffff", good.as_str()]));

        assert_eq!(generator.generate(IdType::Hex64).unwrap(), good);
        assert_eq!(generator.source().calls, 2);
    }

    #[test]
    fn test_degenerate_detection() {
        assert!(is_degenerate(IdType::Hex64, &"a".repeat(64)));
        assert!(is_degenerate(IdType::Hex64, &"AB".repeat(32)));
        assert!(is_degenerate(IdType::Hex64, "abc"));
        assert!(is_degenerate(
            IdType::UuidV4,
            "00000000-0000-0000-0000-000000000000"
        ));
        // version 1
        assert!(is_degenerate(
            IdType::UuidV4,
            "6ba7b810-9dad-11d1-80b4-00c04fd430c8"
        ));
        // variant bits 11xx
        assert!(is_degenerate(
            IdType::UuidV4,
            "550e8400-e29b-41d4-c716-446655440000"
        ));
        assert!(!is_degenerate(
            IdType::UuidV4,
            "550e8400-e29b-41d4-a716-446655440000"
        ));
        assert!(is_degenerate(IdType::SessionId, ""));
    }
}
