//! 컴포넌트 `init_args` 역직렬화
//!
//! 컴포넌트마다 `#[serde(deny_unknown_fields)]` 인자 구조체를 두고, 모르는 키나
//! 잘못된 타입은 기본값으로 넘어가지 않고 클래스 이름이 붙은 설정 에러가 됩니다.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use super::ComponentSpec;
use crate::error::{KnowledgeError, KnowledgeResult};

/// `init_args`를 컴포넌트 인자 구조체로 변환
pub fn parse_init_args<T: DeserializeOwned>(spec: &ComponentSpec) -> KnowledgeResult<T> {
    serde_json::from_value(Value::Object(spec.init_args.clone()))
        .map_err(|e| KnowledgeError::config(format!("{}: invalid init_args: {}", spec.class, e)))
}

/// 비어있으면 안 되는 문자열 인자
pub fn require_non_blank(class: &str, key: &str, value: &str) -> KnowledgeResult<()> {
    if value.trim().is_empty() {
        return Err(KnowledgeError::config(format!(
            "{}: init arg `{}` must not be empty",
            class, key
        )));
    }
    Ok(())
}

/// 문자열 하나 또는 문자열 배열
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StringList {
    One(String),
    Many(Vec<String>),
}

impl Default for StringList {
    fn default() -> Self {
        StringList::Many(Vec::new())
    }
}

impl StringList {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            StringList::One(s) => vec![s],
            StringList::Many(items) => items,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct TestArgs {
        size: Option<usize>,
        #[serde(default)]
        exts: StringList,
    }

    fn spec(args: Value) -> ComponentSpec {
        let init_args = args.as_object().cloned().unwrap_or_default();
        ComponentSpec::new("m", "TestClass", init_args)
    }

    #[test]
    fn test_reads_typed_values() {
        let args: TestArgs = parse_init_args(&spec(json!({"size": 10, "exts": [".md", ".txt"]}))).unwrap();
        assert_eq!(args.size, Some(10));
        assert_eq!(args.exts.into_vec(), vec![".md", ".txt"]);

        let args: TestArgs = parse_init_args(&spec(json!({"exts": ".md"}))).unwrap();
        assert_eq!(args.size, None);
        assert_eq!(args.exts.into_vec(), vec![".md"]);

        let args: TestArgs = parse_init_args(&spec(json!({"size": null}))).unwrap();
        assert!(args.exts.into_vec().is_empty());
    }

    #[test]
    fn test_rejects_wrong_types_and_unknown_keys() {
        let err = parse_init_args::<TestArgs>(&spec(json!({"size": "ten"}))).unwrap_err();
        assert!(err.to_string().contains("TestClass"));

        let err = parse_init_args::<TestArgs>(&spec(json!({"typo_key": 1}))).unwrap_err();
        assert!(err.to_string().contains("typo_key"));
        assert!(matches!(err, KnowledgeError::Config(_)));
    }

    #[test]
    fn test_blank_required_value() {
        assert!(require_non_blank("TestClass", "input_dir", "  ").is_err());
        assert!(require_non_blank("TestClass", "input_dir", "docs").is_ok());
    }
}
