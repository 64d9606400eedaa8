//! 문서 로더 모듈
//!
//! 처리 단계의 `load_data.loader`는 [`LoaderRegistry`]에서 클래스 이름으로
//! 해석됩니다. 모르는 클래스나 모듈은 설정 에러입니다.
//!
//! - `SimpleDirectoryReader`: 디렉토리 (텍스트, HTML, PDF)
//! - `DatabaseReader`: SQLite 쿼리 결과

pub mod database;
pub mod directory;
pub mod extract;

use std::collections::BTreeMap;

use async_trait::async_trait;

pub use database::DatabaseReader;
pub use directory::SimpleDirectoryReader;

use crate::config::ComponentSpec;
use crate::error::{KnowledgeError, KnowledgeResult};
use crate::knowledge::node::Document;

pub const SIMPLE_DIRECTORY_READER: &str = "SimpleDirectoryReader";
pub const DATABASE_READER: &str = "DatabaseReader";

/// 원본 소스에서 Document를 읽는 전략
#[async_trait]
pub trait DocumentLoader: Send + Sync {
    /// `query`는 처리 단계의 `load_data.query` (쿼리 기반 로더만 사용)
    async fn load(&self, query: Option<&str>) -> KnowledgeResult<Vec<Document>>;

    fn name(&self) -> &'static str;
}

type LoaderFactory = fn(&ComponentSpec) -> KnowledgeResult<Box<dyn DocumentLoader>>;

struct Registration {
    modules: &'static [&'static str],
    factory: LoaderFactory,
}

/// 로더 클래스 이름 → 생성 함수
pub struct LoaderRegistry {
    entries: BTreeMap<&'static str, Registration>,
}

impl LoaderRegistry {
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            entries: BTreeMap::new(),
        };
        registry.register(
            SIMPLE_DIRECTORY_READER,
            &["knowledge_bank.readers", "llama_index.core"],
            directory_reader_factory,
        );
        registry.register(
            DATABASE_READER,
            &["knowledge_bank.readers", "llama_index.readers.database"],
            database_reader_factory,
        );
        registry
    }

    pub fn register(
        &mut self,
        class: &'static str,
        modules: &'static [&'static str],
        factory: LoaderFactory,
    ) {
        self.entries.insert(class, Registration { modules, factory });
    }

    pub fn classes(&self) -> Vec<&'static str> {
        self.entries.keys().copied().collect()
    }

    /// 설정 항목으로 로더 생성 (파일 시스템에는 접근하지 않음)
    pub fn create(&self, spec: &ComponentSpec) -> KnowledgeResult<Box<dyn DocumentLoader>> {
        let registration = self.entries.get(spec.class.as_str()).ok_or_else(|| {
            KnowledgeError::config(format!(
                "unknown loader `{}` (known: {})",
                spec.class,
                self.classes().join(", ")
            ))
        })?;

        if !spec.module.is_empty() && !registration.modules.contains(&spec.module.as_str()) {
            return Err(KnowledgeError::config(format!(
                "loader `{}` is not provided by module `{}`",
                spec.class, spec.module
            )));
        }

        (registration.factory)(spec)
    }
}

impl Default for LoaderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn directory_reader_factory(spec: &ComponentSpec) -> KnowledgeResult<Box<dyn DocumentLoader>> {
    Ok(Box::new(SimpleDirectoryReader::from_spec(spec)?))
}

fn database_reader_factory(spec: &ComponentSpec) -> KnowledgeResult<Box<dyn DocumentLoader>> {
    Ok(Box::new(DatabaseReader::from_spec(spec)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn spec(module: &str, class: &str, args: Value) -> ComponentSpec {
        ComponentSpec::new(module, class, args.as_object().cloned().unwrap_or_default())
    }

    #[test]
    fn test_create_known_loaders() {
        let registry = LoaderRegistry::with_defaults();

        let dir = spec("llama_index.core", SIMPLE_DIRECTORY_READER, json!({"input_dir": "docs"}));
        assert_eq!(registry.create(&dir).ok().map(|l| l.name()), Some(SIMPLE_DIRECTORY_READER));

        let db = spec("", DATABASE_READER, json!({"database": "faq.sqlite"}));
        assert_eq!(registry.create(&db).ok().map(|l| l.name()), Some(DATABASE_READER));
    }

    #[test]
    fn test_rejects_unknown_class_module_and_args() {
        let registry = LoaderRegistry::with_defaults();

        let unknown = spec("", "WebCrawler", json!({}));
        assert!(matches!(registry.create(&unknown).err(), Some(KnowledgeError::Config(_))));

        let wrong_module = spec("other.pkg", SIMPLE_DIRECTORY_READER, json!({"input_dir": "docs"}));
        assert!(registry.create(&wrong_module).is_err());

        let missing_dir = spec("", SIMPLE_DIRECTORY_READER, json!({"recursive": true}));
        let err = registry.create(&missing_dir).err().unwrap();
        assert!(err.to_string().contains("input_dir"));

        let bad_encoding = spec(
            "",
            SIMPLE_DIRECTORY_READER,
            json!({"input_dir": "docs", "encoding": "latin-1"}),
        );
        assert!(registry.create(&bad_encoding).is_err());
    }
}
