//! 설정 모듈 - 지식 설정 파일과 런타임 설정
//!
//! 지식 설정 파일은 JSON 배열이며, 각 항목이 하나의 지식 단위를 기술합니다.
//!
//! ```json
//! [{
//!   "knowledge_id": "agentscope_code_rag",
//!   "knowledge_type": "local_knowledge",
//!   "emb_model_config_name": "gemini_embedding",
//!   "chunk_size": 1024,
//!   "chunk_overlap": 40,
//!   "language": ["en"],
//!   "data_processing": [{
//!     "load_data": {
//!       "loader": {
//!         "module": "llama_index.core",
//!         "class": "SimpleDirectoryReader",
//!         "init_args": {"input_dir": "docs", "required_exts": [".md"], "recursive": true}
//!       }
//!     },
//!     "store_and_index": {
//!       "transformations": [{
//!         "module": "llama_index.core.node_parser",
//!         "class": "MarkdownNodeParser",
//!         "init_args": {}
//!       }]
//!     }
//!   }]
//! }]
//! ```

pub mod args;

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{KnowledgeError, KnowledgeResult};

/// 기본 청크 크기 (문자 수)
pub const DEFAULT_CHUNK_SIZE: usize = 1024;
/// 기본 청크 오버랩 (문자 수)
pub const DEFAULT_CHUNK_OVERLAP: usize = 20;
/// `load_data`가 없는 단계와 `from_data_dirs`가 쓰는 로더
const DEFAULT_LOADER_MODULE: &str = "llama_index.core";
const DEFAULT_LOADER_CLASS: &str = "SimpleDirectoryReader";

/// 기본 검색 결과 수
pub const DEFAULT_TOP_K: usize = 5;

/// 핑거프린트 계산에 섞이는 아티팩트 포맷 버전
pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

/// 데이터 디렉토리 오버라이드 환경변수
pub const HOME_ENV: &str = "KNOWLEDGE_BANK_HOME";

// ============================================================================
// Data Directory
// ============================================================================

/// 데이터 디렉토리 경로
///
/// 우선순위: `KNOWLEDGE_BANK_HOME` > `~/.local/share/.knowledge-bank`
pub fn get_data_dir() -> PathBuf {
    if let Ok(home) = std::env::var(HOME_ENV) {
        if !home.is_empty() {
            return PathBuf::from(home);
        }
    }

    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".knowledge-bank")
}

/// KnowledgeBank 런타임 설정
#[derive(Debug, Clone, Default)]
pub struct BankSettings {
    /// 인덱스 아티팩트 저장 위치. `None`이면 영속화하지 않음
    pub storage_dir: Option<PathBuf>,
}

impl BankSettings {
    /// 환경변수 기반 기본 설정 (`<data_dir>/storage`)
    pub fn from_env() -> Self {
        Self {
            storage_dir: Some(get_data_dir().join("storage")),
        }
    }

    /// 지정한 디렉토리에 아티팩트 저장
    pub fn with_storage_dir(path: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: Some(path.into()),
        }
    }

    /// 영속화 없이 메모리에서만 동작
    pub fn ephemeral() -> Self {
        Self { storage_dir: None }
    }

    /// 지식 ID의 아티팩트 위치
    pub fn artifact_dir(&self, knowledge_id: &str) -> Option<PathBuf> {
        self.storage_dir.as_ref().map(|dir| dir.join(knowledge_id))
    }
}

// ============================================================================
// Knowledge Config
// ============================================================================

/// 지식 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeType {
    #[default]
    LocalKnowledge,
}

impl KnowledgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KnowledgeType::LocalKnowledge => "local_knowledge",
        }
    }
}

/// 로더/트랜스포머 식별자 + 초기화 인자
///
/// `module`/`class`/`init_args` 외의 필드는 `init_args`로 합쳐집니다
/// (같은 키가 있으면 `init_args` 쪽이 우선).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawComponentSpec")]
pub struct ComponentSpec {
    pub module: String,
    pub class: String,
    pub init_args: Map<String, Value>,
}

#[derive(Deserialize)]
struct RawComponentSpec {
    #[serde(default)]
    module: String,
    class: String,
    #[serde(default)]
    init_args: Map<String, Value>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl From<RawComponentSpec> for ComponentSpec {
    fn from(raw: RawComponentSpec) -> Self {
        let mut init_args = raw.extra;
        init_args.extend(raw.init_args);
        Self {
            module: raw.module,
            class: raw.class,
            init_args,
        }
    }
}

impl ComponentSpec {
    pub fn new(module: &str, class: &str, init_args: Map<String, Value>) -> Self {
        Self {
            module: module.to_string(),
            class: class.to_string(),
            init_args,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoadDataSpec {
    pub loader: ComponentSpec,
    /// 데이터베이스 로더용 쿼리
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct StoreAndIndexSpec {
    #[serde(default)]
    pub transformations: Vec<ComponentSpec>,
}

/// 처리 단계: 로더 1개 + 트랜스포머 체인
///
/// `load_data`가 없으면 `set_default_data_path` 디렉토리를 기본
/// SimpleDirectoryReader로 읽습니다. 둘 중 정확히 하나가 있어야 합니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessingStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_data: Option<LoadDataSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_default_data_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_and_index: Option<StoreAndIndexSpec>,
}

impl ProcessingStep {
    /// 이 단계가 실제로 쓰는 로더 설정
    pub fn loader_spec(&self) -> KnowledgeResult<LoadDataSpec> {
        match (&self.load_data, &self.set_default_data_path) {
            (Some(spec), None) => Ok(spec.clone()),
            (None, Some(path)) => {
                let mut init_args = Map::new();
                init_args.insert(
                    "input_dir".to_string(),
                    Value::String(path.display().to_string()),
                );
                Ok(LoadDataSpec {
                    loader: ComponentSpec::new(DEFAULT_LOADER_MODULE, DEFAULT_LOADER_CLASS, init_args),
                    query: None,
                })
            }
            (Some(_), Some(_)) => Err(KnowledgeError::config(
                "load_data and set_default_data_path are mutually exclusive",
            )),
            (None, None) => Err(KnowledgeError::config(
                "processing step needs load_data or set_default_data_path",
            )),
        }
    }
}

/// 인덱스 백엔드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IndexBackend {
    /// 프로세스 내 벡터 목록
    #[default]
    Memory,
    /// LanceDB 데이터셋
    Lance,
}

/// 유사도 측정 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMetric {
    #[default]
    Cosine,
    DotProduct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct IndexSettings {
    #[serde(default)]
    pub backend: IndexBackend,
    #[serde(default)]
    pub metric: SimilarityMetric,
}

/// 지식 단위 설정
///
/// 한번 지식이 빌드되면 설정은 바뀌지 않습니다. 설정을 바꾸면 핑거프린트가
/// 달라지고 기존 아티팩트는 재사용되지 않습니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KnowledgeConfig {
    pub knowledge_id: String,
    #[serde(default)]
    pub knowledge_type: KnowledgeType,
    pub emb_model_config_name: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default)]
    pub language: Vec<String>,
    pub data_processing: Vec<ProcessingStep>,
    #[serde(default)]
    pub index: IndexSettings,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_chunk_overlap() -> usize {
    DEFAULT_CHUNK_OVERLAP
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

impl KnowledgeConfig {
    /// 디렉토리 → 확장자 매핑으로 기본 설정 생성
    ///
    /// 디렉토리마다 SimpleDirectoryReader 단계를 하나씩 만들고
    /// 크기 기반 SentenceSplitter를 붙입니다.
    pub fn from_data_dirs(
        knowledge_id: &str,
        emb_model_config_name: &str,
        data_dirs_and_types: &BTreeMap<PathBuf, Vec<String>>,
    ) -> KnowledgeResult<Self> {
        if data_dirs_and_types.is_empty() {
            return Err(KnowledgeError::config(format!(
                "no data directories given for knowledge `{}`",
                knowledge_id
            )));
        }

        let data_processing = data_dirs_and_types
            .iter()
            .map(|(dir, exts)| {
                let mut loader_args = Map::new();
                loader_args.insert(
                    "input_dir".to_string(),
                    Value::String(dir.display().to_string()),
                );
                loader_args.insert(
                    "required_exts".to_string(),
                    Value::Array(exts.iter().cloned().map(Value::String).collect()),
                );

                let mut splitter_args = Map::new();
                splitter_args.insert("chunk_size".to_string(), DEFAULT_CHUNK_SIZE.into());
                splitter_args.insert("chunk_overlap".to_string(), DEFAULT_CHUNK_OVERLAP.into());

                ProcessingStep {
                    load_data: Some(LoadDataSpec {
                        loader: ComponentSpec::new(
                            DEFAULT_LOADER_MODULE,
                            DEFAULT_LOADER_CLASS,
                            loader_args,
                        ),
                        query: None,
                    }),
                    set_default_data_path: None,
                    store_and_index: Some(StoreAndIndexSpec {
                        transformations: vec![ComponentSpec::new(
                            "llama_index.core.node_parser",
                            "SentenceSplitter",
                            splitter_args,
                        )],
                    }),
                }
            })
            .collect();

        let config = Self {
            knowledge_id: knowledge_id.to_string(),
            knowledge_type: KnowledgeType::LocalKnowledge,
            emb_model_config_name: emb_model_config_name.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            language: vec!["en".to_string()],
            data_processing,
            index: IndexSettings::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// 구조 검증 (컴포넌트 식별자 검증은 레지스트리에서 수행)
    pub fn validate(&self) -> KnowledgeResult<()> {
        if self.knowledge_id.trim().is_empty() {
            return Err(KnowledgeError::config("knowledge_id must not be empty"));
        }
        if self.knowledge_id.contains(['/', '\\']) || self.knowledge_id.starts_with('.') {
            return Err(KnowledgeError::config(format!(
                "knowledge_id `{}` must be a plain name",
                self.knowledge_id
            )));
        }
        if self.emb_model_config_name.trim().is_empty() {
            return Err(KnowledgeError::config(format!(
                "knowledge `{}` has no emb_model_config_name",
                self.knowledge_id
            )));
        }
        if self.chunk_size == 0 {
            return Err(KnowledgeError::config(format!(
                "knowledge `{}`: chunk_size must be positive",
                self.knowledge_id
            )));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(KnowledgeError::config(format!(
                "knowledge `{}`: chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.knowledge_id, self.chunk_overlap, self.chunk_size
            )));
        }
        if self.data_processing.is_empty() {
            return Err(KnowledgeError::config(format!(
                "knowledge `{}` has no data_processing steps",
                self.knowledge_id
            )));
        }
        for (i, step) in self.data_processing.iter().enumerate() {
            if let Err(KnowledgeError::Config(message)) = step.loader_spec() {
                return Err(KnowledgeError::config(format!(
                    "knowledge `{}` step {}: {}",
                    self.knowledge_id,
                    i + 1,
                    message
                )));
            }
        }
        Ok(())
    }

    /// 설정 전체의 SHA-256 핑거프린트 (hex)
    ///
    /// JSON 키를 정렬한 정규형을 해시하므로 파일의 키 순서와 무관합니다.
    pub fn fingerprint(&self) -> KnowledgeResult<String> {
        let value = serde_json::to_value(self)?;
        let mut canonical = String::new();
        write_canonical(&value, &mut canonical);

        let mut hasher = Sha256::new();
        hasher.update(ARTIFACT_FORMAT_VERSION.to_le_bytes());
        hasher.update(canonical.as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// 키 정렬된 JSON 직렬화
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

// ============================================================================
// Config File
// ============================================================================

/// JSON 문자열에서 지식 설정 목록 파싱
///
/// 각 설정을 검증하고 `knowledge_id` 중복을 거부합니다.
pub fn parse_knowledge_configs(json: &str) -> KnowledgeResult<Vec<KnowledgeConfig>> {
    let configs: Vec<KnowledgeConfig> = serde_json::from_str(json)
        .map_err(|e| KnowledgeError::config(format!("malformed knowledge config: {}", e)))?;

    let mut seen = HashSet::new();
    for config in &configs {
        config.validate()?;
        if !seen.insert(config.knowledge_id.as_str()) {
            return Err(KnowledgeError::config(format!(
                "knowledge_id `{}` appears more than once",
                config.knowledge_id
            )));
        }
    }

    Ok(configs)
}

/// 파일에서 지식 설정 목록 로드
pub fn load_knowledge_configs(path: &Path) -> KnowledgeResult<Vec<KnowledgeConfig>> {
    let json = std::fs::read_to_string(path).map_err(|e| KnowledgeError::load(path, e))?;
    let configs = parse_knowledge_configs(&json)?;
    tracing::debug!("Parsed {} knowledge configs from {:?}", configs.len(), path);
    Ok(configs)
}

// ============================================================================
// RAG Agent Config
// ============================================================================

/// 에이전트가 요구하는 지식 하나와 검색 파라미터
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KnowledgeRequirement {
    pub knowledge_id: String,
    #[serde(default = "default_top_k")]
    pub similarity_top_k: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_threshold: Option<f32>,
}

impl KnowledgeRequirement {
    pub fn new(knowledge_id: &str) -> Self {
        Self {
            knowledge_id: knowledge_id.to_string(),
            similarity_top_k: DEFAULT_TOP_K,
            score_threshold: None,
        }
    }
}

/// 에이전트의 RAG 요구사항 (순서 유지)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RagAgentConfig {
    #[serde(default)]
    pub knowledge: Vec<KnowledgeRequirement>,
}

impl RagAgentConfig {
    /// 기본 검색 파라미터로 생성
    pub fn for_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            knowledge: ids
                .into_iter()
                .map(|id| KnowledgeRequirement::new(id.as_ref()))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.knowledge.is_empty()
    }

    pub fn validate(&self) -> KnowledgeResult<()> {
        let mut seen = HashSet::new();
        for req in &self.knowledge {
            if req.similarity_top_k == 0 {
                return Err(KnowledgeError::config(format!(
                    "similarity_top_k for `{}` must be positive",
                    req.knowledge_id
                )));
            }
            if let Some(threshold) = req.score_threshold {
                if !threshold.is_finite() {
                    return Err(KnowledgeError::config(format!(
                        "score_threshold for `{}` must be finite",
                        req.knowledge_id
                    )));
                }
            }
            if !seen.insert(req.knowledge_id.as_str()) {
                return Err(KnowledgeError::config(format!(
                    "knowledge `{}` is listed twice in the agent config",
                    req.knowledge_id
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
