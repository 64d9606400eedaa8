//! knowledge-bank - RAG 지식 관리
//!
//! 문서 적재 → 청킹 → 임베딩 → 벡터 인덱스 → 아티팩트 영속화 파이프라인과,
//! 지식을 ID로 등록해 에이전트에 검색기로 장착하는 KnowledgeBank를 제공합니다.
//!
//! ```text
//! KnowledgeBank ── add_data_as_knowledge ──▶ Knowledge ──▶ IndexStore (memory | lance)
//!       │                                        │
//!       └── equip(agent, RagAgentConfig) ──▶ KnowledgeRetriever
//! ```

pub mod bank;
pub mod cli;
pub mod config;
pub mod embedding;
pub mod error;
pub mod index;
pub mod knowledge;
pub mod loader;

// Re-exports
pub use bank::{KnowledgeBank, KnowledgeSource, RetrieverHost, RetrieverSet};
pub use config::{
    get_data_dir, BankSettings, ComponentSpec, IndexBackend, IndexSettings, KnowledgeConfig,
    KnowledgeRequirement, KnowledgeType, RagAgentConfig, SimilarityMetric,
};
pub use embedding::{get_api_key, has_api_key, EmbeddingProvider, EmbeddingRegistry, GeminiEmbedding};
pub use error::{KnowledgeError, KnowledgeResult};
pub use index::{ArtifactStatus, IndexManifest, IndexStore};
pub use knowledge::{
    Document, Knowledge, KnowledgeContext, KnowledgeOrigin, KnowledgeRetriever, Node, ScoredNode,
    Transformer, TransformerRegistry,
};
pub use loader::{DocumentLoader, LoaderRegistry};
