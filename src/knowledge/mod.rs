//! Knowledge 모듈 - 노드 모델, 청킹, 파이프라인, 검색기
//!
//! - node: Document / Node / ScoredNode
//! - chunker: SentenceSplitter, MarkdownNodeParser, CodeSplitter + 레지스트리
//! - engine: Knowledge (빌드 / 로드 / 검색 / refresh / duplicate)
//! - retriever: 에이전트에 붙는 KnowledgeRetriever

pub mod chunker;
pub mod engine;
pub mod node;
pub mod retriever;

// Re-exports
pub use chunker::{
    ChunkConfig, ChunkDefaults, CodeSplitter, MarkdownNodeParser, SentenceSplitter, Transformer,
    TransformerRegistry,
};
pub use engine::{embed_nodes, Knowledge, KnowledgeContext, KnowledgeOrigin, EMBED_BATCH_SIZE};
pub use node::{Document, Metadata, Node, ScoredNode};
pub use retriever::KnowledgeRetriever;
