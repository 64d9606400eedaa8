//! 에이전트에 붙는 검색기 - 공유 Knowledge + 검색 파라미터

use std::sync::Arc;

use super::engine::Knowledge;
use super::node::ScoredNode;
use crate::config::KnowledgeRequirement;
use crate::error::KnowledgeResult;

#[derive(Clone)]
pub struct KnowledgeRetriever {
    knowledge: Arc<Knowledge>,
    similarity_top_k: usize,
    score_threshold: Option<f32>,
}

impl KnowledgeRetriever {
    pub fn new(knowledge: Arc<Knowledge>, similarity_top_k: usize, score_threshold: Option<f32>) -> Self {
        Self {
            knowledge,
            similarity_top_k,
            score_threshold,
        }
    }

    pub fn from_requirement(knowledge: Arc<Knowledge>, requirement: &KnowledgeRequirement) -> Self {
        Self::new(
            knowledge,
            requirement.similarity_top_k,
            requirement.score_threshold,
        )
    }

    pub fn knowledge_id(&self) -> &str {
        self.knowledge.knowledge_id()
    }

    pub fn knowledge(&self) -> &Arc<Knowledge> {
        &self.knowledge
    }

    pub fn similarity_top_k(&self) -> usize {
        self.similarity_top_k
    }

    pub async fn retrieve(&self, query: &str) -> KnowledgeResult<Vec<ScoredNode>> {
        self.knowledge
            .retrieve(query, self.similarity_top_k, self.score_threshold)
            .await
    }

    pub async fn retrieve_texts(&self, query: &str) -> KnowledgeResult<Vec<String>> {
        self.knowledge
            .retrieve_texts(query, self.similarity_top_k, self.score_threshold)
            .await
    }
}

impl std::fmt::Debug for KnowledgeRetriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeRetriever")
            .field("knowledge_id", &self.knowledge_id())
            .field("similarity_top_k", &self.similarity_top_k)
            .field("score_threshold", &self.score_threshold)
            .finish()
    }
}
