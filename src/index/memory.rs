//! 프로세스 내 인덱스 - 전수 비교 검색

use std::path::Path;

use async_trait::async_trait;

use super::{check_embeddings, check_query, order_candidates, similarity, IndexStore};
use crate::config::{IndexBackend, SimilarityMetric};
use crate::error::{KnowledgeError, KnowledgeResult};
use crate::knowledge::node::{Node, ScoredNode};

/// 페이로드 파일 이름
pub const PAYLOAD_FILE: &str = "nodes.json";

#[derive(Debug, Clone)]
pub struct InMemoryIndex {
    metric: SimilarityMetric,
    dimension: usize,
    /// 삽입 순서 = 동점 처리 순서
    nodes: Vec<Node>,
}

impl InMemoryIndex {
    /// 임베딩 검증이 끝난 Node로 생성
    pub fn new(metric: SimilarityMetric, dimension: usize, nodes: Vec<Node>) -> Self {
        Self {
            metric,
            dimension,
            nodes,
        }
    }

    pub fn load(metric: SimilarityMetric, dimension: usize, dir: &Path) -> KnowledgeResult<Self> {
        let path = dir.join(PAYLOAD_FILE);
        let json = std::fs::read_to_string(&path).map_err(|e| KnowledgeError::load(&path, e))?;
        let nodes: Vec<Node> = serde_json::from_str(&json)?;
        check_embeddings(&nodes, dimension, 0)?;
        Ok(Self::new(metric, dimension, nodes))
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }
}

#[async_trait]
impl IndexStore for InMemoryIndex {
    fn backend(&self) -> IndexBackend {
        IndexBackend::Memory
    }

    fn metric(&self) -> SimilarityMetric {
        self.metric
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }

    fn supports_insert(&self) -> bool {
        true
    }

    async fn insert(&mut self, nodes: Vec<Node>) -> KnowledgeResult<usize> {
        check_embeddings(&nodes, self.dimension, self.nodes.len())?;
        let added = nodes.len();
        self.nodes.extend(nodes);
        Ok(added)
    }

    async fn query(&self, embedding: &[f32], top_k: usize) -> KnowledgeResult<Vec<ScoredNode>> {
        check_query(embedding, self.dimension, self.nodes.len())?;
        if top_k == 0 {
            return Ok(vec![]);
        }

        // 참조로 정렬하고 상위 top_k만 복제
        let mut candidates: Vec<(u64, f32, &Node)> = self
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(seq, node)| {
                node.embedding()
                    .map(|e| (seq as u64, similarity(self.metric, embedding, e), node))
            })
            .collect();
        order_candidates(&mut candidates, top_k);

        Ok(candidates
            .into_iter()
            .map(|(_, score, node)| ScoredNode {
                node: node.clone(),
                score,
            })
            .collect())
    }

    async fn write_payload(&self, dir: &Path) -> KnowledgeResult<()> {
        let json = serde_json::to_string(&self.nodes)?;
        std::fs::write(dir.join(PAYLOAD_FILE), json)?;
        Ok(())
    }

    async fn duplicate(&self) -> KnowledgeResult<Box<dyn IndexStore>> {
        Ok(Box::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::node::Metadata;
    use tempfile::TempDir;

    fn embedded(text: &str, embedding: Vec<f32>) -> Node {
        let mut node = Node::new("doc", text, Metadata::new());
        node.attach_embedding(embedding);
        node
    }

    fn sample() -> InMemoryIndex {
        InMemoryIndex::new(
            SimilarityMetric::Cosine,
            2,
            vec![
                embedded("east", vec![1.0, 0.0]),
                embedded("north", vec![0.0, 1.0]),
                embedded("north-east", vec![1.0, 1.0]),
            ],
        )
    }

    #[tokio::test]
    async fn test_query_orders_by_score() {
        let index = sample();
        let results = index.query(&[1.0, 0.1], 2).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].node.text, "east");
        assert_eq!(results[1].node.text, "north-east");
        assert!(results[0].score >= results[1].score);
    }

    #[tokio::test]
    async fn test_top_k_larger_than_index() {
        let index = sample();
        assert_eq!(index.query(&[1.0, 0.0], 10).await.unwrap().len(), 3);
        assert!(index.query(&[1.0, 0.0], 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_query_ties_keep_insertion_order() {
        let nodes: Vec<Node> = (0..50)
            .map(|i| embedded(&format!("copy {}", i), vec![2.0, 2.0]))
            .collect();
        let index = InMemoryIndex::new(SimilarityMetric::Cosine, 2, nodes);

        let results = index.query(&[1.0, 1.0], 2).await.unwrap();
        let texts: Vec<&str> = results.iter().map(|r| r.node.text.as_str()).collect();
        assert_eq!(texts, vec!["copy 0", "copy 1"]);
        assert_eq!(results[0].node, index.nodes()[0]);
    }

    #[tokio::test]
    async fn test_query_dimension_mismatch() {
        let err = sample().query(&[1.0, 0.0, 0.0], 1).await.unwrap_err();
        assert!(matches!(err, KnowledgeError::Index { .. }));
    }

    #[tokio::test]
    async fn test_insert_rejects_unembedded_nodes() {
        let mut index = sample();
        let plain = Node::new("doc", "no vector", Metadata::new());
        assert!(index.insert(vec![plain]).await.is_err());
        assert_eq!(index.len(), 3);

        index.insert(vec![embedded("west", vec![-1.0, 0.0])]).await.unwrap();
        assert_eq!(index.len(), 4);
    }

    #[tokio::test]
    async fn test_payload_round_trip_and_duplicate_isolation() {
        let dir = TempDir::new().unwrap();
        let index = sample();
        index.write_payload(dir.path()).await.unwrap();

        let loaded = InMemoryIndex::load(SimilarityMetric::Cosine, 2, dir.path()).unwrap();
        assert_eq!(loaded.nodes(), index.nodes());

        let mut copy = index.duplicate().await.unwrap();
        copy.insert(vec![embedded("west", vec![-1.0, 0.0])]).await.unwrap();
        assert_eq!(copy.len(), 4);
        assert_eq!(index.len(), 3);
    }
}
