//! 인덱스 저장소 모듈
//!
//! 임베딩이 붙은 Node로 검색 가능한 인덱스를 만들고, 아티팩트로 영속화하고,
//! 다시 불러옵니다. 백엔드는 설정의 `index.backend`로 고릅니다.
//!
//! - `memory`: 프로세스 내 벡터 목록 (페이로드 `nodes.json`)
//! - `lance`: 비공개 작업 디렉토리의 LanceDB 데이터셋 (페이로드 `vectors.lance/`)
//!
//! 검색 결과는 점수 내림차순이며, 동점이면 삽입 순서를 따릅니다.

pub mod artifact;
pub mod lance;
pub mod memory;

use std::path::Path;

use async_trait::async_trait;

pub use artifact::{ArtifactStatus, IndexManifest};
pub use lance::LanceIndex;
pub use memory::InMemoryIndex;

use crate::config::{IndexBackend, IndexSettings, SimilarityMetric};
use crate::error::{KnowledgeError, KnowledgeResult};
use crate::knowledge::node::{Node, ScoredNode};

// ============================================================================
// IndexStore Trait
// ============================================================================

/// 검색 가능한 Node 인덱스
#[async_trait]
pub trait IndexStore: Send + Sync {
    fn backend(&self) -> IndexBackend;

    fn metric(&self) -> SimilarityMetric;

    /// 인덱싱된 Node 수
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 증분 삽입 지원 여부
    fn supports_insert(&self) -> bool {
        false
    }

    /// 임베딩된 Node 추가 (삽입 순서 유지)
    async fn insert(&mut self, nodes: Vec<Node>) -> KnowledgeResult<usize> {
        let _ = nodes;
        Err(KnowledgeError::index(
            self.len(),
            format!("{:?} index does not support incremental insert", self.backend()),
        ))
    }

    /// 상위 `top_k` Node (점수 내림차순, 동점은 삽입 순)
    async fn query(&self, embedding: &[f32], top_k: usize) -> KnowledgeResult<Vec<ScoredNode>>;

    /// 아티팩트 페이로드를 `dir`에 기록
    async fn write_payload(&self, dir: &Path) -> KnowledgeResult<()>;

    /// 공유 상태가 없는 독립 복사본
    async fn duplicate(&self) -> KnowledgeResult<Box<dyn IndexStore>>;
}

// ============================================================================
// Build / Load
// ============================================================================

/// 새 인덱스 빌드
///
/// `work_root`는 lance 작업 디렉토리를 만들 위치 (없으면 시스템 임시 디렉토리).
pub async fn build_index(
    settings: IndexSettings,
    dimension: usize,
    nodes: Vec<Node>,
    work_root: Option<&Path>,
) -> KnowledgeResult<Box<dyn IndexStore>> {
    check_embeddings(&nodes, dimension, 0)?;

    let index: Box<dyn IndexStore> = match settings.backend {
        IndexBackend::Memory => Box::new(InMemoryIndex::new(settings.metric, dimension, nodes)),
        IndexBackend::Lance => {
            Box::new(LanceIndex::create(settings.metric, dimension, nodes, work_root).await?)
        }
    };

    tracing::debug!(
        "Built {:?} index with {} nodes",
        settings.backend,
        index.len()
    );
    Ok(index)
}

/// 아티팩트 페이로드에서 인덱스 복원
pub async fn load_index(
    settings: IndexSettings,
    dimension: usize,
    payload_dir: &Path,
    work_root: Option<&Path>,
) -> KnowledgeResult<Box<dyn IndexStore>> {
    let index: Box<dyn IndexStore> = match settings.backend {
        IndexBackend::Memory => {
            Box::new(InMemoryIndex::load(settings.metric, dimension, payload_dir)?)
        }
        IndexBackend::Lance => {
            Box::new(LanceIndex::load(settings.metric, dimension, payload_dir, work_root).await?)
        }
    };
    Ok(index)
}

/// 모든 Node에 `dimension` 차원 임베딩이 있는지 확인
pub(crate) fn check_embeddings(
    nodes: &[Node],
    dimension: usize,
    already_indexed: usize,
) -> KnowledgeResult<()> {
    for (i, node) in nodes.iter().enumerate() {
        match node.embedding() {
            Some(embedding) if embedding.len() == dimension => {}
            Some(embedding) => {
                return Err(KnowledgeError::index(
                    already_indexed + i,
                    format!(
                        "node {} has a {}-dimensional embedding, expected {}",
                        node.node_id,
                        embedding.len(),
                        dimension
                    ),
                ))
            }
            None => {
                return Err(KnowledgeError::index(
                    already_indexed + i,
                    format!("node {} has no embedding", node.node_id),
                ))
            }
        }
    }
    Ok(())
}

// ============================================================================
// Similarity
// ============================================================================

/// 코사인 유사도 (-1.0 ~ 1.0, 영벡터면 0.0)
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product(a, b) / (norm_a * norm_b)
}

pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

pub fn similarity(metric: SimilarityMetric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        SimilarityMetric::Cosine => cosine_similarity(a, b),
        SimilarityMetric::DotProduct => dot_product(a, b),
    }
}

/// 쿼리 벡터 차원 확인
pub(crate) fn check_query(query: &[f32], dimension: usize, indexed: usize) -> KnowledgeResult<()> {
    if query.len() != dimension {
        return Err(KnowledgeError::index(
            indexed,
            format!(
                "query embedding has {} dimensions, index expects {}",
                query.len(),
                dimension
            ),
        ));
    }
    Ok(())
}

/// (삽입 순번, 점수, _) 후보를 점수 내림차순 + 순번 오름차순으로 정렬 후 자름
pub(crate) fn order_candidates<T>(candidates: &mut Vec<(u64, f32, T)>, top_k: usize) {
    candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    candidates.truncate(top_k);
}

/// 소유한 Node 후보의 상위 `top_k`
pub(crate) fn rank(mut candidates: Vec<(u64, f32, Node)>, top_k: usize) -> Vec<ScoredNode> {
    order_candidates(&mut candidates, top_k);
    candidates
        .into_iter()
        .map(|(_, score, node)| ScoredNode { node, score })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
