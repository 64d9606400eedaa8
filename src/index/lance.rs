//! LanceDB 인덱스
//!
//! 데이터셋은 인덱스마다 비공개 작업 디렉토리에 두고, 영속화/복제는
//! 데이터셋 디렉토리 복사로 처리합니다. 인덱스가 drop되면 작업 디렉토리도
//! 지워집니다.
//! ref: https://lancedb.github.io/lancedb/

use std::path::Path;
use std::sync::Arc;

use arrow_array::{
    Array, ArrayRef, FixedSizeListArray, Float32Array, Int64Array, RecordBatch,
    RecordBatchIterator, StringArray,
};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::connection::Connection;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::table::Table;
use lancedb::DistanceType;
use tempfile::TempDir;
use walkdir::WalkDir;

use super::{check_embeddings, check_query, rank, similarity, IndexStore};
use crate::config::{IndexBackend, SimilarityMetric};
use crate::error::{KnowledgeError, KnowledgeResult};
use crate::knowledge::node::{Metadata, Node, ScoredNode};

/// 벡터 테이블 이름
const TABLE_NAME: &str = "vectors";
/// 연결 디렉토리 안의 데이터셋 디렉토리 (= 페이로드 이름)
pub const DATASET_DIR: &str = "vectors.lance";

/// 동점 처리를 위해 top_k보다 더 가져오는 후보 수
const CANDIDATE_MARGIN: usize = 16;
/// lance 거리와 다시 계산한 점수 사이의 부동소수 오차
const TIE_EPSILON: f32 = 1e-6;

pub struct LanceIndex {
    metric: SimilarityMetric,
    dimension: usize,
    /// `work`보다 먼저 drop되어야 함
    table: Table,
    len: usize,
    work: TempDir,
}

impl LanceIndex {
    /// 새 작업 디렉토리에 데이터셋 생성
    pub async fn create(
        metric: SimilarityMetric,
        dimension: usize,
        nodes: Vec<Node>,
        work_root: Option<&Path>,
    ) -> KnowledgeResult<Self> {
        check_embeddings(&nodes, dimension, 0)?;

        let work = work_dir(work_root)?;
        let db = connect(work.path()).await?;
        let schema = create_schema(dimension);

        let created = if nodes.is_empty() {
            db.create_empty_table(TABLE_NAME, schema.clone())
                .execute()
                .await
        } else {
            let batch = nodes_to_batch(&schema, dimension, &nodes, 0)?;
            let batches = RecordBatchIterator::new(vec![Ok(batch)], schema.clone());
            db.create_table(TABLE_NAME, batches).execute().await
        };
        let table = created.map_err(|e| KnowledgeError::index(0, e))?;

        tracing::debug!(
            "Created lance dataset with {} nodes in {:?}",
            nodes.len(),
            work.path()
        );

        Ok(Self {
            metric,
            dimension,
            table,
            len: nodes.len(),
            work,
        })
    }

    /// 페이로드 디렉토리의 데이터셋을 새 작업 디렉토리로 복사해서 열기
    pub async fn load(
        metric: SimilarityMetric,
        dimension: usize,
        payload_dir: &Path,
        work_root: Option<&Path>,
    ) -> KnowledgeResult<Self> {
        let source = payload_dir.join(DATASET_DIR);
        if !source.is_dir() {
            return Err(KnowledgeError::load(&source, "lance dataset not found"));
        }

        let work = work_dir(work_root)?;
        copy_dir(&source, &work.path().join(DATASET_DIR))?;
        Self::open(metric, dimension, work).await
    }

    async fn open(metric: SimilarityMetric, dimension: usize, work: TempDir) -> KnowledgeResult<Self> {
        let db = connect(work.path()).await?;
        let table = db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(|e| KnowledgeError::index(0, e))?;
        let len = table
            .count_rows(None)
            .await
            .map_err(|e| KnowledgeError::index(0, e))?;

        Ok(Self {
            metric,
            dimension,
            table,
            len,
            work,
        })
    }

    /// 최근접 `limit`개 후보 (점수는 저장된 임베딩으로 다시 계산)
    async fn search(&self, embedding: &[f32], limit: usize) -> KnowledgeResult<Vec<(u64, f32, Node)>> {
        let stream = self
            .table
            .vector_search(embedding.to_vec())
            .map_err(|e| KnowledgeError::index(self.len, e))?
            .distance_type(distance_type(self.metric))
            .limit(limit)
            .execute()
            .await
            .map_err(|e| KnowledgeError::index(self.len, e))?;
        let batches: Vec<RecordBatch> = stream
            .try_collect()
            .await
            .map_err(|e| KnowledgeError::index(self.len, e))?;

        // memory 백엔드와 같은 척도
        let mut candidates = Vec::with_capacity(limit);
        for batch in &batches {
            for (seq, node) in batch_to_nodes(batch)? {
                let score = node
                    .embedding()
                    .map(|e| similarity(self.metric, embedding, e))
                    .unwrap_or(0.0);
                candidates.push((seq as u64, score, node));
            }
        }
        Ok(candidates)
    }

    /// 작업 디렉토리 위치 (테스트/진단용)
    pub fn work_path(&self) -> &Path {
        self.work.path()
    }
}

#[async_trait]
impl IndexStore for LanceIndex {
    fn backend(&self) -> IndexBackend {
        IndexBackend::Lance
    }

    fn metric(&self) -> SimilarityMetric {
        self.metric
    }

    fn len(&self) -> usize {
        self.len
    }

    fn supports_insert(&self) -> bool {
        true
    }

    async fn insert(&mut self, nodes: Vec<Node>) -> KnowledgeResult<usize> {
        check_embeddings(&nodes, self.dimension, self.len)?;
        if nodes.is_empty() {
            return Ok(0);
        }

        // seq는 행 번호와 같음 (삭제가 없음)
        let schema = create_schema(self.dimension);
        let batch = nodes_to_batch(&schema, self.dimension, &nodes, self.len as i64)?;
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
        self.table
            .add(batches)
            .execute()
            .await
            .map_err(|e| KnowledgeError::index(self.len, e))?;

        self.len += nodes.len();
        Ok(nodes.len())
    }

    async fn query(&self, embedding: &[f32], top_k: usize) -> KnowledgeResult<Vec<ScoredNode>> {
        check_query(embedding, self.dimension, self.len)?;
        if top_k == 0 || self.len == 0 {
            return Ok(vec![]);
        }

        // 후보 경계까지 동점이 이어지면 순번이 더 앞선 동점 Node가 빠졌을 수
        // 있으므로 전체 행 수까지 두 배씩 넓혀서 다시 검색
        let mut limit = (top_k + CANDIDATE_MARGIN).min(self.len);
        loop {
            let candidates = self.search(embedding, limit).await?;
            if limit < self.len && tie_reaches_boundary(&candidates, top_k) {
                tracing::debug!("Tie group reaches {} candidates, widening search", limit);
                limit = (limit * 2).min(self.len);
                continue;
            }
            return Ok(rank(candidates, top_k));
        }
    }

    async fn write_payload(&self, dir: &Path) -> KnowledgeResult<()> {
        copy_dir(&self.work.path().join(DATASET_DIR), &dir.join(DATASET_DIR))
    }

    async fn duplicate(&self) -> KnowledgeResult<Box<dyn IndexStore>> {
        let root = self.work.path().parent();
        let work = work_dir(root)?;
        copy_dir(
            &self.work.path().join(DATASET_DIR),
            &work.path().join(DATASET_DIR),
        )?;
        Ok(Box::new(Self::open(self.metric, self.dimension, work).await?))
    }
}

// ============================================================================
// Arrow Conversion
// ============================================================================

fn create_schema(dimension: usize) -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("node_id", DataType::Utf8, false),
        Field::new("seq", DataType::Int64, false),
        Field::new("ref_doc_id", DataType::Utf8, false),
        Field::new("text", DataType::Utf8, false),
        Field::new("metadata", DataType::Utf8, false),
        Field::new("prev_id", DataType::Utf8, true),
        Field::new("next_id", DataType::Utf8, true),
        Field::new(
            "embedding",
            DataType::FixedSizeList(
                Arc::new(Field::new("item", DataType::Float32, true)),
                dimension as i32,
            ),
            false,
        ),
    ]))
}

fn nodes_to_batch(
    schema: &SchemaRef,
    dimension: usize,
    nodes: &[Node],
    first_seq: i64,
) -> KnowledgeResult<RecordBatch> {
    let processed = first_seq as usize;

    let ids: Vec<&str> = nodes.iter().map(|n| n.node_id.as_str()).collect();
    let seqs: Vec<i64> = (0..nodes.len()).map(|i| first_seq + i as i64).collect();
    let refs: Vec<&str> = nodes.iter().map(|n| n.ref_doc_id.as_str()).collect();
    let texts: Vec<&str> = nodes.iter().map(|n| n.text.as_str()).collect();
    let metadata = nodes
        .iter()
        .map(|n| serde_json::to_string(&n.metadata))
        .collect::<Result<Vec<String>, _>>()?;
    let prev: Vec<Option<&str>> = nodes.iter().map(|n| n.prev_id.as_deref()).collect();
    let next: Vec<Option<&str>> = nodes.iter().map(|n| n.next_id.as_deref()).collect();

    // 임베딩을 FixedSizeList로 변환
    let flat: Vec<f32> = nodes
        .iter()
        .flat_map(|n| n.embedding().unwrap_or(&[]).iter().copied())
        .collect();
    let item = Arc::new(Field::new("item", DataType::Float32, true));
    let embeddings = FixedSizeListArray::try_new(
        item,
        dimension as i32,
        Arc::new(Float32Array::from(flat)) as ArrayRef,
        None,
    )
    .map_err(|e| KnowledgeError::index(processed, e))?;

    RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(StringArray::from(ids)),
            Arc::new(Int64Array::from(seqs)),
            Arc::new(StringArray::from(refs)),
            Arc::new(StringArray::from(texts)),
            Arc::new(StringArray::from(metadata)),
            Arc::new(StringArray::from(prev)),
            Arc::new(StringArray::from(next)),
            Arc::new(embeddings),
        ],
    )
    .map_err(|e| KnowledgeError::index(processed, e))
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> KnowledgeResult<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| KnowledgeError::index(0, format!("missing column `{}`", name)))
}

fn optional(array: &StringArray, i: usize) -> Option<String> {
    if array.is_null(i) {
        None
    } else {
        Some(array.value(i).to_string())
    }
}

fn batch_to_nodes(batch: &RecordBatch) -> KnowledgeResult<Vec<(i64, Node)>> {
    let ids = column::<StringArray>(batch, "node_id")?;
    let seqs = column::<Int64Array>(batch, "seq")?;
    let refs = column::<StringArray>(batch, "ref_doc_id")?;
    let texts = column::<StringArray>(batch, "text")?;
    let metadata = column::<StringArray>(batch, "metadata")?;
    let prev = column::<StringArray>(batch, "prev_id")?;
    let next = column::<StringArray>(batch, "next_id")?;
    let embeddings = column::<FixedSizeListArray>(batch, "embedding")?;

    let mut nodes = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        let meta: Metadata = serde_json::from_str(metadata.value(i))?;
        let mut node = Node::new(refs.value(i), texts.value(i), meta);
        node.node_id = ids.value(i).to_string();
        node.prev_id = optional(prev, i);
        node.next_id = optional(next, i);

        let vector = embeddings.value(i);
        let values = vector
            .as_any()
            .downcast_ref::<Float32Array>()
            .ok_or_else(|| KnowledgeError::index(0, "embedding column is not float32"))?;
        node.attach_embedding(values.values().to_vec());

        nodes.push((seqs.value(i), node));
    }
    Ok(nodes)
}

/// top_k 번째 점수가 후보 중 최저 점수와 같은지
fn tie_reaches_boundary(candidates: &[(u64, f32, Node)], top_k: usize) -> bool {
    let mut scores: Vec<f32> = candidates.iter().map(|c| c.1).collect();
    scores.sort_by(|a, b| b.total_cmp(a));
    match (scores.get(top_k.saturating_sub(1)).or(scores.last()), scores.last()) {
        (Some(kth), Some(lowest)) => kth - lowest <= TIE_EPSILON,
        _ => false,
    }
}

fn distance_type(metric: SimilarityMetric) -> DistanceType {
    match metric {
        SimilarityMetric::Cosine => DistanceType::Cosine,
        SimilarityMetric::DotProduct => DistanceType::Dot,
    }
}

// ============================================================================
// Working Directory
// ============================================================================

async fn connect(dir: &Path) -> KnowledgeResult<Connection> {
    let uri = dir
        .to_str()
        .ok_or_else(|| KnowledgeError::load(dir, "invalid path encoding"))?;
    lancedb::connect(uri)
        .execute()
        .await
        .map_err(|e| KnowledgeError::index(0, e))
}

fn work_dir(root: Option<&Path>) -> KnowledgeResult<TempDir> {
    let dir = match root {
        Some(root) => {
            std::fs::create_dir_all(root)?;
            tempfile::Builder::new().prefix("lance-").tempdir_in(root)?
        }
        None => tempfile::Builder::new().prefix("lance-").tempdir()?,
    };
    Ok(dir)
}

/// 디렉토리 트리 복사
fn copy_dir(src: &Path, dst: &Path) -> KnowledgeResult<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| KnowledgeError::load(src, e))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| KnowledgeError::load(src, e))?;
        let target = dst.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DIM: usize = 4;

    fn embedded(text: &str, embedding: [f32; DIM]) -> Node {
        let mut node = Node::new("doc", text, Metadata::new());
        node.metadata
            .insert("file_name".to_string(), serde_json::Value::from("a.md"));
        node.attach_embedding(embedding.to_vec());
        node
    }

    fn sample_nodes() -> Vec<Node> {
        let mut nodes = vec![
            embedded("alpha", [1.0, 0.0, 0.0, 0.0]),
            embedded("beta", [0.0, 1.0, 0.0, 0.0]),
            embedded("gamma", [0.9, 0.1, 0.0, 0.0]),
        ];
        crate::knowledge::node::link_siblings(&mut nodes);
        nodes
    }

    #[tokio::test]
    async fn test_lance_create_and_search() {
        let root = TempDir::new().unwrap();
        let index = LanceIndex::create(SimilarityMetric::Cosine, DIM, sample_nodes(), Some(root.path()))
            .await
            .unwrap();
        assert_eq!(index.len(), 3);

        let results = index.query(&[1.0, 0.0, 0.0, 0.0], 2).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].node.text, "alpha");
        assert_eq!(results[1].node.text, "gamma");
        assert_eq!(results[0].node.metadata["file_name"], serde_json::Value::from("a.md"));
        assert!(results[0].node.next_id.is_some());
        assert_eq!(results[0].node.embedding().map(|e| e.len()), Some(DIM));
    }

    #[tokio::test]
    async fn test_lance_empty_and_insert() {
        let root = TempDir::new().unwrap();
        let mut index = LanceIndex::create(SimilarityMetric::DotProduct, DIM, vec![], Some(root.path()))
            .await
            .unwrap();
        assert!(index.query(&[1.0, 0.0, 0.0, 0.0], 5).await.unwrap().is_empty());

        index.insert(sample_nodes()).await.unwrap();
        assert_eq!(index.len(), 3);
        assert_eq!(index.query(&[0.0, 1.0, 0.0, 0.0], 5).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_lance_payload_round_trip() {
        let root = TempDir::new().unwrap();
        let payload = TempDir::new().unwrap();
        let index = LanceIndex::create(SimilarityMetric::Cosine, DIM, sample_nodes(), Some(root.path()))
            .await
            .unwrap();
        index.write_payload(payload.path()).await.unwrap();

        let loaded = LanceIndex::load(SimilarityMetric::Cosine, DIM, payload.path(), Some(root.path()))
            .await
            .unwrap();
        assert_ne!(loaded.work_path(), index.work_path());

        let query = [0.5, 0.5, 0.0, 0.0];
        assert_eq!(
            index.query(&query, 3).await.unwrap(),
            loaded.query(&query, 3).await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_lance_duplicate_is_independent() {
        let root = TempDir::new().unwrap();
        let index = LanceIndex::create(SimilarityMetric::Cosine, DIM, sample_nodes(), Some(root.path()))
            .await
            .unwrap();

        let mut copy = index.duplicate().await.unwrap();
        copy.insert(vec![embedded("delta", [0.0, 0.0, 1.0, 0.0])])
            .await
            .unwrap();

        assert_eq!(copy.len(), 4);
        assert_eq!(index.len(), 3);
        assert_eq!(index.table.count_rows(None).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_large_tie_group_matches_memory_order() {
        let root = TempDir::new().unwrap();
        let mut nodes: Vec<Node> = (0..40)
            .map(|i| embedded(&format!("same {}", i), [1.0, 0.0, 0.0, 0.0]))
            .collect();
        nodes.push(embedded("other", [0.0, 1.0, 0.0, 0.0]));
        nodes.push(embedded("near", [0.5, 0.5, 0.0, 0.0]));

        let memory = crate::index::InMemoryIndex::new(SimilarityMetric::Cosine, DIM, nodes.clone());
        let lance = LanceIndex::create(SimilarityMetric::Cosine, DIM, nodes, Some(root.path()))
            .await
            .unwrap();

        let query = [1.0, 0.0, 0.0, 0.0];
        let texts = |results: Vec<ScoredNode>| -> Vec<String> {
            results.into_iter().map(|r| r.node.text).collect()
        };
        let expected = vec!["same 0", "same 1", "same 2"];
        assert_eq!(texts(memory.query(&query, 3).await.unwrap()), expected);
        assert_eq!(texts(lance.query(&query, 3).await.unwrap()), expected);
    }

    #[test]
    fn test_tie_reaches_boundary() {
        let candidates = |scores: &[f32]| -> Vec<(u64, f32, Node)> {
            scores
                .iter()
                .enumerate()
                .map(|(i, s)| (i as u64, *s, Node::new("doc", "x", Metadata::new())))
                .collect()
        };
        assert!(tie_reaches_boundary(&candidates(&[0.9, 0.5, 0.5, 0.5]), 2));
        assert!(!tie_reaches_boundary(&candidates(&[0.9, 0.5, 0.5, 0.1]), 2));
        assert!(!tie_reaches_boundary(&[], 3));
    }

    #[tokio::test]
    async fn test_missing_payload_is_load_error() {
        let root = TempDir::new().unwrap();
        let err = LanceIndex::load(SimilarityMetric::Cosine, DIM, root.path(), None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, KnowledgeError::Load { .. }));
    }

    #[test]
    fn test_copy_dir() {
        let src = TempDir::new().unwrap();
        std::fs::create_dir_all(src.path().join("a/b")).unwrap();
        std::fs::write(src.path().join("a/b/file.bin"), b"data").unwrap();

        let dst = TempDir::new().unwrap();
        copy_dir(src.path(), &dst.path().join("copy")).unwrap();
        assert_eq!(
            std::fs::read(dst.path().join("copy/a/b/file.bin")).unwrap(),
            b"data"
        );
    }
}
