//! Knowledge - 지식 단위 하나의 파이프라인과 검색
//!
//! 빌드: 처리 단계별 로드 → 청킹 → (전체) 임베딩 → 인덱스 → 아티팩트 영속화
//! 로드: 핑거프린트가 맞는 아티팩트에서 복원 (로더/청커/임베딩 호출 없음)
//!
//! 검색은 내부 읽기 잠금만 사용하므로 여러 에이전트가 공유해도 됩니다.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;

use super::chunker::{default_splitter, run_transformations, ChunkDefaults, Transformer, TransformerRegistry};
use super::node::{Document, Node, ScoredNode};
use crate::config::KnowledgeConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{KnowledgeError, KnowledgeResult};
use crate::index::{self, artifact, IndexManifest, IndexStore};
use crate::loader::{DocumentLoader, LoaderRegistry};

/// 임베딩 배치 크기
pub const EMBED_BATCH_SIZE: usize = 32;

/// lance 작업 디렉토리를 모아두는 storage 하위 디렉토리
const WORK_DIR: &str = ".work";

/// Knowledge가 만들어진 경로
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnowledgeOrigin {
    Built,
    Loaded,
    Duplicated,
}

/// 빌드/로드에 필요한 협력 객체
#[derive(Clone)]
pub struct KnowledgeContext {
    pub loaders: Arc<LoaderRegistry>,
    pub transformers: Arc<TransformerRegistry>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    /// `<storage_dir>/<knowledge_id>` (없으면 영속화하지 않음)
    pub artifact_dir: Option<PathBuf>,
}

impl KnowledgeContext {
    fn work_root(&self) -> Option<PathBuf> {
        self.artifact_dir
            .as_deref()
            .and_then(Path::parent)
            .map(|storage| storage.join(WORK_DIR))
    }
}

/// 처리 단계 하나의 로더 + 트랜스포머 체인
pub struct PreparedStep {
    pub loader: Box<dyn DocumentLoader>,
    pub query: Option<String>,
    pub transformers: Vec<Box<dyn Transformer>>,
}

/// 설정의 모든 컴포넌트 생성 (I/O 없음, 모르는 식별자는 설정 에러)
pub fn prepare_steps(
    config: &KnowledgeConfig,
    loaders: &LoaderRegistry,
    transformers: &TransformerRegistry,
) -> KnowledgeResult<Vec<PreparedStep>> {
    config.validate()?;
    let defaults = chunk_defaults(config);

    config
        .data_processing
        .iter()
        .map(|step| {
            let load = step.loader_spec()?;
            Ok(PreparedStep {
                loader: loaders.create(&load.loader)?,
                query: load.query,
                transformers: transformers.pipeline(step.store_and_index.as_ref(), defaults)?,
            })
        })
        .collect()
}

fn chunk_defaults(config: &KnowledgeConfig) -> ChunkDefaults {
    ChunkDefaults {
        chunk_size: config.chunk_size,
        chunk_overlap: config.chunk_overlap,
    }
}

// ============================================================================
// Knowledge
// ============================================================================

pub struct Knowledge {
    config: KnowledgeConfig,
    fingerprint: String,
    embedder: Arc<dyn EmbeddingProvider>,
    index: RwLock<Box<dyn IndexStore>>,
    artifact_dir: Option<PathBuf>,
    work_root: Option<PathBuf>,
    origin: KnowledgeOrigin,
}

impl Knowledge {
    /// 설정으로부터 새로 빌드하고, storage가 있으면 아티팩트를 기록
    pub async fn build(config: KnowledgeConfig, ctx: &KnowledgeContext) -> KnowledgeResult<Self> {
        let steps = prepare_steps(&config, &ctx.loaders, &ctx.transformers)?;
        let fingerprint = config.fingerprint()?;

        tracing::info!(
            "Building knowledge `{}` ({} steps)",
            config.knowledge_id,
            steps.len()
        );

        let mut nodes = Vec::new();
        for (i, step) in steps.iter().enumerate() {
            let documents = step.loader.load(step.query.as_deref()).await?;
            let step_nodes = run_transformations(documents, &step.transformers);
            tracing::debug!(
                "Step {} ({}) produced {} nodes",
                i + 1,
                step.loader.name(),
                step_nodes.len()
            );
            nodes.extend(step_nodes);
        }

        embed_nodes(ctx.embedder.as_ref(), &mut nodes).await?;

        let work_root = ctx.work_root();
        let index = index::build_index(
            config.index,
            ctx.embedder.dimension(),
            nodes,
            work_root.as_deref(),
        )
        .await?;

        let knowledge = Self {
            config,
            fingerprint,
            embedder: ctx.embedder.clone(),
            index: RwLock::new(index),
            artifact_dir: ctx.artifact_dir.clone(),
            work_root,
            origin: KnowledgeOrigin::Built,
        };

        if knowledge.artifact_dir.is_some() {
            knowledge.persist().await?;
        }

        tracing::info!(
            "Built knowledge `{}` with {} nodes",
            knowledge.knowledge_id(),
            knowledge.node_count().await
        );
        Ok(knowledge)
    }

    /// 일치하는 아티팩트에서 복원. 없거나 맞지 않으면 `None`
    pub async fn load(config: KnowledgeConfig, ctx: &KnowledgeContext) -> KnowledgeResult<Option<Self>> {
        config.validate()?;
        let Some(ref dir) = ctx.artifact_dir else {
            return Ok(None);
        };

        let fingerprint = config.fingerprint()?;
        let work_root = ctx.work_root();
        let loaded = artifact::load(
            dir,
            &fingerprint,
            ctx.embedder.name(),
            config.index,
            work_root.as_deref(),
        )
        .await?;

        let Some((manifest, index)) = loaded else {
            return Ok(None);
        };

        if manifest.dimension != ctx.embedder.dimension() {
            tracing::warn!(
                "Artifact for `{}` has dimension {}, embedder has {}",
                config.knowledge_id,
                manifest.dimension,
                ctx.embedder.dimension()
            );
            return Ok(None);
        }

        tracing::info!(
            "Loaded knowledge `{}` ({} nodes) from {:?}",
            config.knowledge_id,
            manifest.node_count,
            dir
        );

        Ok(Some(Self {
            config,
            fingerprint,
            embedder: ctx.embedder.clone(),
            index: RwLock::new(index),
            artifact_dir: ctx.artifact_dir.clone(),
            work_root,
            origin: KnowledgeOrigin::Loaded,
        }))
    }

    /// 로드를 먼저 시도하고 없으면 빌드
    pub async fn build_or_load(config: KnowledgeConfig, ctx: &KnowledgeContext) -> KnowledgeResult<Self> {
        match Self::load(config.clone(), ctx).await? {
            Some(knowledge) => Ok(knowledge),
            None => Self::build(config, ctx).await,
        }
    }

    /// 이미 만든 인덱스로 Knowledge 구성 (영속화 없음)
    pub fn with_index(
        config: KnowledgeConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        index: Box<dyn IndexStore>,
    ) -> KnowledgeResult<Self> {
        config.validate()?;
        Ok(Self {
            fingerprint: config.fingerprint()?,
            config,
            embedder,
            index: RwLock::new(index),
            artifact_dir: None,
            work_root: None,
            origin: KnowledgeOrigin::Built,
        })
    }

    pub fn knowledge_id(&self) -> &str {
        &self.config.knowledge_id
    }

    pub fn config(&self) -> &KnowledgeConfig {
        &self.config
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn origin(&self) -> KnowledgeOrigin {
        self.origin
    }

    pub fn embedding_model(&self) -> &str {
        self.embedder.name()
    }

    pub fn artifact_dir(&self) -> Option<&Path> {
        self.artifact_dir.as_deref()
    }

    pub async fn node_count(&self) -> usize {
        self.index.read().await.len()
    }

    // ------------------------------------------------------------------------
    // Retrieval
    // ------------------------------------------------------------------------

    /// 쿼리와 가장 유사한 Node 최대 `top_k`개 (임계값 미만 점수는 제외)
    pub async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        score_threshold: Option<f32>,
    ) -> KnowledgeResult<Vec<ScoredNode>> {
        if top_k == 0 {
            return Ok(vec![]);
        }

        // 임베딩은 잠금 밖에서
        let embedding = self
            .embedder
            .embed_query(query)
            .await
            .map_err(|e| KnowledgeError::Embedding {
                processed: 0,
                total: 1,
                message: format!("{:#}", e),
            })?;

        let mut results = self.index.read().await.query(&embedding, top_k).await?;
        if let Some(threshold) = score_threshold {
            results.retain(|r| r.score >= threshold);
        }

        tracing::debug!(
            "Retrieved {} nodes from `{}`",
            results.len(),
            self.knowledge_id()
        );
        Ok(results)
    }

    /// 검색 결과의 텍스트만
    pub async fn retrieve_texts(
        &self,
        query: &str,
        top_k: usize,
        score_threshold: Option<f32>,
    ) -> KnowledgeResult<Vec<String>> {
        Ok(self
            .retrieve(query, top_k, score_threshold)
            .await?
            .into_iter()
            .map(|r| r.node.text)
            .collect())
    }

    // ------------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------------

    /// 새 문서만 청킹/임베딩해서 기존 인덱스에 추가
    ///
    /// 청킹은 지식 수준 `chunk_size` / `chunk_overlap`을 쓰는 기본 청커로 합니다.
    /// 아티팩트는 자동으로 다시 쓰지 않습니다 ([`Knowledge::persist`]).
    pub async fn refresh(&self, documents: Vec<Document>) -> KnowledgeResult<usize> {
        if !self.index.read().await.supports_insert() {
            return Err(self.refresh_error("index backend cannot insert incrementally; rebuild instead"));
        }

        let splitter = default_splitter(chunk_defaults(&self.config))?;
        let mut nodes = run_transformations(documents, std::slice::from_ref(&splitter));
        embed_nodes(self.embedder.as_ref(), &mut nodes).await?;

        let added = self.index.write().await.insert(nodes).await?;
        tracing::info!("Refreshed `{}` with {} nodes", self.knowledge_id(), added);
        Ok(added)
    }

    /// 현재 인덱스를 아티팩트로 기록
    pub async fn persist(&self) -> KnowledgeResult<()> {
        let dir = self.artifact_dir.as_deref().ok_or_else(|| {
            KnowledgeError::config(format!(
                "knowledge `{}` has no artifact location",
                self.knowledge_id()
            ))
        })?;

        let index = self.index.read().await;
        let manifest = IndexManifest::new(
            self.knowledge_id(),
            &self.fingerprint,
            index.as_ref(),
            self.embedder.name(),
            self.embedder.dimension(),
        );
        artifact::persist(dir, &manifest, index.as_ref()).await
    }

    /// 독립 복사본 (별도 인덱스 핸들, 아티팩트 위치 없음)
    pub async fn duplicate(&self) -> KnowledgeResult<Self> {
        let index = self.index.read().await.duplicate().await?;
        Ok(Self {
            config: self.config.clone(),
            fingerprint: self.fingerprint.clone(),
            embedder: self.embedder.clone(),
            index: RwLock::new(index),
            artifact_dir: None,
            work_root: self.work_root.clone(),
            origin: KnowledgeOrigin::Duplicated,
        })
    }

    fn refresh_error(&self, message: &str) -> KnowledgeError {
        KnowledgeError::Refresh {
            knowledge_id: self.knowledge_id().to_string(),
            message: message.to_string(),
        }
    }
}

impl std::fmt::Debug for Knowledge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Knowledge")
            .field("knowledge_id", &self.config.knowledge_id)
            .field("backend", &self.config.index.backend)
            .field("origin", &self.origin)
            .finish()
    }
}

/// 모든 Node에 임베딩을 한 번씩 붙임 (배치 단위)
pub async fn embed_nodes(embedder: &dyn EmbeddingProvider, nodes: &mut [Node]) -> KnowledgeResult<()> {
    let total = nodes.len();
    let dimension = embedder.dimension();

    for (batch_no, batch) in nodes.chunks_mut(EMBED_BATCH_SIZE).enumerate() {
        let processed = batch_no * EMBED_BATCH_SIZE;
        let failed = |message: String| KnowledgeError::Embedding {
            processed,
            total,
            message,
        };

        let texts: Vec<String> = batch.iter().map(|n| n.text.clone()).collect();
        let vectors = embedder
            .embed_batch(&texts)
            .await
            .map_err(|e| failed(format!("{:#}", e)))?;

        if vectors.len() != batch.len() {
            return Err(failed(format!(
                "provider returned {} vectors for {} texts",
                vectors.len(),
                batch.len()
            )));
        }

        for (node, vector) in batch.iter_mut().zip(vectors) {
            if vector.len() != dimension {
                return Err(failed(format!(
                    "provider returned {} dimensions, expected {}",
                    vector.len(),
                    dimension
                )));
            }
            if !node.attach_embedding(vector) {
                return Err(failed(format!("node {} is already embedded", node.node_id)));
            }
        }

        tracing::debug!("Embedded {}/{} nodes", processed + batch.len(), total);
    }

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IndexBackend, SimilarityMetric};
    use crate::index::InMemoryIndex;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// 글자 분포 벡터 + 호출 횟수
    #[derive(Default)]
    struct LetterEmbedding {
        calls: AtomicUsize,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl EmbeddingProvider for LetterEmbedding {
        async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_after.map(|limit| n >= limit).unwrap_or(false) {
                anyhow::bail!("quota exceeded");
            }
            let mut v = vec![0.0; 8];
            for c in text.chars().filter(|c| c.is_ascii_alphabetic()) {
                v[(c.to_ascii_lowercase() as usize) % 8] += 1.0;
            }
            Ok(v)
        }

        fn dimension(&self) -> usize {
            8
        }

        fn name(&self) -> &str {
            "letters"
        }
    }

    /// 삽입을 지원하지 않는 인덱스
    struct ReadOnlyIndex;

    #[async_trait]
    impl IndexStore for ReadOnlyIndex {
        fn backend(&self) -> IndexBackend {
            IndexBackend::Memory
        }

        fn metric(&self) -> SimilarityMetric {
            SimilarityMetric::Cosine
        }

        fn len(&self) -> usize {
            0
        }

        async fn query(&self, _embedding: &[f32], _top_k: usize) -> KnowledgeResult<Vec<ScoredNode>> {
            Ok(vec![])
        }

        async fn write_payload(&self, _dir: &Path) -> KnowledgeResult<()> {
            Ok(())
        }

        async fn duplicate(&self) -> KnowledgeResult<Box<dyn IndexStore>> {
            Ok(Box::new(ReadOnlyIndex))
        }
    }

    fn docs_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("cats.md"), "Cats purr and nap in the sun.").unwrap();
        std::fs::write(dir.path().join("rust.md"), "Rust borrow checker rules.").unwrap();
        dir
    }

    fn config(dir: &Path) -> KnowledgeConfig {
        let mut dirs = BTreeMap::new();
        dirs.insert(dir.to_path_buf(), vec![".md".to_string()]);
        KnowledgeConfig::from_data_dirs("pets", "letters", &dirs).unwrap()
    }

    fn context(embedder: Arc<LetterEmbedding>, storage: Option<&Path>) -> KnowledgeContext {
        KnowledgeContext {
            loaders: Arc::new(LoaderRegistry::with_defaults()),
            transformers: Arc::new(TransformerRegistry::with_defaults()),
            embedder,
            artifact_dir: storage.map(|s| s.join("pets")),
        }
    }

    #[tokio::test]
    async fn test_build_and_retrieve() {
        let docs = docs_dir();
        let embedder = Arc::new(LetterEmbedding::default());
        let knowledge = Knowledge::build(config(docs.path()), &context(embedder.clone(), None))
            .await
            .unwrap();

        assert_eq!(knowledge.origin(), KnowledgeOrigin::Built);
        assert_eq!(knowledge.node_count().await, 2);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);

        let texts = knowledge
            .retrieve_texts("Cats purr and nap in the sun.", 1, None)
            .await
            .unwrap();
        assert_eq!(texts, vec!["Cats purr and nap in the sun."]);
        assert!(knowledge.retrieve("cats", 0, None).await.unwrap().is_empty());

        let strict = knowledge.retrieve("cats", 5, Some(1.5)).await.unwrap();
        assert!(strict.is_empty());
    }

    #[tokio::test]
    async fn test_load_skips_embedding() {
        let docs = docs_dir();
        let storage = TempDir::new().unwrap();
        let embedder = Arc::new(LetterEmbedding::default());
        let ctx = context(embedder.clone(), Some(storage.path()));

        let built = Knowledge::build(config(docs.path()), &ctx).await.unwrap();
        let after_build = embedder.calls.load(Ordering::SeqCst);

        let loaded = Knowledge::load(config(docs.path()), &ctx).await.unwrap().unwrap();
        assert_eq!(loaded.origin(), KnowledgeOrigin::Loaded);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), after_build);
        assert_eq!(
            built.retrieve("rust", 2, None).await.unwrap(),
            loaded.retrieve("rust", 2, None).await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_embedding_failure_reports_progress() {
        let docs = docs_dir();
        let embedder = Arc::new(LetterEmbedding {
            fail_after: Some(1),
            ..Default::default()
        });
        let err = Knowledge::build(config(docs.path()), &context(embedder, None))
            .await
            .unwrap_err();

        match err {
            KnowledgeError::Embedding { total, message, .. } => {
                assert_eq!(total, 2);
                assert!(message.contains("quota"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_refresh_and_duplicate_isolation() {
        let docs = docs_dir();
        let embedder = Arc::new(LetterEmbedding::default());
        let original = Knowledge::build(config(docs.path()), &context(embedder, None))
            .await
            .unwrap();

        let copy = original.duplicate().await.unwrap();
        assert_eq!(copy.origin(), KnowledgeOrigin::Duplicated);
        let added = copy
            .refresh(vec![Document::new("new.md", "Dogs bark loudly.")])
            .await
            .unwrap();

        assert_eq!(added, 1);
        assert_eq!(copy.node_count().await, 3);
        assert_eq!(original.node_count().await, 2);
        assert!(copy.persist().await.is_err());
    }

    #[tokio::test]
    async fn test_refresh_unsupported_backend() {
        let docs = docs_dir();
        let knowledge = Knowledge::with_index(
            config(docs.path()),
            Arc::new(LetterEmbedding::default()),
            Box::new(ReadOnlyIndex),
        )
        .unwrap();

        let err = knowledge
            .refresh(vec![Document::new("x.md", "text")])
            .await
            .unwrap_err();
        assert!(matches!(err, KnowledgeError::Refresh { ref knowledge_id, .. } if knowledge_id == "pets"));
    }

    #[tokio::test]
    async fn test_unknown_loader_fails_before_io() {
        let docs = docs_dir();
        let mut cfg = config(docs.path());
        if let Some(load) = cfg.data_processing[0].load_data.as_mut() {
            load.loader.class = "NotALoader".to_string();
        }

        let embedder = Arc::new(LetterEmbedding::default());
        let err = Knowledge::build(cfg, &context(embedder.clone(), None))
            .await
            .unwrap_err();
        assert!(matches!(err, KnowledgeError::Config(_)));
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_embed_nodes_batches() {
        let embedder = LetterEmbedding::default();
        let mut nodes: Vec<Node> = (0..EMBED_BATCH_SIZE + 3)
            .map(|i| Node::new("doc", format!("text {}", i), Default::default()))
            .collect();
        embed_nodes(&embedder, &mut nodes).await.unwrap();
        assert!(nodes.iter().all(|n| n.embedding().is_some()));

        let index = InMemoryIndex::new(SimilarityMetric::Cosine, 8, nodes);
        assert_eq!(index.len(), EMBED_BATCH_SIZE + 3);
    }
}
