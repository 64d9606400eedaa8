//! KnowledgeBank - 지식 레지스트리와 에이전트 장착
//!
//! 명시적으로 생성해서 넘겨 쓰는 레지스트리입니다 (전역 싱글톤 없음).
//! 같은 ID의 동시 추가는 하나만 성공하고, 레지스트리 잠금은 임베딩이나
//! I/O 동안 잡고 있지 않습니다 (ID를 예약한 뒤 잠금 밖에서 빌드).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::{load_knowledge_configs, BankSettings, KnowledgeConfig, RagAgentConfig};
use crate::embedding::EmbeddingRegistry;
use crate::error::{KnowledgeError, KnowledgeResult};
use crate::index::{artifact, ArtifactStatus};
use crate::knowledge::chunker::TransformerRegistry;
use crate::knowledge::engine::{prepare_steps, Knowledge, KnowledgeContext};
use crate::knowledge::node::ScoredNode;
use crate::knowledge::retriever::KnowledgeRetriever;
use crate::loader::LoaderRegistry;

// ============================================================================
// Agent Interface
// ============================================================================

/// 검색기를 받을 수 있는 에이전트 쪽 부착점
pub trait RetrieverHost {
    fn attach_retriever(&mut self, knowledge_id: &str, retriever: KnowledgeRetriever);
}

/// 장착 순서를 유지하는 기본 검색기 목록
#[derive(Debug, Default, Clone)]
pub struct RetrieverSet {
    retrievers: Vec<KnowledgeRetriever>,
}

impl RetrieverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.retrievers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.retrievers.is_empty()
    }

    pub fn get(&self, knowledge_id: &str) -> Option<&KnowledgeRetriever> {
        self.retrievers
            .iter()
            .find(|r| r.knowledge_id() == knowledge_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &KnowledgeRetriever> {
        self.retrievers.iter()
    }

    /// 모든 검색기에 같은 쿼리 (장착 순서대로)
    pub async fn retrieve_all(&self, query: &str) -> KnowledgeResult<Vec<(String, Vec<ScoredNode>)>> {
        let mut results = Vec::with_capacity(self.retrievers.len());
        for retriever in &self.retrievers {
            results.push((
                retriever.knowledge_id().to_string(),
                retriever.retrieve(query).await?,
            ));
        }
        Ok(results)
    }
}

impl RetrieverHost for RetrieverSet {
    fn attach_retriever(&mut self, knowledge_id: &str, retriever: KnowledgeRetriever) {
        // 같은 ID는 교체
        self.retrievers.retain(|r| r.knowledge_id() != knowledge_id);
        self.retrievers.push(retriever);
    }
}

// ============================================================================
// Knowledge Source
// ============================================================================

/// 지식 추가 입력: 디렉토리 매핑 또는 전체 설정 중 정확히 하나
#[derive(Debug, Clone)]
pub enum KnowledgeSource {
    /// 디렉토리 → 확장자 목록 (기본 설정으로 확장)
    DataDirs(BTreeMap<PathBuf, Vec<String>>),
    Config(KnowledgeConfig),
}

impl KnowledgeSource {
    /// 선택적 입력 두 개에서 생성 (둘 다 없거나 둘 다 있으면 설정 에러)
    pub fn from_parts(
        data_dirs_and_types: Option<BTreeMap<PathBuf, Vec<String>>>,
        knowledge_config: Option<KnowledgeConfig>,
    ) -> KnowledgeResult<Self> {
        match (data_dirs_and_types, knowledge_config) {
            (Some(dirs), None) => Ok(Self::DataDirs(dirs)),
            (None, Some(config)) => Ok(Self::Config(config)),
            (None, None) => Err(KnowledgeError::config(
                "either data_dirs_and_types or knowledge_config is required",
            )),
            (Some(_), Some(_)) => Err(KnowledgeError::config(
                "data_dirs_and_types and knowledge_config are mutually exclusive",
            )),
        }
    }
}

// ============================================================================
// KnowledgeBank
// ============================================================================

#[derive(Default)]
struct BankState {
    entries: HashMap<String, Arc<Knowledge>>,
    /// 빌드 중인 ID
    pending: HashSet<String>,
}

/// 빌드 동안 ID를 점유. commit 없이 drop되면 예약 해제
struct Reservation<'a> {
    state: &'a RwLock<BankState>,
    knowledge_id: String,
    committed: bool,
}

impl Reservation<'_> {
    fn commit(mut self, knowledge: Arc<Knowledge>) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.pending.remove(&self.knowledge_id);
        state.entries.insert(self.knowledge_id.clone(), knowledge);
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            state.pending.remove(&self.knowledge_id);
        }
    }
}

pub struct KnowledgeBank {
    settings: BankSettings,
    embeddings: EmbeddingRegistry,
    loaders: Arc<LoaderRegistry>,
    transformers: Arc<TransformerRegistry>,
    state: RwLock<BankState>,
}

impl KnowledgeBank {
    pub fn new(settings: BankSettings, embeddings: EmbeddingRegistry) -> Self {
        Self {
            settings,
            embeddings,
            loaders: Arc::new(LoaderRegistry::with_defaults()),
            transformers: Arc::new(TransformerRegistry::with_defaults()),
            state: RwLock::new(BankState::default()),
        }
    }

    /// 설정 파일의 모든 지식으로 미리 채운 KnowledgeBank
    pub async fn from_config_file(
        settings: BankSettings,
        embeddings: EmbeddingRegistry,
        path: &Path,
    ) -> KnowledgeResult<Self> {
        let bank = Self::new(settings, embeddings);
        let configs = load_knowledge_configs(path)?;
        bank.add_configs(configs, false).await?;
        Ok(bank)
    }

    /// 기본 로더 대신 사용할 레지스트리 (커스텀 로더 등록용)
    pub fn with_loaders(mut self, loaders: LoaderRegistry) -> Self {
        self.loaders = Arc::new(loaders);
        self
    }

    pub fn with_transformers(mut self, transformers: TransformerRegistry) -> Self {
        self.transformers = Arc::new(transformers);
        self
    }

    pub fn settings(&self) -> &BankSettings {
        &self.settings
    }

    fn read_state(&self) -> RwLockReadGuard<'_, BankState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, BankState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn reserve(&self, knowledge_id: &str) -> KnowledgeResult<Reservation<'_>> {
        let mut state = self.write_state();
        if state.entries.contains_key(knowledge_id) || state.pending.contains(knowledge_id) {
            return Err(KnowledgeError::DuplicateKnowledge(knowledge_id.to_string()));
        }
        state.pending.insert(knowledge_id.to_string());
        Ok(Reservation {
            state: &self.state,
            knowledge_id: knowledge_id.to_string(),
            committed: false,
        })
    }

    /// 등록된 ID를 재빌드용으로 예약 (기존 항목은 그대로 조회 가능)
    fn reserve_existing(&self, knowledge_id: &str) -> KnowledgeResult<(Reservation<'_>, Arc<Knowledge>)> {
        let mut state = self.write_state();
        if state.pending.contains(knowledge_id) {
            return Err(KnowledgeError::Busy(knowledge_id.to_string()));
        }
        let existing = state
            .entries
            .get(knowledge_id)
            .cloned()
            .ok_or_else(|| KnowledgeError::NotFound(knowledge_id.to_string()))?;
        state.pending.insert(knowledge_id.to_string());
        let reservation = Reservation {
            state: &self.state,
            knowledge_id: knowledge_id.to_string(),
            committed: false,
        };
        Ok((reservation, existing))
    }

    fn context(&self, config: &KnowledgeConfig) -> KnowledgeResult<KnowledgeContext> {
        Ok(KnowledgeContext {
            loaders: self.loaders.clone(),
            transformers: self.transformers.clone(),
            embedder: self.embeddings.resolve(&config.emb_model_config_name)?,
            artifact_dir: self.settings.artifact_dir(&config.knowledge_id),
        })
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// 데이터로부터 지식을 만들어 등록 (아티팩트가 맞으면 로드, 아니면 빌드)
    pub async fn add_data_as_knowledge(
        &self,
        knowledge_id: &str,
        emb_model_config_name: &str,
        source: KnowledgeSource,
    ) -> KnowledgeResult<Arc<Knowledge>> {
        let config = match source {
            KnowledgeSource::DataDirs(dirs) => {
                KnowledgeConfig::from_data_dirs(knowledge_id, emb_model_config_name, &dirs)?
            }
            KnowledgeSource::Config(config) => {
                if config.knowledge_id != knowledge_id {
                    return Err(KnowledgeError::config(format!(
                        "knowledge_id `{}` does not match config id `{}`",
                        knowledge_id, config.knowledge_id
                    )));
                }
                if config.emb_model_config_name != emb_model_config_name {
                    return Err(KnowledgeError::config(format!(
                        "emb_model_config_name `{}` does not match config value `{}`",
                        emb_model_config_name, config.emb_model_config_name
                    )));
                }
                config
            }
        };

        self.add_config(config, false).await
    }

    /// 설정 하나를 등록. `force_rebuild`면 아티팩트를 무시하고 빌드
    pub async fn add_config(
        &self,
        config: KnowledgeConfig,
        force_rebuild: bool,
    ) -> KnowledgeResult<Arc<Knowledge>> {
        // 모든 검증은 예약 전에
        prepare_steps(&config, &self.loaders, &self.transformers)?;
        let ctx = self.context(&config)?;

        let reservation = self.reserve(&config.knowledge_id)?;
        let knowledge = if force_rebuild {
            Knowledge::build(config, &ctx).await?
        } else {
            Knowledge::build_or_load(config, &ctx).await?
        };

        let knowledge = Arc::new(knowledge);
        reservation.commit(knowledge.clone());
        tracing::info!(
            "Registered knowledge `{}` ({:?})",
            knowledge.knowledge_id(),
            knowledge.origin()
        );
        Ok(knowledge)
    }

    /// 여러 설정을 동시에 등록
    ///
    /// 빌드를 시작하기 전에 모든 설정의 컴포넌트, 임베딩 이름, ID 중복을
    /// 확인하므로 하나라도 잘못되면 아무것도 임베딩하지 않습니다.
    /// 검증 이후 서로 다른 지식의 빌드는 독립적이라, 하나가 실패해도 이미
    /// 성공한 지식은 등록된 채로 남고 첫 에러를 반환합니다.
    pub async fn add_configs(
        &self,
        configs: Vec<KnowledgeConfig>,
        force_rebuild: bool,
    ) -> KnowledgeResult<Vec<Arc<Knowledge>>> {
        self.validate_configs(&configs)?;

        let results = futures::future::join_all(
            configs
                .into_iter()
                .map(|config| self.add_config(config, force_rebuild)),
        )
        .await;
        results.into_iter().collect()
    }

    /// I/O 없이 설정 묶음 검증 (로더/트랜스포머 식별자, 임베딩 이름, ID 충돌)
    pub fn validate_configs(&self, configs: &[KnowledgeConfig]) -> KnowledgeResult<()> {
        let mut seen = HashSet::new();
        for config in configs {
            prepare_steps(config, &self.loaders, &self.transformers)?;
            self.embeddings.resolve(&config.emb_model_config_name)?;
            if !seen.insert(config.knowledge_id.as_str()) {
                return Err(KnowledgeError::config(format!(
                    "knowledge_id `{}` appears more than once",
                    config.knowledge_id
                )));
            }
        }

        let state = self.read_state();
        match configs.iter().find(|c| {
            state.entries.contains_key(&c.knowledge_id) || state.pending.contains(&c.knowledge_id)
        }) {
            Some(config) => Err(KnowledgeError::DuplicateKnowledge(config.knowledge_id.clone())),
            None => Ok(()),
        }
    }

    /// 등록된 지식을 설정 그대로 다시 빌드해서 교체
    ///
    /// 재빌드 동안 ID는 예약 상태라 같은 ID의 추가/제거/재빌드는 실패합니다.
    /// 기존 `Arc<Knowledge>`를 가진 쪽은 이전 인덱스를 계속 봅니다.
    pub async fn rebuild_knowledge(&self, knowledge_id: &str) -> KnowledgeResult<Arc<Knowledge>> {
        let (reservation, existing) = self.reserve_existing(knowledge_id)?;
        let config = existing.config().clone();
        let ctx = self.context(&config)?;

        let rebuilt = Arc::new(Knowledge::build(config, &ctx).await?);
        reservation.commit(rebuilt.clone());
        tracing::info!("Rebuilt knowledge `{}`", knowledge_id);
        Ok(rebuilt)
    }

    /// 레지스트리에서 제거 (아티팩트는 남김)
    pub fn remove_knowledge(&self, knowledge_id: &str) -> KnowledgeResult<Arc<Knowledge>> {
        let mut state = self.write_state();
        if state.pending.contains(knowledge_id) {
            return Err(KnowledgeError::Busy(knowledge_id.to_string()));
        }
        state
            .entries
            .remove(knowledge_id)
            .ok_or_else(|| KnowledgeError::NotFound(knowledge_id.to_string()))
    }

    // ------------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------------

    fn lookup(&self, knowledge_id: &str) -> KnowledgeResult<Arc<Knowledge>> {
        self.read_state()
            .entries
            .get(knowledge_id)
            .cloned()
            .ok_or_else(|| KnowledgeError::NotFound(knowledge_id.to_string()))
    }

    /// 등록된 지식. `duplicate`면 독립 복사본
    pub async fn get_knowledge(
        &self,
        knowledge_id: &str,
        duplicate: bool,
    ) -> KnowledgeResult<Arc<Knowledge>> {
        let knowledge = self.lookup(knowledge_id)?;
        if duplicate {
            Ok(Arc::new(knowledge.duplicate().await?))
        } else {
            Ok(knowledge)
        }
    }

    pub fn contains(&self, knowledge_id: &str) -> bool {
        self.read_state().entries.contains_key(knowledge_id)
    }

    /// 등록된 ID (정렬)
    pub fn knowledge_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read_state().entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// 설정에 대한 아티팩트 상태 (storage가 없으면 Missing)
    pub fn artifact_status(&self, config: &KnowledgeConfig) -> KnowledgeResult<ArtifactStatus> {
        let Some(dir) = self.settings.artifact_dir(&config.knowledge_id) else {
            return Ok(ArtifactStatus::Missing);
        };
        let embedder = self.embeddings.resolve(&config.emb_model_config_name)?;
        Ok(artifact::status(&dir, &config.fingerprint()?, embedder.name()))
    }

    // ------------------------------------------------------------------------
    // Equip
    // ------------------------------------------------------------------------

    /// 에이전트에 요구된 지식마다 검색기를 장착
    ///
    /// 모든 ID를 먼저 확인하고, 하나라도 없으면 아무것도 장착하지 않습니다.
    /// 장착한 검색기 수를 반환합니다.
    pub async fn equip(
        &self,
        agent: &mut dyn RetrieverHost,
        rag_config: &RagAgentConfig,
        duplicate: bool,
    ) -> KnowledgeResult<usize> {
        if rag_config.is_empty() {
            return Ok(0);
        }
        rag_config.validate()?;

        let resolved = {
            let state = self.read_state();
            rag_config
                .knowledge
                .iter()
                .map(|req| {
                    state
                        .entries
                        .get(&req.knowledge_id)
                        .cloned()
                        .map(|k| (req, k))
                        .ok_or_else(|| KnowledgeError::NotFound(req.knowledge_id.clone()))
                })
                .collect::<KnowledgeResult<Vec<_>>>()?
        };

        let mut retrievers = Vec::with_capacity(resolved.len());
        for (req, knowledge) in resolved {
            let knowledge = if duplicate {
                Arc::new(knowledge.duplicate().await?)
            } else {
                knowledge
            };
            retrievers.push((
                req.knowledge_id.as_str(),
                KnowledgeRetriever::from_requirement(knowledge, req),
            ));
        }

        let count = retrievers.len();
        for (knowledge_id, retriever) in retrievers {
            agent.attach_retriever(knowledge_id, retriever);
        }
        tracing::debug!("Equipped agent with {} retrievers", count);
        Ok(count)
    }
}

impl std::fmt::Debug for KnowledgeBank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeBank")
            .field("storage_dir", &self.settings.storage_dir)
            .field("knowledge_ids", &self.knowledge_ids())
            .field("embeddings", &self.embeddings)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
