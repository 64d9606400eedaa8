//! 임베딩 모듈 - 텍스트 벡터화 프로바이더와 이름 기반 레지스트리
//!
//! 지식 설정의 `emb_model_config_name`은 [`EmbeddingRegistry`]에서
//! 실제 프로바이더로 해석됩니다.
//!
//! ## 사용법
//! ```rust,ignore
//! let mut registry = EmbeddingRegistry::new();
//! registry.register("gemini_embedding", Arc::new(GeminiEmbedding::from_env()?));
//! let embedder = registry.resolve("gemini_embedding")?;
//! ```

mod gemini;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

pub use gemini::{GeminiConfig, GeminiEmbedding, GEMINI_MODEL, SUPPORTED_DIMENSIONS};

use crate::error::{KnowledgeError, KnowledgeResult};

// ============================================================================
// EmbeddingProvider Trait
// ============================================================================

/// 임베딩 프로바이더 트레이트
///
/// 같은 프로바이더가 반환하는 벡터는 모두 같은 차원이어야 합니다.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// 문서 텍스트 임베딩
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// 검색 쿼리 임베딩 (기본 구현: 문서 임베딩과 동일)
    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        self.embed(query).await
    }

    /// 배치 임베딩 (기본 구현: 순차 호출)
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// 임베딩 차원 수
    fn dimension(&self) -> usize;

    /// 모델 이름 (아티팩트 매니페스트에 기록됨)
    fn name(&self) -> &str;
}

// ============================================================================
// Embedding Registry
// ============================================================================

/// 설정 이름 → 임베딩 프로바이더
#[derive(Clone, Default)]
pub struct EmbeddingRegistry {
    providers: HashMap<String, Arc<dyn EmbeddingProvider>>,
}

impl EmbeddingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 프로바이더 등록 (같은 이름이면 교체)
    pub fn register(&mut self, config_name: &str, provider: Arc<dyn EmbeddingProvider>) {
        tracing::debug!(
            "Registered embedding provider {} as `{}`",
            provider.name(),
            config_name
        );
        self.providers.insert(config_name.to_string(), provider);
    }

    /// 이름으로 프로바이더 조회
    pub fn resolve(&self, config_name: &str) -> KnowledgeResult<Arc<dyn EmbeddingProvider>> {
        self.providers.get(config_name).cloned().ok_or_else(|| {
            KnowledgeError::config(format!(
                "unknown embedding model config `{}`",
                config_name
            ))
        })
    }

    pub fn contains(&self, config_name: &str) -> bool {
        self.providers.contains_key(config_name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for EmbeddingRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingRegistry")
            .field("providers", &self.names())
            .finish()
    }
}

// ============================================================================
// API Key Management
// ============================================================================

const API_KEY_VARS: [&str; 2] = ["GEMINI_API_KEY", "GOOGLE_AI_API_KEY"];

fn read_key(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|key| !key.trim().is_empty())
}

/// Gemini API 키 (GEMINI_API_KEY > GOOGLE_AI_API_KEY)
pub fn get_api_key() -> Result<String> {
    API_KEY_VARS.iter().find_map(|var| read_key(var)).ok_or_else(|| {
        anyhow::anyhow!(
            "no Gemini API key: set one of {}\n\
             keys are issued at https://aistudio.google.com/app/apikey",
            API_KEY_VARS.join(", ")
        )
    })
}

pub fn has_api_key() -> bool {
    API_KEY_VARS.iter().any(|var| read_key(var).is_some())
}

// ============================================================================
// Tests
// ============================================================================
