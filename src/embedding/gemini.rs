//! Google Gemini 임베딩 (gemini-embedding-001)
//!
//! 문서 텍스트는 `batchEmbedContents`로 묶어서 보내고, 검색 쿼리는
//! `embedContent` 단건으로 보냅니다. 요청 간격은 분당 요청 수에 맞춰
//! 균등하게 벌리고, 429/5xx 응답은 지수 백오프로 재시도합니다.
//! ref: https://ai.google.dev/gemini-api/docs/embeddings

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{get_api_key, EmbeddingProvider};

const API_BASE: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-embedding-001";
const MODEL_PATH: &str = "models/gemini-embedding-001";

/// 매니페스트에 기록되는 모델 이름
pub const GEMINI_MODEL: &str = "gemini-embedding-001";

/// MRL 출력 차원
pub const SUPPORTED_DIMENSIONS: [usize; 3] = [768, 1536, 3072];

/// batchEmbedContents 요청당 최대 텍스트 수
const MAX_BATCH: usize = 100;

/// Gemini 프로바이더 설정
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub dimension: usize,
    /// 무료 티어 기준 60
    pub requests_per_minute: u32,
    pub timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            dimension: 768,
            requests_per_minute: 60,
            timeout: Duration::from_secs(30),
            max_retries: 3,
            initial_backoff: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum TaskType {
    RetrievalDocument,
    RetrievalQuery,
}

/// 분당 요청 수를 균등 간격 슬롯으로 나눠 예약
#[derive(Debug)]
struct Pacer {
    interval: Duration,
    next_slot: Option<Instant>,
}

impl Pacer {
    fn per_minute(requests: u32) -> Self {
        Self {
            interval: Duration::from_secs(60) / requests.max(1),
            next_slot: None,
        }
    }

    /// 다음 슬롯을 예약하고 그때까지 기다릴 시간을 반환
    fn reserve(&mut self, now: Instant) -> Duration {
        let slot = match self.next_slot {
            Some(next) if next > now => next,
            _ => now,
        };
        self.next_slot = Some(slot + self.interval);
        slot - now
    }
}

pub struct GeminiEmbedding {
    api_key: String,
    client: reqwest::Client,
    config: GeminiConfig,
    pacer: Mutex<Pacer>,
}

impl GeminiEmbedding {
    /// 기본 설정 (768차원)
    pub fn new(api_key: String) -> Result<Self> {
        Self::with_config(api_key, GeminiConfig::default())
    }

    pub fn with_dimension(api_key: String, dimension: usize) -> Result<Self> {
        Self::with_config(
            api_key,
            GeminiConfig {
                dimension,
                ..GeminiConfig::default()
            },
        )
    }

    pub fn with_config(api_key: String, config: GeminiConfig) -> Result<Self> {
        if !SUPPORTED_DIMENSIONS.contains(&config.dimension) {
            anyhow::bail!(
                "Invalid dimension: {}. Must be one of {:?}",
                config.dimension,
                SUPPORTED_DIMENSIONS
            );
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            api_key,
            client,
            pacer: Mutex::new(Pacer::per_minute(config.requests_per_minute)),
            config,
        })
    }

    /// 환경변수의 API 키로 생성
    pub fn from_env() -> Result<Self> {
        Self::new(get_api_key()?)
    }

    fn request<'a>(&self, text: &'a str, task_type: TaskType) -> EmbedRequest<'a> {
        EmbedRequest {
            model: MODEL_PATH,
            content: Content {
                parts: [Part { text }],
            },
            task_type,
            output_dimensionality: self.config.dimension,
        }
    }

    fn checked(&self, values: Vec<f32>) -> Result<Vec<f32>> {
        if values.len() != self.config.dimension {
            anyhow::bail!(
                "Gemini returned {} dimensions, expected {}",
                values.len(),
                self.config.dimension
            );
        }
        Ok(values)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.config.initial_backoff * 2u32.saturating_pow(attempt)
    }

    async fn pace(&self) {
        let wait = self.pacer.lock().await.reserve(Instant::now());
        if !wait.is_zero() {
            tracing::debug!("Pacing Gemini request by {:?}", wait);
            tokio::time::sleep(wait).await;
        }
    }

    async fn embed_one(&self, text: &str, task_type: TaskType) -> Result<Vec<f32>> {
        // 빈 텍스트는 API가 거부함
        if text.trim().is_empty() {
            return Ok(vec![0.0; self.config.dimension]);
        }
        let response: EmbedResponse = self
            .post("embedContent", &self.request(text, task_type))
            .await?;
        self.checked(response.embedding.values)
    }

    async fn post<B, R>(&self, method: &str, body: &B) -> Result<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}:{}", API_BASE, method);
        let mut attempt = 0;

        loop {
            self.pace().await;

            // API 키는 URL이 아닌 헤더로
            let outcome = self
                .client
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
                .json(body)
                .send()
                .await;

            let error = match outcome {
                Ok(response) if response.status().is_success() => {
                    return response
                        .json::<R>()
                        .await
                        .context("Failed to parse Gemini response");
                }
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    let error = anyhow::anyhow!(
                        "Gemini API error ({}): {}",
                        status,
                        api_error_message(&text).unwrap_or(text)
                    );
                    if !is_retryable(status) {
                        return Err(error);
                    }
                    error
                }
                Err(e) => anyhow::Error::new(e).context("Failed to send Gemini request"),
            };

            if attempt >= self.config.max_retries {
                return Err(error.context(format!("gave up after {} attempts", attempt + 1)));
            }

            let backoff = self.backoff(attempt);
            tracing::warn!(
                "{:#}; retrying in {:?} ({}/{})",
                error,
                backoff,
                attempt + 1,
                self.config.max_retries
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn api_error_message(body: &str) -> Option<String> {
    let parsed: ApiError = serde_json::from_str(body).ok()?;
    Some(if parsed.error.status.is_empty() {
        parsed.error.message
    } else {
        format!("{}: {}", parsed.error.status, parsed.error.message)
    })
}

impl std::fmt::Debug for GeminiEmbedding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiEmbedding")
            .field("model", &GEMINI_MODEL)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl EmbeddingProvider for GeminiEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_one(text, TaskType::RetrievalDocument).await
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        self.embed_one(query, TaskType::RetrievalQuery).await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results = vec![Vec::new(); texts.len()];
        let mut pending = Vec::with_capacity(texts.len());
        for (i, text) in texts.iter().enumerate() {
            if text.trim().is_empty() {
                results[i] = vec![0.0; self.config.dimension];
            } else {
                pending.push(i);
            }
        }

        for chunk in pending.chunks(MAX_BATCH) {
            let request = BatchRequest {
                requests: chunk
                    .iter()
                    .map(|&i| self.request(&texts[i], TaskType::RetrievalDocument))
                    .collect(),
            };
            let response: BatchResponse = self.post("batchEmbedContents", &request).await?;
            if response.embeddings.len() != chunk.len() {
                anyhow::bail!(
                    "Gemini returned {} embeddings for {} texts",
                    response.embeddings.len(),
                    chunk.len()
                );
            }
            for (&i, embedding) in chunk.iter().zip(response.embeddings) {
                results[i] = self.checked(embedding.values)?;
            }
            tracing::debug!("Embedded {} texts via batchEmbedContents", chunk.len());
        }

        Ok(results)
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    fn name(&self) -> &str {
        GEMINI_MODEL
    }
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EmbedRequest<'a> {
    model: &'static str,
    content: Content<'a>,
    task_type: TaskType,
    output_dimensionality: usize,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    parts: [Part<'a>; 1],
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct BatchRequest<'a> {
    requests: Vec<EmbedRequest<'a>>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Values,
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    embeddings: Vec<Values>,
}

#[derive(Debug, Deserialize)]
struct Values {
    values: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
    #[serde(default)]
    status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> GeminiEmbedding {
        GeminiEmbedding::new("test-key".to_string()).unwrap()
    }

    #[test]
    fn test_dimension_validation() {
        let err = GeminiEmbedding::with_dimension("k".to_string(), 999)
            .err()
            .map(|e| e.to_string())
            .unwrap_or_default();
        assert!(err.contains("Invalid dimension"));

        for dim in SUPPORTED_DIMENSIONS {
            assert_eq!(
                GeminiEmbedding::with_dimension("k".to_string(), dim)
                    .unwrap()
                    .dimension(),
                dim
            );
        }
    }

    #[test]
    fn test_request_shape() {
        let value = serde_json::to_value(provider().request("hello", TaskType::RetrievalQuery)).unwrap();
        assert_eq!(value["model"], "models/gemini-embedding-001");
        assert_eq!(value["taskType"], "RETRIEVAL_QUERY");
        assert_eq!(value["outputDimensionality"], 768);
        assert_eq!(value["content"]["parts"][0]["text"], "hello");
    }

    #[test]
    fn test_pacer_spaces_requests() {
        let mut pacer = Pacer::per_minute(60);
        let now = Instant::now();
        assert_eq!(pacer.reserve(now), Duration::ZERO);
        assert_eq!(pacer.reserve(now), Duration::from_secs(1));
        assert_eq!(pacer.reserve(now), Duration::from_secs(2));
        // 충분히 지난 뒤에는 바로
        assert_eq!(pacer.reserve(now + Duration::from_secs(10)), Duration::ZERO);
    }

    #[test]
    fn test_backoff_and_retryable_status() {
        let gemini = provider();
        assert_eq!(gemini.backoff(0), Duration::from_secs(2));
        assert_eq!(gemini.backoff(2), Duration::from_secs(8));

        assert!(is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_retryable(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn test_api_error_message() {
        let body = r#"{"error": {"code": 400, "message": "API key not valid", "status": "INVALID_ARGUMENT"}}"#;
        assert_eq!(
            api_error_message(body).as_deref(),
            Some("INVALID_ARGUMENT: API key not valid")
        );
        assert!(api_error_message("<html>").is_none());
    }

    #[test]
    fn test_debug_hides_api_key() {
        let debug = format!("{:?}", provider());
        assert!(!debug.contains("test-key"));
        assert!(debug.contains(GEMINI_MODEL));
    }

    #[tokio::test]
    async fn test_blank_texts_skip_the_api() {
        let gemini = provider();
        let vectors = gemini
            .embed_batch(&["".to_string(), "   ".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors, vec![vec![0.0; 768], vec![0.0; 768]]);
        assert_eq!(gemini.embed_query("").await.unwrap().len(), 768);
    }
}
