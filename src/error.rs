//! 에러 타입
//!
//! 지식 관리 파이프라인 전체에서 사용하는 에러 분류입니다.
//! 캐시된 인덱스가 없는 경우는 에러가 아니라 `Option::None`으로 표현합니다.

use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum KnowledgeError {
    /// 잘못되었거나 서로 모순되는 설정
    #[error("config error: {0}")]
    Config(String),

    /// 입력 위치에 접근할 수 없거나 읽을 수 없음
    #[error("load error at {location}: {message}")]
    Load { location: String, message: String },

    /// 임베딩 프로바이더 실패 (네트워크, 쿼터, 잘못된 입력)
    #[error("embedding error after {processed}/{total} nodes: {message}")]
    Embedding {
        processed: usize,
        total: usize,
        message: String,
    },

    /// 인덱스 빌드/쿼리/영속화 실패
    #[error("index error after {processed} nodes: {message}")]
    Index { processed: usize, message: String },

    #[error("knowledge `{0}` already exists")]
    DuplicateKnowledge(String),

    #[error("knowledge `{0}` not found")]
    NotFound(String),

    /// 재빌드 중인 지식에 대한 제거/재빌드 요청
    #[error("knowledge `{0}` is being rebuilt")]
    Busy(String),

    /// 백엔드가 증분 삽입을 지원하지 않음 - 호출자가 재빌드해야 함
    #[error("cannot refresh knowledge `{knowledge_id}`: {message}")]
    Refresh {
        knowledge_id: String,
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type KnowledgeResult<T> = Result<T, KnowledgeError>;

impl KnowledgeError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn load(location: &Path, message: impl std::fmt::Display) -> Self {
        Self::Load {
            location: location.display().to_string(),
            message: message.to_string(),
        }
    }

    pub fn index(processed: usize, message: impl std::fmt::Display) -> Self {
        Self::Index {
            processed,
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_errors_carry_knowledge_id() {
        let err = KnowledgeError::DuplicateKnowledge("agentscope_docs".to_string());
        assert!(err.to_string().contains("agentscope_docs"));

        let err = KnowledgeError::NotFound("missing_kb".to_string());
        assert!(err.to_string().contains("missing_kb"));
    }

    #[test]
    fn test_embedding_error_carries_progress() {
        let err = KnowledgeError::Embedding {
            processed: 32,
            total: 100,
            message: "quota exceeded".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("32/100"));
        assert!(msg.contains("quota exceeded"));
    }
}
