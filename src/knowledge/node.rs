//! Document / Node 타입
//!
//! Document는 로더가 읽은 원본 단위이고, Node는 청킹 후 임베딩과 인덱싱의
//! 단위입니다. Node 메타데이터는 원본 Document 메타데이터를 물려받습니다.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 문자열 키 → JSON 값 메타데이터
pub type Metadata = BTreeMap<String, Value>;

/// 로더가 만든 원본 문서
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub doc_id: String,
    pub source_path: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Document {
    pub fn new(source_path: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            doc_id: uuid::Uuid::new_v4().to_string(),
            source_path: source_path.into(),
            text: text.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// 임베딩/인덱싱 단위 청크
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    /// 원본 Document ID
    pub ref_doc_id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    embedding: Option<Vec<f32>>,
}

impl Node {
    pub fn new(ref_doc_id: &str, text: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            ref_doc_id: ref_doc_id.to_string(),
            text: text.into(),
            metadata,
            prev_id: None,
            next_id: None,
            embedding: None,
        }
    }

    /// 문서 전체를 하나의 Node로 (트랜스포머 체인의 입력)
    pub fn from_document(doc: Document) -> Self {
        let mut metadata = doc.metadata;
        metadata
            .entry("source_path".to_string())
            .or_insert_with(|| Value::String(doc.source_path.clone()));
        Self::new(&doc.doc_id, doc.text, metadata)
    }

    /// 같은 원본에서 나온 하위 청크 생성 (메타데이터 상속)
    pub fn child(&self, text: impl Into<String>) -> Self {
        Self::new(&self.ref_doc_id, text, self.metadata.clone())
    }

    pub fn embedding(&self) -> Option<&[f32]> {
        self.embedding.as_deref()
    }

    /// 임베딩 설정 - 한 번만 가능. 이미 있으면 `false`
    pub fn attach_embedding(&mut self, embedding: Vec<f32>) -> bool {
        if self.embedding.is_some() {
            return false;
        }
        self.embedding = Some(embedding);
        true
    }
}

/// 검색 결과 (Node + 유사도)
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredNode {
    pub node: Node,
    pub score: f32,
}

/// 같은 원본 문서에서 나온 연속 Node들의 prev/next 연결
///
/// 입력 순서를 문서 내 순서로 간주합니다.
pub fn link_siblings(nodes: &mut [Node]) {
    for i in 0..nodes.len() {
        let prev = if i > 0 && nodes[i - 1].ref_doc_id == nodes[i].ref_doc_id {
            Some(nodes[i - 1].node_id.clone())
        } else {
            None
        };
        let next = if i + 1 < nodes.len() && nodes[i + 1].ref_doc_id == nodes[i].ref_doc_id {
            Some(nodes[i + 1].node_id.clone())
        } else {
            None
        };
        nodes[i].prev_id = prev;
        nodes[i].next_id = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_set_once() {
        let mut node = Node::new("doc", "text", Metadata::new());
        assert!(node.attach_embedding(vec![1.0, 2.0]));
        assert!(!node.attach_embedding(vec![3.0, 4.0]));
        assert_eq!(node.embedding(), Some(&[1.0, 2.0][..]));
    }

    #[test]
    fn test_from_document_keeps_metadata() {
        let doc = Document::new("docs/a.md", "hello").with_metadata("file_type", "md");
        let doc_id = doc.doc_id.clone();
        let node = Node::from_document(doc);

        assert_eq!(node.ref_doc_id, doc_id);
        assert_eq!(node.metadata["file_type"], Value::String("md".to_string()));
        assert_eq!(
            node.metadata["source_path"],
            Value::String("docs/a.md".to_string())
        );
    }

    #[test]
    fn test_link_siblings_respects_document_boundaries() {
        let parent_a = Node::new("a", "", Metadata::new());
        let parent_b = Node::new("b", "", Metadata::new());
        let mut nodes = vec![
            parent_a.child("a1"),
            parent_a.child("a2"),
            parent_b.child("b1"),
        ];
        link_siblings(&mut nodes);

        assert_eq!(nodes[0].prev_id, None);
        assert_eq!(nodes[0].next_id.as_deref(), Some(nodes[1].node_id.as_str()));
        assert_eq!(nodes[1].prev_id.as_deref(), Some(nodes[0].node_id.as_str()));
        assert_eq!(nodes[1].next_id, None);
        assert_eq!(nodes[2].prev_id, None);
        assert_eq!(nodes[2].next_id, None);
    }
}
