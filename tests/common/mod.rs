//! 통합 테스트 공용 헬퍼

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};
use knowledge_bank::{
    BankSettings, EmbeddingProvider, EmbeddingRegistry, KnowledgeBank, KnowledgeConfig,
    KnowledgeSource,
};
use serde_json::json;

pub const EMB: &str = "hash_emb";
pub const DIMENSION: usize = 16;

/// 단어 해시 버킷 임베딩 - 결정적이고 호출 수를 셉니다
#[derive(Default)]
pub struct HashEmbedding {
    calls: AtomicUsize,
}

impl HashEmbedding {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn bucket(word: &str) -> usize {
    // FNV-1a
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in word.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    (hash % DIMENSION as u64) as usize
}

#[async_trait]
impl EmbeddingProvider for HashEmbedding {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut vector = vec![0.0; DIMENSION];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            vector[bucket(&word.to_lowercase())] += 1.0;
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        DIMENSION
    }

    fn name(&self) -> &str {
        "hash-embedding"
    }
}

/// 닫혀 있으면 첫 임베딩 호출에서 `open`까지 멈추는 HashEmbedding
pub struct GatedEmbedding {
    inner: HashEmbedding,
    closed: AtomicBool,
    entered: Notify,
    release: Semaphore,
}

impl GatedEmbedding {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: HashEmbedding::default(),
            closed: AtomicBool::new(false),
            entered: Notify::new(),
            release: Semaphore::new(0),
        })
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn open(&self) {
        self.closed.store(false, Ordering::SeqCst);
        self.release.add_permits(64);
    }

    /// 닫힌 게이트에서 누군가 기다릴 때까지 대기
    pub async fn wait_for_blocked_call(&self) {
        self.entered.notified().await;
    }

    pub fn calls(&self) -> usize {
        self.inner.calls()
    }
}

#[async_trait]
impl EmbeddingProvider for GatedEmbedding {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        if self.closed.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.acquire().await?.forget();
        }
        self.inner.embed(text).await
    }

    fn dimension(&self) -> usize {
        DIMENSION
    }

    fn name(&self) -> &str {
        "hash-embedding"
    }
}

pub fn bank(storage: Option<&Path>, embedder: Arc<HashEmbedding>) -> KnowledgeBank {
    bank_with(storage, embedder)
}

pub fn bank_with(storage: Option<&Path>, embedder: Arc<dyn EmbeddingProvider>) -> KnowledgeBank {
    let mut embeddings = EmbeddingRegistry::new();
    embeddings.register(EMB, embedder);
    let settings = match storage {
        Some(dir) => BankSettings::with_storage_dir(dir),
        None => BankSettings::ephemeral(),
    };
    KnowledgeBank::new(settings, embeddings)
}

/// 세 개의 주제가 다른 문서
pub fn write_corpus(dir: &Path) {
    std::fs::write(
        dir.join("rust.md"),
        "# Rust\n\nOwnership and borrowing keep memory safe without a garbage collector.",
    )
    .unwrap();
    std::fs::write(dir.join("cats.txt"), "Cats purr and nap in the sun.").unwrap();
    std::fs::write(
        dir.join("cooking.md"),
        "# Cooking\n\nSimmer the tomato sauce slowly with garlic and basil.",
    )
    .unwrap();
}

pub fn data_dirs(dir: &Path) -> KnowledgeSource {
    let mut map: BTreeMap<PathBuf, Vec<String>> = BTreeMap::new();
    map.insert(dir.to_path_buf(), vec![".md".to_string(), ".txt".to_string()]);
    KnowledgeSource::DataDirs(map)
}

/// SimpleDirectoryReader + SentenceSplitter 한 단계짜리 설정
pub fn config(
    knowledge_id: &str,
    dir: &Path,
    chunk_size: usize,
    chunk_overlap: usize,
    backend: &str,
) -> KnowledgeConfig {
    serde_json::from_value(json!({
        "knowledge_id": knowledge_id,
        "emb_model_config_name": EMB,
        "chunk_size": chunk_size,
        "chunk_overlap": chunk_overlap,
        "data_processing": [{
            "load_data": {
                "loader": {
                    "module": "knowledge_bank.readers",
                    "class": "SimpleDirectoryReader",
                    "init_args": {
                        "input_dir": dir.display().to_string(),
                        "required_exts": [".md", ".txt"]
                    }
                }
            },
            "store_and_index": {
                "transformations": [{
                    "class": "SentenceSplitter",
                    "init_args": {"chunk_size": chunk_size, "chunk_overlap": chunk_overlap}
                }]
            }
        }],
        "index": {"backend": backend}
    }))
    .unwrap()
}

/// 정확히 `len` 문자의 ASCII 문장 텍스트
pub fn prose(topic: &str, len: usize) -> String {
    let mut text = String::new();
    let mut i = 0;
    while text.len() < len {
        text.push_str(&format!("Sentence {} is about {} in detail. ", i, topic));
        i += 1;
    }
    text.truncate(len);
    text
}
