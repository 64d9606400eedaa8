//! 디렉토리 로더 (SimpleDirectoryReader)
//!
//! .gitignore 패턴을 존중하고 `required_exts`에 맞는 파일만 읽습니다.
//! 결과는 경로 순으로 정렬되어 같은 입력이면 같은 순서의 Document가 나옵니다.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ignore::WalkBuilder;
use serde::Deserialize;
use serde_json::Value;

use super::extract::{extension_of, extract_documents, mime_type};
use super::DocumentLoader;
use crate::config::args::{parse_init_args, require_non_blank, StringList};
use crate::config::ComponentSpec;
use crate::error::{KnowledgeError, KnowledgeResult};
use crate::knowledge::node::{Document, Metadata};

/// 이보다 큰 파일은 건너뜀 (10MB)
const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DirectoryReaderArgs {
    input_dir: String,
    #[serde(default)]
    required_exts: StringList,
    #[serde(default)]
    recursive: bool,
    #[serde(default)]
    encoding: Option<String>,
    #[serde(default = "default_exclude_hidden")]
    exclude_hidden: bool,
}

fn default_exclude_hidden() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct SimpleDirectoryReader {
    input_dir: PathBuf,
    /// 소문자, 점 없는 확장자. 비어있으면 모든 파일
    required_exts: Vec<String>,
    recursive: bool,
    exclude_hidden: bool,
}

impl SimpleDirectoryReader {
    pub fn new(input_dir: impl Into<PathBuf>, required_exts: &[String], recursive: bool) -> Self {
        Self {
            input_dir: input_dir.into(),
            required_exts: required_exts
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_lowercase())
                .filter(|ext| !ext.is_empty())
                .collect(),
            recursive,
            exclude_hidden: true,
        }
    }

    pub fn exclude_hidden(mut self, exclude: bool) -> Self {
        self.exclude_hidden = exclude;
        self
    }

    pub(super) fn from_spec(spec: &ComponentSpec) -> KnowledgeResult<Self> {
        let args: DirectoryReaderArgs = parse_init_args(spec)?;
        require_non_blank(&spec.class, "input_dir", &args.input_dir)?;

        if let Some(encoding) = args.encoding {
            let normalized = encoding.to_lowercase().replace('-', "");
            if normalized != "utf8" {
                return Err(KnowledgeError::config(format!(
                    "SimpleDirectoryReader: unsupported encoding `{}` (only utf-8)",
                    encoding
                )));
            }
        }

        Ok(Self::new(
            args.input_dir,
            &args.required_exts.into_vec(),
            args.recursive,
        )
        .exclude_hidden(args.exclude_hidden))
    }

    /// 대상 파일 목록 (경로 순 정렬)
    pub fn collect_files(&self) -> KnowledgeResult<Vec<PathBuf>> {
        let root = self.absolute_root()?;
        if !root.is_dir() {
            return Err(KnowledgeError::load(&root, "input directory not found"));
        }

        let walker = WalkBuilder::new(&root)
            .hidden(self.exclude_hidden)
            .git_ignore(true)
            .git_exclude(true)
            .git_global(false)
            .require_git(false)
            .max_depth(if self.recursive { None } else { Some(1) })
            .build();

        let mut files = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!("Failed to read entry: {}", e);
                    continue;
                }
            };

            if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
                continue;
            }
            if !self.matches_extension(entry.path()) {
                continue;
            }
            files.push(entry.into_path());
        }

        files.sort();
        Ok(files)
    }

    fn absolute_root(&self) -> KnowledgeResult<PathBuf> {
        if self.input_dir.is_absolute() {
            Ok(self.input_dir.clone())
        } else {
            Ok(std::env::current_dir()?.join(&self.input_dir))
        }
    }

    fn matches_extension(&self, path: &Path) -> bool {
        if self.required_exts.is_empty() {
            return true;
        }
        extension_of(path)
            .map(|ext| self.required_exts.contains(&ext))
            .unwrap_or(false)
    }
}

#[async_trait]
impl DocumentLoader for SimpleDirectoryReader {
    async fn load(&self, _query: Option<&str>) -> KnowledgeResult<Vec<Document>> {
        // 디렉토리 순회는 블로킹 I/O
        let reader = self.clone();
        let files = tokio::task::spawn_blocking(move || reader.collect_files())
            .await
            .map_err(|e| KnowledgeError::load(&self.input_dir, format!("walk task failed: {}", e)))??;
        let mut documents = Vec::new();

        for path in &files {
            let size = match tokio::fs::metadata(path).await {
                Ok(meta) => meta.len(),
                Err(e) => {
                    tracing::warn!("Skipping {:?}: {}", path, e);
                    continue;
                }
            };
            if size > MAX_FILE_SIZE {
                tracing::warn!("Skipping large file: {:?} ({} bytes)", path, size);
                continue;
            }

            match extract_documents(path, file_metadata(path, size)).await {
                Ok(docs) => documents.extend(docs),
                Err(e) => tracing::warn!("Skipping unreadable file: {}", e),
            }
        }

        tracing::info!(
            "Loaded {} documents from {} files in {:?}",
            documents.len(),
            files.len(),
            self.input_dir
        );
        Ok(documents)
    }

    fn name(&self) -> &'static str {
        super::SIMPLE_DIRECTORY_READER
    }
}

fn file_metadata(path: &Path, size: u64) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert(
        "file_path".to_string(),
        Value::String(path.display().to_string()),
    );
    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        metadata.insert("file_name".to_string(), Value::String(name.to_string()));
    }
    metadata.insert(
        "file_type".to_string(),
        Value::String(mime_type(path).to_string()),
    );
    metadata.insert("file_size".to_string(), Value::from(size));

    if let Ok(modified) = std::fs::metadata(path).and_then(|m| m.modified()) {
        let modified: chrono::DateTime<chrono::Utc> = modified.into();
        metadata.insert(
            "last_modified_date".to_string(),
            Value::String(modified.format("%Y-%m-%d").to_string()),
        );
    }
    metadata
}
