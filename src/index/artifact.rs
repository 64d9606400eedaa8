//! 인덱스 아티팩트 - 매니페스트 + 백엔드 페이로드
//!
//! `<storage_dir>/<knowledge_id>/` 레이아웃:
//! ```text
//! manifest.json      # IndexManifest
//! nodes.json         # memory 백엔드
//! vectors.lance/     # lance 백엔드
//! ```
//!
//! 기록은 같은 부모 디렉토리의 스테이징 디렉토리에 한 다음 rename으로
//! 교체합니다. 중간에 취소되어도 매니페스트가 있는 불완전한 아티팩트는
//! 남지 않습니다. 프로세스가 죽어서 남은 `.staging-<id>.*` / `.trash-<id>.*`
//! 디렉토리는 같은 아티팩트를 다음에 기록할 때 지웁니다.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{load_index, IndexStore};
use crate::config::{IndexBackend, IndexSettings, SimilarityMetric, ARTIFACT_FORMAT_VERSION};
use crate::error::{KnowledgeError, KnowledgeResult};

pub const MANIFEST_FILE: &str = "manifest.json";

const STAGING_PREFIX: &str = ".staging-";
const TRASH_PREFIX: &str = ".trash-";

/// 아티팩트 매니페스트
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexManifest {
    pub knowledge_id: String,
    /// 설정 핑거프린트 (SHA-256 hex)
    pub fingerprint: String,
    pub backend: IndexBackend,
    pub metric: SimilarityMetric,
    pub embedding_model: String,
    pub dimension: usize,
    pub node_count: usize,
    pub created_at: DateTime<Utc>,
    pub format_version: u32,
}

impl IndexManifest {
    pub fn new(
        knowledge_id: &str,
        fingerprint: &str,
        index: &dyn IndexStore,
        embedding_model: &str,
        dimension: usize,
    ) -> Self {
        Self {
            knowledge_id: knowledge_id.to_string(),
            fingerprint: fingerprint.to_string(),
            backend: index.backend(),
            metric: index.metric(),
            embedding_model: embedding_model.to_string(),
            dimension,
            node_count: index.len(),
            created_at: Utc::now(),
            format_version: ARTIFACT_FORMAT_VERSION,
        }
    }

    /// 현재 설정/모델로 재사용 가능한지
    pub fn matches(&self, fingerprint: &str, embedding_model: &str) -> bool {
        self.format_version == ARTIFACT_FORMAT_VERSION
            && self.fingerprint == fingerprint
            && self.embedding_model == embedding_model
    }
}

/// 아티팩트 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactStatus {
    /// 현재 설정과 일치
    Fresh,
    /// 있지만 설정이 바뀜 (다음 빌드에서 교체)
    Stale,
    Missing,
}

impl std::fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ArtifactStatus::Fresh => "fresh",
            ArtifactStatus::Stale => "stale",
            ArtifactStatus::Missing => "missing",
        };
        f.write_str(s)
    }
}

/// 매니페스트 읽기. 없거나 깨졌으면 `None`
pub fn read_manifest(dir: &Path) -> Option<IndexManifest> {
    let path = dir.join(MANIFEST_FILE);
    let json = match std::fs::read_to_string(&path) {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!("Cannot read manifest {:?}: {}", path, e);
            return None;
        }
    };

    match serde_json::from_str(&json) {
        Ok(manifest) => Some(manifest),
        Err(e) => {
            tracing::warn!("Ignoring corrupt manifest {:?}: {}", path, e);
            None
        }
    }
}

pub fn status(dir: &Path, fingerprint: &str, embedding_model: &str) -> ArtifactStatus {
    match read_manifest(dir) {
        Some(manifest) if manifest.matches(fingerprint, embedding_model) => ArtifactStatus::Fresh,
        Some(_) => ArtifactStatus::Stale,
        None => ArtifactStatus::Missing,
    }
}

/// 인덱스를 `dir`에 원자적으로 기록 (기존 아티팩트 교체)
pub async fn persist(dir: &Path, manifest: &IndexManifest, index: &dyn IndexStore) -> KnowledgeResult<()> {
    let (parent, name) = split_location(dir)?;
    std::fs::create_dir_all(parent)?;
    sweep_stale(dir)?;

    let staging = tempfile::Builder::new()
        .prefix(&format!("{}{}.", STAGING_PREFIX, name))
        .tempdir_in(parent)?;

    index.write_payload(staging.path()).await?;
    // 매니페스트는 마지막에 기록
    std::fs::write(
        staging.path().join(MANIFEST_FILE),
        serde_json::to_string_pretty(manifest)?,
    )?;

    swap_into_place(staging.path(), dir)?;
    // staging 경로는 이미 옮겨졌으므로 drop 시 정리할 것이 없음
    drop(staging);

    tracing::info!(
        "Persisted {} nodes for `{}` to {:?}",
        manifest.node_count,
        manifest.knowledge_id,
        dir
    );
    Ok(())
}

fn swap_into_place(staging: &Path, dir: &Path) -> KnowledgeResult<()> {
    let trash = if dir.exists() {
        let trash = trash_path(dir);
        std::fs::rename(dir, &trash)?;
        Some(trash)
    } else {
        None
    };

    if let Err(e) = std::fs::rename(staging, dir) {
        if let Some(ref trash) = trash {
            if let Err(restore) = std::fs::rename(trash, dir) {
                tracing::warn!("Failed to restore previous artifact {:?}: {}", dir, restore);
            }
        }
        return Err(e.into());
    }

    if let Some(trash) = trash {
        if let Err(e) = std::fs::remove_dir_all(&trash) {
            tracing::warn!("Failed to remove old artifact {:?}: {}", trash, e);
        }
    }
    Ok(())
}

fn trash_path(dir: &Path) -> PathBuf {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    dir.with_file_name(format!("{}{}.{}", TRASH_PREFIX, name, uuid::Uuid::new_v4().simple()))
}

fn split_location(dir: &Path) -> KnowledgeResult<(&Path, &str)> {
    match (dir.parent(), dir.file_name().and_then(|n| n.to_str())) {
        (Some(parent), Some(name)) => Ok((parent, name)),
        _ => Err(KnowledgeError::config(format!("invalid artifact location {:?}", dir))),
    }
}

/// 스테이징/휴지통 디렉토리 이름이면 해당 아티팩트 이름
fn leftover_owner(file_name: &str) -> Option<&str> {
    let rest = file_name
        .strip_prefix(STAGING_PREFIX)
        .or_else(|| file_name.strip_prefix(TRASH_PREFIX))?;
    rest.rsplit_once('.').map(|(owner, _)| owner)
}

/// `dir`에 대해 이전 프로세스가 남긴 스테이징/휴지통 디렉토리 삭제
///
/// 다른 아티팩트의 디렉토리는 건드리지 않습니다. 지운 개수를 반환합니다.
pub fn sweep_stale(dir: &Path) -> KnowledgeResult<usize> {
    let (parent, name) = split_location(dir)?;
    let entries = match std::fs::read_dir(parent) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name();
        if file_name.to_str().and_then(leftover_owner) != Some(name) {
            continue;
        }
        match std::fs::remove_dir_all(entry.path()) {
            Ok(()) => {
                tracing::info!("Removed stale artifact directory {:?}", entry.path());
                removed += 1;
            }
            Err(e) => tracing::warn!("Failed to remove stale {:?}: {}", entry.path(), e),
        }
    }
    Ok(removed)
}

/// 일치하는 아티팩트에서 인덱스 복원
///
/// 아티팩트가 없거나, 설정/모델이 바뀌었거나, 페이로드가 손상되었으면 `None`.
pub async fn load(
    dir: &Path,
    fingerprint: &str,
    embedding_model: &str,
    settings: IndexSettings,
    work_root: Option<&Path>,
) -> KnowledgeResult<Option<(IndexManifest, Box<dyn IndexStore>)>> {
    let Some(manifest) = read_manifest(dir) else {
        return Ok(None);
    };

    if !manifest.matches(fingerprint, embedding_model) {
        tracing::info!(
            "Artifact for `{}` is stale (config or embedding model changed)",
            manifest.knowledge_id
        );
        return Ok(None);
    }

    let index = match load_index(settings, manifest.dimension, dir, work_root).await {
        Ok(index) => index,
        Err(e) => {
            tracing::warn!("Ignoring unreadable artifact {:?}: {}", dir, e);
            return Ok(None);
        }
    };

    if index.len() != manifest.node_count {
        tracing::warn!(
            "Artifact {:?} has {} nodes, manifest says {}",
            dir,
            index.len(),
            manifest.node_count
        );
        return Ok(None);
    }

    Ok(Some((manifest, index)))
}

/// 아티팩트 삭제 (없으면 무시)
pub fn remove(dir: &Path) -> KnowledgeResult<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
