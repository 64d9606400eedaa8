//! CLI 모듈
//!
//! knowledge-bank CLI 명령어 정의 및 구현

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::bank::{KnowledgeBank, RetrieverSet};
use crate::config::{
    get_data_dir, load_knowledge_configs, BankSettings, KnowledgeConfig, KnowledgeRequirement,
    RagAgentConfig,
};
use crate::embedding::{get_api_key, has_api_key, EmbeddingRegistry, GeminiEmbedding};
use crate::index::artifact;

/// 아티팩트도 플래그도 없을 때의 임베딩 차원
const DEFAULT_DIMENSION: usize = 768;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "knowledge-bank")]
#[command(version, about = "RAG 지식 관리 - 설정 파일 기반 인덱스 빌드와 검색", long_about = None)]
pub struct Cli {
    /// 아티팩트 저장 디렉토리 (기본: <data_dir>/storage)
    #[arg(long, global = true)]
    pub storage: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 설정 파일의 모든 지식을 빌드 (아티팩트가 맞으면 로드)
    Build {
        /// 지식 설정 파일 (JSON 배열)
        #[arg(short, long)]
        config: PathBuf,

        /// 아티팩트를 무시하고 다시 빌드
        #[arg(long)]
        force: bool,

        /// 임베딩 차원 (768, 1536, 3072)
        #[arg(long, default_value_t = DEFAULT_DIMENSION)]
        dimension: usize,
    },

    /// 지식 하나에 검색
    Query {
        /// 검색 쿼리
        query: String,

        /// 지식 설정 파일
        #[arg(short, long)]
        config: PathBuf,

        /// 검색할 지식 ID
        #[arg(short, long)]
        knowledge_id: String,

        /// 결과 개수
        #[arg(short = 'n', long, default_value = "5")]
        top_k: usize,

        /// 최소 점수
        #[arg(long)]
        threshold: Option<f32>,

        /// 임베딩 차원 (기본: 아티팩트 매니페스트, 없으면 768)
        #[arg(long)]
        dimension: Option<usize>,
    },

    /// 설정 파일의 지식과 아티팩트 상태
    List {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// 상태 확인
    Status,
}

// ============================================================================
// CLI Runner
// ============================================================================

/// CLI 명령어 실행
pub async fn run(cli: Cli) -> Result<()> {
    let settings = match cli.storage {
        Some(dir) => BankSettings::with_storage_dir(dir),
        None => BankSettings::from_env(),
    };

    match cli.command {
        Commands::Build {
            config,
            force,
            dimension,
        } => cmd_build(settings, &config, force, dimension).await,
        Commands::Query {
            query,
            config,
            knowledge_id,
            top_k,
            threshold,
            dimension,
        } => {
            let requirement = KnowledgeRequirement {
                knowledge_id,
                similarity_top_k: top_k,
                score_threshold: threshold,
            };
            cmd_query(settings, &config, &query, requirement, dimension).await
        }
        Commands::List { config } => cmd_list(&settings, &config),
        Commands::Status => cmd_status(&settings),
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// 설정에 나오는 모든 임베딩 설정 이름에 Gemini 프로바이더 등록
fn gemini_registry(configs: &[KnowledgeConfig], dimension: usize) -> Result<EmbeddingRegistry> {
    let api_key = get_api_key().context("임베딩에는 Gemini API 키가 필요합니다")?;

    let provider = Arc::new(
        GeminiEmbedding::with_dimension(api_key, dimension)
            .context("GeminiEmbedding 생성 실패")?,
    );

    let names: BTreeSet<&str> = configs
        .iter()
        .map(|c| c.emb_model_config_name.as_str())
        .collect();

    let mut registry = EmbeddingRegistry::new();
    for name in names {
        registry.register(name, provider.clone());
    }
    Ok(registry)
}

fn read_configs(path: &Path) -> Result<Vec<KnowledgeConfig>> {
    load_knowledge_configs(path).with_context(|| format!("설정 파일 읽기 실패: {}", path.display()))
}

/// 빌드 명령어 (build)
async fn cmd_build(settings: BankSettings, config_path: &Path, force: bool, dimension: usize) -> Result<()> {
    let configs = read_configs(config_path)?;
    if configs.is_empty() {
        println!("[!] 설정 파일에 지식이 없습니다.");
        return Ok(());
    }

    let bank = KnowledgeBank::new(settings, gemini_registry(&configs, dimension)?);

    for config in &configs {
        let status = bank.artifact_status(config)?;
        println!("[*] {} (아티팩트: {})", config.knowledge_id, status);
    }

    let built = bank
        .add_configs(configs, force)
        .await
        .context("지식 빌드 실패")?;

    println!();
    for knowledge in built {
        println!(
            "[OK] {} - {} 노드 ({:?})",
            knowledge.knowledge_id(),
            knowledge.node_count().await,
            knowledge.origin()
        );
    }

    Ok(())
}

/// 검색 명령어 (query)
async fn cmd_query(
    settings: BankSettings,
    config_path: &Path,
    query: &str,
    requirement: KnowledgeRequirement,
    dimension: Option<usize>,
) -> Result<()> {
    let configs = read_configs(config_path)?;
    let config = configs
        .into_iter()
        .find(|c| c.knowledge_id == requirement.knowledge_id)
        .ok_or_else(|| {
            anyhow::anyhow!(
                "지식 '{}'이(가) 설정 파일에 없습니다",
                requirement.knowledge_id
            )
        })?;

    // 차원이 다르면 아티팩트가 조용히 다시 빌드되므로 매니페스트를 따름
    let manifest_dimension = settings
        .artifact_dir(&config.knowledge_id)
        .and_then(|dir| artifact::read_manifest(&dir))
        .map(|m| m.dimension);
    let dimension = resolve_dimension(manifest_dimension, dimension)?;

    let registry = gemini_registry(std::slice::from_ref(&config), dimension)?;
    let bank = KnowledgeBank::new(settings, registry);
    bank.add_config(config, false)
        .await
        .context("지식 준비 실패")?;

    let mut agent = RetrieverSet::new();
    bank.equip(
        &mut agent,
        &RagAgentConfig {
            knowledge: vec![requirement],
        },
        false,
    )
    .await?;

    println!("[*] 검색 중: \"{}\"\n", query);

    let results = agent.retrieve_all(query).await.context("검색 실패")?;
    let nodes: Vec<_> = results.into_iter().flat_map(|(_, nodes)| nodes).collect();

    if nodes.is_empty() {
        println!("[!] 검색 결과가 없습니다.");
        return Ok(());
    }

    println!("[OK] 검색 결과 ({} 건):\n", nodes.len());

    for (i, scored) in nodes.iter().enumerate() {
        println!("{}. [점수: {:.4}] {}", i + 1, scored.score, scored.node.node_id);

        if let Some(path) = scored.node.metadata.get("file_path").and_then(|v| v.as_str()) {
            println!("   파일: {}", path);
        }
        println!("   내용: {}", preview(&scored.node.text, 200));
        println!();
    }

    Ok(())
}

/// 목록 명령어 (list)
///
/// 임베딩 모델 확인 없이 설정 핑거프린트만 비교합니다.
fn cmd_list(settings: &BankSettings, config_path: &Path) -> Result<()> {
    let configs = read_configs(config_path)?;

    if configs.is_empty() {
        println!("[!] 설정 파일에 지식이 없습니다.");
        return Ok(());
    }

    println!("[OK] 지식 ({} 건):\n", configs.len());

    for config in &configs {
        println!(
            "  {:<24} [{}] emb={}",
            config.knowledge_id,
            config.knowledge_type.as_str(),
            config.emb_model_config_name
        );

        let Some(dir) = settings.artifact_dir(&config.knowledge_id) else {
            continue;
        };
        match artifact::read_manifest(&dir) {
            Some(manifest) => {
                let status = artifact::status(&dir, &config.fingerprint()?, &manifest.embedding_model);
                println!(
                    "        {} | {} 노드 | {} | {}",
                    status,
                    manifest.node_count,
                    manifest.embedding_model,
                    manifest.created_at.format("%Y-%m-%d %H:%M")
                );
            }
            None => println!("        {}", artifact::ArtifactStatus::Missing),
        }
        println!();
    }

    Ok(())
}

/// 상태 명령어 (status)
fn cmd_status(settings: &BankSettings) -> Result<()> {
    println!("knowledge-bank v{}", env!("CARGO_PKG_VERSION"));
    println!();

    let data_dir = get_data_dir();
    println!("[*] 데이터 디렉토리: {}", data_dir.display());

    // API 키 상태
    if has_api_key() {
        println!("[OK] API 키: 설정됨");
    } else {
        println!("[!] API 키: 미설정");
        println!("    설정: export GEMINI_API_KEY=your-key");
    }

    let Some(storage) = settings.storage_dir.as_deref() else {
        return Ok(());
    };
    println!("[*] 저장소: {}", storage.display());

    let entries = match std::fs::read_dir(storage) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            println!("[!] 저장된 아티팩트가 없습니다.");
            return Ok(());
        }
        Err(e) => return Err(e).context("저장소 읽기 실패"),
    };

    let mut artifacts = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if let Some(manifest) = artifact::read_manifest(&path) {
            artifacts += 1;
            println!(
                "     {:<24} {} 노드, {}",
                manifest.knowledge_id,
                manifest.node_count,
                format_bytes(dir_size(&path))
            );
        }
    }
    println!("[OK] 아티팩트: {} 건", artifacts);

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 쿼리에 쓸 임베딩 차원 (기존 아티팩트와 다르면 에러)
fn resolve_dimension(manifest: Option<usize>, flag: Option<usize>) -> Result<usize> {
    match (manifest, flag) {
        (Some(stored), Some(requested)) if stored != requested => anyhow::bail!(
            "아티팩트 차원은 {}인데 --dimension {}이(가) 지정되었습니다 (`build --force --dimension {}`로 다시 빌드하세요)",
            stored,
            requested,
            requested
        ),
        (Some(stored), _) => Ok(stored),
        (None, Some(requested)) => Ok(requested),
        (None, None) => Ok(DEFAULT_DIMENSION),
    }
}

/// 한 줄 미리보기 (UTF-8 안전)
fn preview(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &flat[..cut]),
        None => flat,
    }
}

fn dir_size(path: &Path) -> u64 {
    walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 3] = ["KB", "MB", "GB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

// ============================================================================
// Tests
// ============================================================================
