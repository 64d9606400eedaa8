//! Text Chunking Module
//!
//! Document → Node 변환 전략입니다. 설정의 `transformations`에 나열된 순서대로
//! 적용되며, 각 단계는 이전 단계가 만든 Node를 입력으로 받습니다.
//!
//! - SentenceSplitter: 크기 기반 (문단 > 문장 > 공백 경계 우선, 문자 단위 오버랩)
//! - MarkdownNodeParser: 헤더 경계 + 코드 블록 인식, `header_path` 메타데이터
//! - CodeSplitter: 최상위 블록에 맞춘 줄 윈도우, 줄 번호 메타데이터

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use super::node::{link_siblings, Document, Node};
use crate::config::args::{parse_init_args, require_non_blank};
use crate::config::{ComponentSpec, StoreAndIndexSpec};
use crate::error::{KnowledgeError, KnowledgeResult};

pub const SENTENCE_SPLITTER: &str = "SentenceSplitter";
pub const MARKDOWN_NODE_PARSER: &str = "MarkdownNodeParser";
pub const CODE_SPLITTER: &str = "CodeSplitter";

const NODE_PARSER_MODULES: &[&str] = &["knowledge_bank.node_parser", "llama_index.core.node_parser"];

/// 지식 단위 수준의 청킹 기본값
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDefaults {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

// ============================================================================
// Transformer Trait
// ============================================================================

/// 청킹 전략 트레이트
pub trait Transformer: Send + Sync {
    /// Node 하나를 하위 Node들로 분할 (메타데이터 상속)
    fn split(&self, node: &Node) -> Vec<Node>;

    /// 전략 이름
    fn name(&self) -> &'static str;

    /// Node 목록 변환 후 prev/next 재연결
    fn transform(&self, nodes: Vec<Node>) -> Vec<Node> {
        let mut out: Vec<Node> = nodes.iter().flat_map(|n| self.split(n)).collect();
        link_siblings(&mut out);
        out
    }
}

/// Document들을 트랜스포머 체인에 통과시켜 Node 생성
pub fn run_transformations(
    documents: Vec<Document>,
    transformers: &[Box<dyn Transformer>],
) -> Vec<Node> {
    let mut nodes: Vec<Node> = documents.into_iter().map(Node::from_document).collect();
    for transformer in transformers {
        let before = nodes.len();
        nodes = transformer.transform(nodes);
        tracing::debug!(
            "{} produced {} nodes from {}",
            transformer.name(),
            nodes.len(),
            before
        );
    }
    nodes
}

// ============================================================================
// SentenceSplitter
// ============================================================================

/// 크기 기반 청커 (문자 단위)
///
/// 연속 청크는 정확히 `chunk_overlap` 문자를 공유합니다.
#[derive(Debug, Clone)]
pub struct SentenceSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl SentenceSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> KnowledgeResult<Self> {
        if chunk_size == 0 || chunk_overlap >= chunk_size {
            return Err(KnowledgeError::config(format!(
                "{}: chunk_overlap ({}) must be smaller than a positive chunk_size ({})",
                SENTENCE_SPLITTER, chunk_overlap, chunk_size
            )));
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
        })
    }

    pub fn split_text(&self, text: &str) -> Vec<String> {
        if text.trim().is_empty() {
            return vec![];
        }

        let chars: Vec<char> = text.chars().collect();
        if chars.len() <= self.chunk_size {
            return vec![text.to_string()];
        }

        let mut chunks = Vec::new();
        let mut start = 0;

        loop {
            let hard_end = (start + self.chunk_size).min(chars.len());
            let end = if hard_end == chars.len() {
                hard_end
            } else {
                self.soft_end(&chars, start, hard_end)
            };

            chunks.push(chars[start..end].iter().collect());

            if end >= chars.len() {
                break;
            }

            let next = end.saturating_sub(self.chunk_overlap);
            start = if next > start { next } else { end };
        }

        chunks
    }

    /// 윈도우 후반부에서 문단 > 문장 > 공백 순으로 끝 위치 탐색
    fn soft_end(&self, chars: &[char], start: usize, hard_end: usize) -> usize {
        let floor = start + (hard_end - start) / 2;

        for i in (floor + 1..hard_end).rev() {
            if i >= 2 && chars[i - 1] == '\n' && chars[i - 2] == '\n' {
                return i;
            }
        }
        for i in (floor + 1..hard_end).rev() {
            if matches!(chars[i - 1], '.' | '!' | '?' | '。') && chars[i].is_whitespace() {
                return i;
            }
        }
        for i in (floor + 1..hard_end).rev() {
            if chars[i].is_whitespace() {
                return i;
            }
        }
        hard_end
    }
}

impl Transformer for SentenceSplitter {
    fn split(&self, node: &Node) -> Vec<Node> {
        self.split_text(&node.text)
            .into_iter()
            .map(|text| node.child(text))
            .collect()
    }

    fn name(&self) -> &'static str {
        SENTENCE_SPLITTER
    }
}

// ============================================================================
// MarkdownNodeParser
// ============================================================================

/// Markdown 청킹 설정
#[derive(Debug, Clone)]
pub struct ChunkConfig {
    /// 최소 청크 크기 (문자 수, 작으면 병합)
    pub min_characters: usize,
    /// 최대 청크 크기 (문자 수, 0이면 섹션 단위 그대로)
    pub max_characters: usize,
    /// 같은 섹션 내 청크 간 오버랩 (문자 수)
    pub overlap_characters: usize,
}

/// 헤더 경로가 붙은 Markdown 섹션
#[derive(Debug, Clone)]
struct Section {
    header_path: String,
    header: Option<String>,
    text: String,
}

/// Markdown 인식 청커
///
/// - 헤더 경계 유지 (코드 블록 안의 `#`은 무시)
/// - 긴 섹션은 문단 경계에서 분할
/// - 작은 청크 병합
pub struct MarkdownNodeParser {
    config: ChunkConfig,
}

impl MarkdownNodeParser {
    pub fn new(config: ChunkConfig) -> Self {
        Self { config }
    }

    fn split_sections(&self, text: &str) -> Vec<Section> {
        let mut sections = Vec::new();
        let mut stack: Vec<(usize, String)> = Vec::new();
        let mut current = String::new();
        let mut current_path = String::from("/");
        let mut current_header: Option<String> = None;
        let mut in_code_block = false;

        for line in text.lines() {
            if line.trim_start().starts_with("```") {
                in_code_block = !in_code_block;
            }

            let heading = if in_code_block { None } else { parse_heading(line) };
            if let Some((level, title)) = heading {
                push_section(&mut sections, &current, &current_path, current_header.take());
                current.clear();

                stack.retain(|(l, _)| *l < level);
                current_path = header_path(&stack);
                stack.push((level, title.clone()));
                current_header = Some(title);
            }

            current.push_str(line);
            current.push('\n');
        }

        push_section(&mut sections, &current, &current_path, current_header);
        sections
    }

    /// 긴 섹션을 문단 경계에서 분할
    fn split_long_section(&self, section: &str) -> Vec<String> {
        let max = self.config.max_characters;
        if max == 0 || char_len(section) <= max {
            return vec![section.to_string()];
        }

        let mut chunks = Vec::new();
        let mut current = String::new();

        for para in section.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
            if char_len(para) > max {
                flush(&mut current, &mut chunks);
                chunks.extend(split_by_lines(para, max));
                continue;
            }

            if !current.is_empty() && char_len(&current) + char_len(para) + 2 > max {
                flush(&mut current, &mut chunks);
            }
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(para);
        }
        flush(&mut current, &mut chunks);

        self.merge_small_chunks(chunks)
    }

    /// 작은 청크를 다음 청크와 병합
    fn merge_small_chunks(&self, chunks: Vec<String>) -> Vec<String> {
        if self.config.min_characters == 0 {
            return chunks;
        }

        let max = self.config.max_characters;
        let mut result: Vec<String> = Vec::new();

        for chunk in chunks {
            if let Some(last) = result.last_mut() {
                let fits = max == 0 || char_len(last) + char_len(&chunk) + 2 <= max;
                if char_len(last) < self.config.min_characters && fits {
                    last.push_str("\n\n");
                    last.push_str(&chunk);
                    continue;
                }
            }
            result.push(chunk);
        }

        result
    }

    /// 이전 청크의 끝부분을 다음 청크 앞에 붙임 (단어 경계에서 시작)
    fn apply_overlap(&self, chunks: Vec<String>) -> Vec<String> {
        let overlap = self.config.overlap_characters;
        if overlap == 0 || chunks.len() < 2 {
            return chunks;
        }

        let mut result = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.iter().enumerate() {
            if i == 0 {
                result.push(chunk.clone());
                continue;
            }
            let tail = word_aligned_tail(&chunks[i - 1], overlap);
            if tail.trim().is_empty() {
                result.push(chunk.clone());
            } else {
                result.push(format!("{}\n{}", tail.trim(), chunk));
            }
        }
        result
    }
}

impl Transformer for MarkdownNodeParser {
    fn split(&self, node: &Node) -> Vec<Node> {
        if node.text.trim().is_empty() {
            return vec![];
        }

        let mut nodes = Vec::new();
        for section in self.split_sections(&node.text) {
            let pieces = self.apply_overlap(self.split_long_section(&section.text));
            for piece in pieces.into_iter().filter(|p| !p.trim().is_empty()) {
                let mut child = node.child(piece);
                child
                    .metadata
                    .insert("header_path".to_string(), Value::String(section.header_path.clone()));
                if let Some(ref header) = section.header {
                    child
                        .metadata
                        .insert("header".to_string(), Value::String(header.clone()));
                }
                nodes.push(child);
            }
        }
        nodes
    }

    fn name(&self) -> &'static str {
        MARKDOWN_NODE_PARSER
    }
}

fn heading_regex() -> &'static Regex {
    static HEADING: OnceLock<Regex> = OnceLock::new();
    HEADING.get_or_init(|| Regex::new(r"^(#{1,6})\s+(.+?)\s*#*\s*$").expect("Invalid regex"))
}

fn parse_heading(line: &str) -> Option<(usize, String)> {
    let caps = heading_regex().captures(line)?;
    let level = caps.get(1)?.as_str().len();
    let title = caps.get(2)?.as_str().trim().to_string();
    if title.is_empty() {
        None
    } else {
        Some((level, title))
    }
}

fn header_path(stack: &[(usize, String)]) -> String {
    if stack.is_empty() {
        return "/".to_string();
    }
    let titles: Vec<&str> = stack.iter().map(|(_, t)| t.as_str()).collect();
    format!("/{}/", titles.join("/"))
}

fn push_section(sections: &mut Vec<Section>, text: &str, path: &str, header: Option<String>) {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return;
    }
    sections.push(Section {
        header_path: path.to_string(),
        header,
        text: trimmed.to_string(),
    });
}

// ============================================================================
// CodeSplitter
// ============================================================================

/// 코드 인식 청커
///
/// 빈 줄 뒤에 들여쓰기 없이 시작하는 줄을 최상위 블록 경계로 보고,
/// 블록 단위로 `chunk_lines` / `max_chars` 한도까지 묶습니다.
/// 한도를 넘는 블록은 `chunk_lines_overlap` 줄씩 겹치는 윈도우로 자릅니다.
#[derive(Debug, Clone)]
pub struct CodeSplitter {
    language: String,
    chunk_lines: usize,
    chunk_lines_overlap: usize,
    max_chars: usize,
}

impl CodeSplitter {
    pub fn new(
        language: &str,
        chunk_lines: usize,
        chunk_lines_overlap: usize,
        max_chars: usize,
    ) -> KnowledgeResult<Self> {
        if chunk_lines == 0 || chunk_lines_overlap >= chunk_lines {
            return Err(KnowledgeError::config(format!(
                "{}: chunk_lines_overlap ({}) must be smaller than a positive chunk_lines ({})",
                CODE_SPLITTER, chunk_lines_overlap, chunk_lines
            )));
        }
        if max_chars == 0 {
            return Err(KnowledgeError::config(format!(
                "{}: max_chars must be positive",
                CODE_SPLITTER
            )));
        }
        Ok(Self {
            language: language.to_string(),
            chunk_lines,
            chunk_lines_overlap,
            max_chars,
        })
    }

    /// [start, end) 줄 범위 목록
    fn split_ranges(&self, lines: &[&str]) -> Vec<(usize, usize)> {
        let mut ranges = Vec::new();
        let mut current: Option<(usize, usize)> = None;

        for (bs, be) in top_level_blocks(lines) {
            if be - bs > self.chunk_lines || chars_in(lines, bs, be) > self.max_chars {
                if let Some(range) = current.take() {
                    ranges.push(range);
                }
                ranges.extend(self.windows(lines, bs, be));
                continue;
            }

            current = match current {
                Some((cs, _))
                    if be - cs <= self.chunk_lines && chars_in(lines, cs, be) <= self.max_chars =>
                {
                    Some((cs, be))
                }
                Some(range) => {
                    ranges.push(range);
                    Some((bs, be))
                }
                None => Some((bs, be)),
            };
        }

        if let Some(range) = current {
            ranges.push(range);
        }
        ranges
    }

    fn windows(&self, lines: &[&str], bs: usize, be: usize) -> Vec<(usize, usize)> {
        let mut windows = Vec::new();
        let mut start = bs;

        loop {
            let mut end = (start + self.chunk_lines).min(be);
            while end > start + 1 && chars_in(lines, start, end) > self.max_chars {
                end -= 1;
            }
            windows.push((start, end));

            if end >= be {
                break;
            }
            start = end.saturating_sub(self.chunk_lines_overlap).max(start + 1);
        }

        windows
    }
}

impl Transformer for CodeSplitter {
    fn split(&self, node: &Node) -> Vec<Node> {
        let lines: Vec<&str> = node.text.lines().collect();
        let mut nodes = Vec::new();

        for (start, end) in self.split_ranges(&lines) {
            let text = lines[start..end].join("\n");
            if text.trim().is_empty() {
                continue;
            }

            // 한 줄이 max_chars를 넘는 경우 (minified 코드 등)
            let pieces = if char_len(&text) > self.max_chars {
                hard_cut(&text, self.max_chars)
            } else {
                vec![text]
            };

            for piece in pieces {
                let mut child = node.child(piece);
                child
                    .metadata
                    .insert("language".to_string(), Value::String(self.language.clone()));
                child
                    .metadata
                    .insert("start_line".to_string(), Value::from(start + 1));
                child.metadata.insert("end_line".to_string(), Value::from(end));
                nodes.push(child);
            }
        }

        nodes
    }

    fn name(&self) -> &'static str {
        CODE_SPLITTER
    }
}

/// 최상위 블록 경계
fn top_level_blocks(lines: &[&str]) -> Vec<(usize, usize)> {
    if lines.is_empty() {
        return vec![];
    }

    let mut starts = vec![0];
    for i in 1..lines.len() {
        let line = lines[i];
        let starts_block = !line.trim().is_empty()
            && !line.starts_with(char::is_whitespace)
            && lines[i - 1].trim().is_empty();
        if starts_block {
            starts.push(i);
        }
    }

    starts
        .iter()
        .enumerate()
        .map(|(i, &s)| (s, starts.get(i + 1).copied().unwrap_or(lines.len())))
        .collect()
}

fn chars_in(lines: &[&str], start: usize, end: usize) -> usize {
    lines[start..end].iter().map(|l| char_len(l) + 1).sum::<usize>().saturating_sub(1)
}

// ============================================================================
// Helper Functions
// ============================================================================

#[inline]
fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn flush(current: &mut String, chunks: &mut Vec<String>) {
    if !current.is_empty() {
        chunks.push(std::mem::take(current));
    }
}

/// 줄 단위로 max 문자 이하 조각 생성 (한 줄이 넘치면 문자 단위로 자름)
fn split_by_lines(text: &str, max: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for line in text.lines() {
        if char_len(line) > max {
            flush(&mut current, &mut chunks);
            chunks.extend(hard_cut(line, max));
            continue;
        }
        if !current.is_empty() && char_len(&current) + char_len(line) + 1 > max {
            flush(&mut current, &mut chunks);
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
    }
    flush(&mut current, &mut chunks);

    chunks
}

fn hard_cut(text: &str, max: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(max.max(1)).map(|c| c.iter().collect()).collect()
}

/// 끝에서 `overlap` 문자 이내, 단어 경계에서 시작하는 꼬리
fn word_aligned_tail(text: &str, overlap: usize) -> &str {
    let total = char_len(text);
    if total <= overlap {
        return text;
    }
    let start = text
        .char_indices()
        .nth(total - overlap)
        .map(|(i, _)| i)
        .unwrap_or(0);
    let tail = &text[start..];
    match tail.find(char::is_whitespace) {
        Some(p) => &tail[p..],
        None => tail,
    }
}

// ============================================================================
// Transformer Registry
// ============================================================================

type TransformerFactory = fn(&ComponentSpec, ChunkDefaults) -> KnowledgeResult<Box<dyn Transformer>>;

struct Registration {
    modules: &'static [&'static str],
    factory: TransformerFactory,
}

/// 트랜스포머 클래스 이름 → 생성 함수 (닫힌 집합)
pub struct TransformerRegistry {
    entries: BTreeMap<&'static str, Registration>,
}

impl TransformerRegistry {
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            entries: BTreeMap::new(),
        };
        registry.register(SENTENCE_SPLITTER, NODE_PARSER_MODULES, sentence_splitter_factory);
        registry.register(MARKDOWN_NODE_PARSER, NODE_PARSER_MODULES, markdown_parser_factory);
        registry.register(CODE_SPLITTER, NODE_PARSER_MODULES, code_splitter_factory);
        registry
    }

    pub fn register(
        &mut self,
        class: &'static str,
        modules: &'static [&'static str],
        factory: TransformerFactory,
    ) {
        self.entries.insert(class, Registration { modules, factory });
    }

    pub fn classes(&self) -> Vec<&'static str> {
        self.entries.keys().copied().collect()
    }

    /// 설정 항목으로 트랜스포머 생성 (모르는 클래스/모듈은 설정 에러)
    pub fn create(
        &self,
        spec: &ComponentSpec,
        defaults: ChunkDefaults,
    ) -> KnowledgeResult<Box<dyn Transformer>> {
        let registration = self.entries.get(spec.class.as_str()).ok_or_else(|| {
            KnowledgeError::config(format!(
                "unknown transformer `{}` (known: {})",
                spec.class,
                self.classes().join(", ")
            ))
        })?;

        if !spec.module.is_empty() && !registration.modules.contains(&spec.module.as_str()) {
            return Err(KnowledgeError::config(format!(
                "transformer `{}` is not provided by module `{}`",
                spec.class, spec.module
            )));
        }

        (registration.factory)(spec, defaults)
    }

    /// 처리 단계의 트랜스포머 체인 (없으면 기본 SentenceSplitter)
    pub fn pipeline(
        &self,
        spec: Option<&StoreAndIndexSpec>,
        defaults: ChunkDefaults,
    ) -> KnowledgeResult<Vec<Box<dyn Transformer>>> {
        match spec {
            Some(spec) if !spec.transformations.is_empty() => spec
                .transformations
                .iter()
                .map(|t| self.create(t, defaults))
                .collect(),
            _ => Ok(vec![default_splitter(defaults)?]),
        }
    }
}

impl Default for TransformerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// 지식 수준 chunk_size / chunk_overlap을 쓰는 기본 청커
pub fn default_splitter(defaults: ChunkDefaults) -> KnowledgeResult<Box<dyn Transformer>> {
    Ok(Box::new(SentenceSplitter::new(
        defaults.chunk_size,
        defaults.chunk_overlap,
    )?))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SentenceSplitterArgs {
    chunk_size: Option<usize>,
    chunk_overlap: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MarkdownParserArgs {
    #[serde(default)]
    min_characters: usize,
    max_characters: Option<usize>,
    #[serde(default)]
    overlap_characters: usize,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CodeSplitterArgs {
    language: String,
    #[serde(default = "default_chunk_lines")]
    chunk_lines: usize,
    #[serde(default = "default_chunk_lines_overlap")]
    chunk_lines_overlap: usize,
    #[serde(default = "default_max_chars")]
    max_chars: usize,
}

fn default_chunk_lines() -> usize {
    40
}

fn default_chunk_lines_overlap() -> usize {
    15
}

fn default_max_chars() -> usize {
    1500
}

fn sentence_splitter_factory(
    spec: &ComponentSpec,
    defaults: ChunkDefaults,
) -> KnowledgeResult<Box<dyn Transformer>> {
    let args: SentenceSplitterArgs = parse_init_args(spec)?;
    Ok(Box::new(SentenceSplitter::new(
        args.chunk_size.unwrap_or(defaults.chunk_size),
        args.chunk_overlap.unwrap_or(defaults.chunk_overlap),
    )?))
}

fn markdown_parser_factory(
    spec: &ComponentSpec,
    defaults: ChunkDefaults,
) -> KnowledgeResult<Box<dyn Transformer>> {
    let args: MarkdownParserArgs = parse_init_args(spec)?;
    let config = ChunkConfig {
        min_characters: args.min_characters,
        max_characters: args.max_characters.unwrap_or(defaults.chunk_size),
        overlap_characters: args.overlap_characters,
    };
    if config.max_characters > 0 && config.overlap_characters >= config.max_characters {
        return Err(KnowledgeError::config(format!(
            "{}: overlap_characters must be smaller than max_characters",
            MARKDOWN_NODE_PARSER
        )));
    }
    Ok(Box::new(MarkdownNodeParser::new(config)))
}

fn code_splitter_factory(
    spec: &ComponentSpec,
    _defaults: ChunkDefaults,
) -> KnowledgeResult<Box<dyn Transformer>> {
    let args: CodeSplitterArgs = parse_init_args(spec)?;
    require_non_blank(&spec.class, "language", &args.language)?;
    Ok(Box::new(CodeSplitter::new(
        &args.language,
        args.chunk_lines,
        args.chunk_lines_overlap,
        args.max_chars,
    )?))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::node::Metadata;
    use serde_json::json;

    fn node(text: &str) -> Node {
        Node::new("doc", text, Metadata::new())
    }

    fn defaults() -> ChunkDefaults {
        ChunkDefaults {
            chunk_size: 500,
            chunk_overlap: 50,
        }
    }

    fn prose(sentences: usize) -> String {
        (0..sentences)
            .map(|i| format!("Sentence number {} talks about retrieval.", i))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn test_splitter_short_and_empty() {
        let splitter = SentenceSplitter::new(100, 10).unwrap();
        assert!(splitter.split_text("   ").is_empty());
        assert_eq!(splitter.split_text("short text"), vec!["short text"]);
    }

    #[test]
    fn test_splitter_overlap_is_exact() {
        let splitter = SentenceSplitter::new(500, 50).unwrap();
        let text = prose(60);
        let chunks = splitter.split_text(&text);

        assert!(chunks.len() >= 3);
        for pair in chunks.windows(2) {
            let prev: Vec<char> = pair[0].chars().collect();
            let tail: String = prev[prev.len() - 50..].iter().collect();
            assert!(pair[1].starts_with(&tail));
        }
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 500);
        }
    }

    #[test]
    fn test_splitter_prefers_sentence_boundary() {
        let splitter = SentenceSplitter::new(100, 0).unwrap();
        let text = prose(10);
        let chunks = splitter.split_text(&text);
        assert!(chunks[0].ends_with('.'));
    }

    #[test]
    fn test_splitter_rejects_bad_overlap() {
        assert!(SentenceSplitter::new(100, 100).is_err());
        assert!(SentenceSplitter::new(0, 0).is_err());
    }

    #[test]
    fn test_splitter_links_children() {
        let splitter = SentenceSplitter::new(200, 20).unwrap();
        let nodes = splitter.transform(vec![node(&prose(20))]);
        assert!(nodes.len() > 1);
        assert_eq!(nodes[0].next_id.as_deref(), Some(nodes[1].node_id.as_str()));
        assert_eq!(nodes[1].prev_id.as_deref(), Some(nodes[0].node_id.as_str()));
    }

    #[test]
    fn test_markdown_sections_and_header_path() {
        let parser = MarkdownNodeParser::new(ChunkConfig {
            min_characters: 0,
            max_characters: 1000,
            overlap_characters: 0,
        });
        let text = "# Guide\n\nIntro text.\n\n## Install\n\nRun the installer.\n\n```bash\n# not a header\n```\n\n## Usage\n\nCall it.";
        let nodes = parser.transform(vec![node(text)]);

        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0].metadata["header_path"], json!("/"));
        assert_eq!(nodes[1].metadata["header_path"], json!("/Guide/"));
        assert_eq!(nodes[1].metadata["header"], json!("Install"));
        assert!(nodes[1].text.contains("# not a header"));
        assert_eq!(nodes[2].metadata["header"], json!("Usage"));
    }

    #[test]
    fn test_markdown_long_section_split() {
        let parser = MarkdownNodeParser::new(ChunkConfig {
            min_characters: 0,
            max_characters: 120,
            overlap_characters: 0,
        });
        let body = (0..6)
            .map(|i| format!("Paragraph {} has a few words in it to fill space.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let nodes = parser.transform(vec![node(&format!("# Title\n\n{}", body))]);

        assert!(nodes.len() > 1);
        for n in &nodes {
            assert!(n.text.chars().count() <= 120);
        }
    }

    #[test]
    fn test_merge_small_chunks() {
        let parser = MarkdownNodeParser::new(ChunkConfig {
            min_characters: 100,
            max_characters: 500,
            overlap_characters: 0,
        });
        let merged = parser.merge_small_chunks(vec![
            "Short 1.".to_string(),
            "Short 2.".to_string(),
            "Short 3.".to_string(),
        ]);
        assert!(merged.len() < 3);
    }

    #[test]
    fn test_word_aligned_tail() {
        assert_eq!(word_aligned_tail("hello world", 20), "hello world");
        assert_eq!(word_aligned_tail("alpha beta gamma", 8), " gamma");
        assert_eq!(word_aligned_tail("안녕하세요 세계", 3), " 세계");
    }

    #[test]
    fn test_code_splitter_blocks_and_lines() {
        let splitter = CodeSplitter::new("python", 4, 1, 1000).unwrap();
        let code = "import os\n\ndef a():\n    return 1\n\ndef b():\n    x = 2\n    return x\n";
        let nodes = splitter.transform(vec![node(code)]);

        assert!(nodes.len() >= 2);
        assert_eq!(nodes[0].metadata["language"], json!("python"));
        assert_eq!(nodes[0].metadata["start_line"], json!(1));
        assert!(nodes.iter().any(|n| n.text.contains("def b():")));
        for n in &nodes {
            assert!(n.text.lines().count() <= 4);
        }
    }

    #[test]
    fn test_code_splitter_windows_overlap() {
        let splitter = CodeSplitter::new("rust", 3, 1, 1000).unwrap();
        let code = (1..=7).map(|i| format!("line{}", i)).collect::<Vec<_>>().join("\n");
        let nodes = splitter.transform(vec![node(&code)]);

        assert_eq!(nodes[0].text, "line1\nline2\nline3");
        assert_eq!(nodes[1].text, "line3\nline4\nline5");
        assert_eq!(nodes[1].metadata["start_line"], json!(3));
    }

    #[test]
    fn test_registry_unknown_class_and_module() {
        let registry = TransformerRegistry::with_defaults();

        let unknown = ComponentSpec::new("", "TokenShuffler", Default::default());
        let err = registry.create(&unknown, defaults()).err().unwrap();
        assert!(err.to_string().contains("TokenShuffler"));

        let wrong_module = ComponentSpec::new("some.other.module", SENTENCE_SPLITTER, Default::default());
        assert!(registry.create(&wrong_module, defaults()).is_err());
    }

    #[test]
    fn test_registry_code_splitter_requires_language() {
        let registry = TransformerRegistry::with_defaults();
        let spec = ComponentSpec::new("", CODE_SPLITTER, Default::default());
        let err = registry.create(&spec, defaults()).err().unwrap();
        assert!(err.to_string().contains("language"));
    }

    #[test]
    fn test_registry_rejects_unknown_and_mistyped_args() {
        let registry = TransformerRegistry::with_defaults();

        let typo = ComponentSpec::new(
            "",
            SENTENCE_SPLITTER,
            json!({"chunk_sise": 128}).as_object().cloned().unwrap(),
        );
        let err = registry.create(&typo, defaults()).err().unwrap();
        assert!(err.to_string().contains("chunk_sise"));

        let mistyped = ComponentSpec::new(
            "",
            MARKDOWN_NODE_PARSER,
            json!({"max_characters": "big"}).as_object().cloned().unwrap(),
        );
        let err = registry.create(&mistyped, defaults()).err().unwrap();
        assert!(err.to_string().contains(MARKDOWN_NODE_PARSER));

        let code = ComponentSpec::new(
            "",
            CODE_SPLITTER,
            json!({"language": "rust", "chunk_lines": 10, "chunk_lines_overlap": 2})
                .as_object()
                .cloned()
                .unwrap(),
        );
        assert_eq!(registry.create(&code, defaults()).unwrap().name(), CODE_SPLITTER);
    }

    #[test]
    fn test_pipeline_default_uses_knowledge_sizes() {
        let registry = TransformerRegistry::with_defaults();
        let pipeline = registry.pipeline(None, defaults()).unwrap();
        assert_eq!(pipeline.len(), 1);
        assert_eq!(pipeline[0].name(), SENTENCE_SPLITTER);

        let nodes = run_transformations(vec![Document::new("a.txt", prose(40))], &pipeline);
        assert!(nodes.len() >= 2);
        assert!(nodes.iter().all(|n| n.text.chars().count() <= 500));
    }
}
