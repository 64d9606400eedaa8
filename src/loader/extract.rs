//! 파일 → Document 추출
//!
//! - 텍스트 파일: UTF-8로 직접 읽기
//! - HTML: 본문 텍스트만 (제목은 메타데이터)
//! - PDF: pdf-extract로 페이지별 Document

use std::path::Path;

use scraper::{Html, Selector};
use serde_json::Value;

use crate::error::{KnowledgeError, KnowledgeResult};
use crate::knowledge::node::{Document, Metadata};

/// 추출 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Text,
    Html,
    Pdf,
}

impl FileKind {
    pub fn from_path(path: &Path) -> Self {
        match extension_of(path).as_deref() {
            Some("html") | Some("htm") => FileKind::Html,
            Some("pdf") => FileKind::Pdf,
            _ => FileKind::Text,
        }
    }
}

/// 소문자, 점 없는 확장자
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
}

/// 확장자 기반 MIME 타입
pub fn mime_type(path: &Path) -> &'static str {
    match extension_of(path).as_deref() {
        Some("md") | Some("markdown") => "text/markdown",
        Some("html") | Some("htm") => "text/html",
        Some("pdf") => "application/pdf",
        Some("json") => "application/json",
        Some("csv") => "text/csv",
        Some("py") => "text/x-python",
        Some("rs") => "text/x-rust",
        Some("js") | Some("ts") => "text/javascript",
        _ => "text/plain",
    }
}

/// 파일 하나에서 Document 추출
///
/// `metadata`는 파일 공통 메타데이터로, 모든 Document에 복사됩니다.
pub async fn extract_documents(path: &Path, metadata: Metadata) -> KnowledgeResult<Vec<Document>> {
    let source = path.display().to_string();

    match FileKind::from_path(path) {
        FileKind::Text => {
            let text = read_utf8(path).await?;
            Ok(vec![document(&source, text, metadata)])
        }
        FileKind::Html => {
            let html = read_utf8(path).await?;
            let page = parse_html(&html);
            let mut doc = document(&source, page.content, metadata);
            if let Some(title) = page.title {
                doc.metadata.insert("title".to_string(), Value::String(title));
            }
            Ok(vec![doc])
        }
        FileKind::Pdf => {
            // PDF 추출은 CPU 바운드이므로 spawn_blocking 사용
            let owned = path.to_path_buf();
            let pages = tokio::task::spawn_blocking(move || extract_pdf_pages(&owned))
                .await
                .map_err(|e| KnowledgeError::load(path, format!("PDF task failed: {}", e)))??;

            Ok(pages
                .into_iter()
                .map(|(page, text)| {
                    let mut doc = document(&source, text, metadata.clone());
                    doc.metadata
                        .insert("page_label".to_string(), Value::String(page.to_string()));
                    doc
                })
                .collect())
        }
    }
}

fn document(source: &str, text: String, metadata: Metadata) -> Document {
    let mut doc = Document::new(source, text);
    doc.metadata = metadata;
    doc
}

async fn read_utf8(path: &Path) -> KnowledgeResult<String> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| KnowledgeError::load(path, e))?;
    String::from_utf8(bytes).map_err(|e| KnowledgeError::load(path, format!("not valid UTF-8: {}", e)))
}

// ============================================================================
// HTML
// ============================================================================

/// HTML 페이지에서 뽑은 제목과 본문
#[derive(Debug, Clone, PartialEq)]
pub struct HtmlPage {
    pub title: Option<String>,
    pub content: String,
}

pub fn parse_html(html: &str) -> HtmlPage {
    let document = Html::parse_document(html);
    HtmlPage {
        title: extract_title(&document),
        content: extract_content(&document),
    }
}

fn extract_title(document: &Html) -> Option<String> {
    // <title> 우선, 없으면 <h1>
    for tag in ["title", "h1"] {
        if let Ok(selector) = Selector::parse(tag) {
            if let Some(element) = document.select(&selector).next() {
                let title = collapse_whitespace(&element.text().collect::<String>());
                if !title.is_empty() {
                    return Some(title);
                }
            }
        }
    }
    None
}

/// 본문 추출 (우선순위: article > main > body)
fn extract_content(document: &Html) -> String {
    let selectors = ["article", "main", "[role=main]", "#content", "body"];

    for selector_str in selectors {
        if let Ok(selector) = Selector::parse(selector_str) {
            if let Some(element) = document.select(&selector).next() {
                let text = element_text(&element);
                if !text.is_empty() {
                    return text;
                }
            }
        }
    }

    String::new()
}

/// 요소의 텍스트 노드 (script/style 제외)
fn element_text(element: &scraper::ElementRef) -> String {
    let mut parts = Vec::new();
    for node in element.descendants() {
        if let Some(text) = node.value().as_text() {
            let inside_code = node.ancestors().any(|a| {
                a.value()
                    .as_element()
                    .map(|e| matches!(e.name(), "script" | "style" | "noscript"))
                    .unwrap_or(false)
            });
            if !inside_code {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    parts.push(trimmed.to_string());
                }
            }
        }
    }
    collapse_whitespace(&parts.join(" "))
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ============================================================================
// PDF
// ============================================================================

/// PDF에서 (페이지 번호, 텍스트) 목록 추출. 페이지 번호는 1부터
fn extract_pdf_pages(path: &Path) -> KnowledgeResult<Vec<(usize, String)>> {
    let bytes = std::fs::read(path).map_err(|e| KnowledgeError::load(path, e))?;
    let text = pdf_extract::extract_text_from_mem(&bytes)
        .map_err(|e| KnowledgeError::load(path, format!("PDF extraction failed: {}", e)))?;

    if text.trim().is_empty() {
        tracing::warn!(
            "No text extracted from PDF: {:?}. It might be a scanned document.",
            path
        );
        return Ok(vec![]);
    }

    Ok(split_pdf_pages(&text)
        .into_iter()
        .enumerate()
        .map(|(i, page)| (i + 1, page))
        .collect())
}

/// 폼피드(\x0c) 기준 페이지 분리. 구분자가 없으면 전체가 한 페이지
fn split_pdf_pages(text: &str) -> Vec<String> {
    let pages: Vec<String> = text
        .split('\x0c')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    if pages.is_empty() {
        vec![text.trim().to_string()]
    } else {
        pages
    }
}
