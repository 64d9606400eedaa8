//! SQLite 로더 (DatabaseReader)
//!
//! 쿼리 결과의 각 행을 `column: value, ...` 형태의 Document 하나로 만듭니다.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde::Deserialize;
use serde_json::Value;

use super::DocumentLoader;
use crate::config::args::{parse_init_args, require_non_blank};
use crate::config::ComponentSpec;
use crate::error::{KnowledgeError, KnowledgeResult};
use crate::knowledge::node::Document;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DatabaseReaderArgs {
    database: String,
    #[serde(default)]
    query: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DatabaseReader {
    database: PathBuf,
    query: Option<String>,
}

impl DatabaseReader {
    pub fn new(database: impl Into<PathBuf>, query: Option<String>) -> Self {
        Self {
            database: database.into(),
            query,
        }
    }

    pub(super) fn from_spec(spec: &ComponentSpec) -> KnowledgeResult<Self> {
        let args: DatabaseReaderArgs = parse_init_args(spec)?;
        require_non_blank(&spec.class, "database", &args.database)?;
        Ok(Self::new(args.database, args.query))
    }
}

#[async_trait]
impl DocumentLoader for DatabaseReader {
    /// `query` 인자가 있으면 init_args의 쿼리보다 우선
    async fn load(&self, query: Option<&str>) -> KnowledgeResult<Vec<Document>> {
        let query = query
            .map(str::to_string)
            .or_else(|| self.query.clone())
            .ok_or_else(|| {
                KnowledgeError::config(format!(
                    "DatabaseReader for {:?} needs a query",
                    self.database
                ))
            })?;

        let database = self.database.clone();
        let documents = tokio::task::spawn_blocking(move || read_rows(&database, &query))
            .await
            .map_err(|e| KnowledgeError::load(&self.database, format!("query task failed: {}", e)))??;

        tracing::info!(
            "Loaded {} rows from {:?}",
            documents.len(),
            self.database
        );
        Ok(documents)
    }

    fn name(&self) -> &'static str {
        super::DATABASE_READER
    }
}

fn read_rows(database: &Path, query: &str) -> KnowledgeResult<Vec<Document>> {
    if !database.is_file() {
        return Err(KnowledgeError::load(database, "database file not found"));
    }

    let conn = Connection::open_with_flags(database, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(|e| KnowledgeError::load(database, e))?;
    let mut stmt = conn
        .prepare(query)
        .map_err(|e| KnowledgeError::load(database, e))?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

    let source = database.display().to_string();
    let mut rows = stmt.query([]).map_err(|e| KnowledgeError::load(database, e))?;
    let mut documents = Vec::new();

    while let Some(row) = rows.next().map_err(|e| KnowledgeError::load(database, e))? {
        let mut fields = Vec::with_capacity(columns.len());
        for (i, column) in columns.iter().enumerate() {
            let value = row.get_ref(i).map_err(|e| KnowledgeError::load(database, e))?;
            fields.push(format!("{}: {}", column, render(value)));
        }

        let row_index = documents.len();
        documents.push(
            Document::new(&source, fields.join(", "))
                .with_metadata("database", Value::String(source.clone()))
                .with_metadata("row", row_index),
        );
    }

    Ok(documents)
}

fn render(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "null".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
        ValueRef::Blob(b) => format!("<{} bytes>", b.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_db(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("faq.sqlite");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE faq (id INTEGER, question TEXT, answer TEXT);
             INSERT INTO faq VALUES (1, 'What is RAG?', 'Retrieval augmented generation');
             INSERT INTO faq VALUES (2, 'Who uses it?', NULL);",
        )
        .unwrap();
        path
    }

    #[tokio::test]
    async fn test_rows_become_documents() {
        let dir = TempDir::new().unwrap();
        let reader = DatabaseReader::new(sample_db(&dir), None);
        let docs = reader
            .load(Some("SELECT question, answer FROM faq ORDER BY id"))
            .await
            .unwrap();

        assert_eq!(docs.len(), 2);
        assert_eq!(
            docs[0].text,
            "question: What is RAG?, answer: Retrieval augmented generation"
        );
        assert_eq!(docs[1].text, "question: Who uses it?, answer: null");
        assert_eq!(docs[1].metadata["row"], Value::from(1));
    }

    #[tokio::test]
    async fn test_query_from_init_args() {
        let dir = TempDir::new().unwrap();
        let reader = DatabaseReader::new(sample_db(&dir), Some("SELECT id FROM faq".to_string()));
        assert_eq!(reader.load(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_query_and_database() {
        let dir = TempDir::new().unwrap();
        let reader = DatabaseReader::new(sample_db(&dir), None);
        assert!(matches!(
            reader.load(None).await.unwrap_err(),
            KnowledgeError::Config(_)
        ));

        let missing = DatabaseReader::new(dir.path().join("nope.sqlite"), None);
        assert!(matches!(
            missing.load(Some("SELECT 1")).await.unwrap_err(),
            KnowledgeError::Load { .. }
        ));
    }
}
