//! Document store
//!
//! Full document text is needed to widen retrieved spans and to include
//! caller-selected files. Offsets are character offsets.

use crate::config::DocumentsConfig;
use crate::errors::{AppError, Result};
use crate::models::Span;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

/// Full text of a stored document
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub title: Option<String>,
    pub text: String,
}

impl Document {
    /// Number of characters in the document
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }

    /// Text of `span`, clipped to the document bounds
    pub fn slice(&self, span: Span) -> (String, Span) {
        let len = self.char_len();
        let start = span.start.min(len);
        let end = span.end.clamp(start, len);
        let text = self.text.chars().skip(start).take(end - start).collect();
        (text, Span::new(start, end))
    }

    /// Widen `span` by `margin` characters on each side, clipped to the document
    pub fn expand(&self, span: Span, margin: usize) -> (String, Span) {
        self.slice(Span::new(
            span.start.saturating_sub(margin),
            span.end.saturating_add(margin),
        ))
    }
}

/// Trait for document lookup
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Load a document, `None` when it does not exist
    async fn load(&self, document_id: &str) -> Result<Option<Document>>;
}

/// Documents stored as `<root>/<document_id>.txt`
pub struct LocalDocumentStore {
    root: PathBuf,
}

impl LocalDocumentStore {
    pub fn new(config: &DocumentsConfig) -> Self {
        Self {
            root: PathBuf::from(&config.root_dir),
        }
    }

    fn path_for(&self, document_id: &str) -> Result<PathBuf> {
        let valid = !document_id.is_empty()
            && document_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !document_id.starts_with('.');
        if !valid {
            return Err(AppError::Validation {
                message: format!("invalid document id: {}", document_id),
                field: Some("document_id".to_string()),
            });
        }
        Ok(self.root.join(format!("{}.txt", document_id)))
    }
}

#[async_trait]
impl DocumentStore for LocalDocumentStore {
    async fn load(&self, document_id: &str) -> Result<Option<Document>> {
        let path = self.path_for(document_id)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => {
                // First line doubles as the title when it looks like one
                let title = text
                    .lines()
                    .next()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && l.len() <= 200)
                    .map(str::to_string);
                Ok(Some(Document {
                    id: document_id.to_string(),
                    title,
                    text,
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory document store for tests
#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: RwLock<HashMap<String, Document>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: &str, title: Option<&str>, text: &str) {
        if let Ok(mut docs) = self.documents.write() {
            docs.insert(
                id.to_string(),
                Document {
                    id: id.to_string(),
                    title: title.map(str::to_string),
                    text: text.to_string(),
                },
            );
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn load(&self, document_id: &str) -> Result<Option<Document>> {
        let docs = self.documents.read().map_err(|_| AppError::Internal {
            message: "document store lock poisoned".to_string(),
        })?;
        Ok(docs.get(document_id).cloned())
    }
}

pub fn create_document_store(config: &DocumentsConfig) -> Arc<dyn DocumentStore> {
    Arc::new(LocalDocumentStore::new(config))
}
