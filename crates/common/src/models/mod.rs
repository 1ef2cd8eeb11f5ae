//! Core data model shared by the orchestrators and the gateway

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Where a context chunk came from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    KnowledgeBase,
    WebSearch,
    Encyclopedia,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::KnowledgeBase => "knowledge_base",
            Origin::WebSearch => "web_search",
            Origin::Encyclopedia => "encyclopedia",
        }
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Character offsets `[start, end)` into the source document
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A piece of supporting text handed to the LLM.
///
/// Chunks are values: truncation and expansion build a new chunk through
/// [`ContextChunk::with_text`] instead of mutating the original.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextChunk {
    /// Document identifier (the URL for web and encyclopedia chunks)
    pub document_id: String,

    /// Chunk text
    pub text: String,

    /// Offsets of `text` inside the document
    pub span: Span,

    /// Page number when the source is paginated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,

    /// Relevance score (rerank score for knowledge base chunks)
    pub score: f32,

    pub origin: Origin,
}

impl ContextChunk {
    /// Build a chunk that covers a whole snippet of text
    pub fn snippet(
        document_id: impl Into<String>,
        title: Option<String>,
        text: impl Into<String>,
        score: f32,
        origin: Origin,
    ) -> Self {
        let text = text.into();
        let len = text.chars().count();
        Self {
            document_id: document_id.into(),
            text,
            span: Span::new(0, len),
            page: None,
            title,
            section: None,
            score,
            origin,
        }
    }

    /// Deduplication identity
    pub fn key(&self) -> (&str, Span) {
        (self.document_id.as_str(), self.span)
    }

    /// Stable identifier across runs: hash of origin, document and span
    pub fn source_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.origin.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(self.document_id.as_bytes());
        hasher.update(b"|");
        hasher.update(self.span.start.to_le_bytes());
        hasher.update(self.span.end.to_le_bytes());
        hex::encode(&hasher.finalize()[..16])
    }

    /// New chunk with replaced text and span, everything else copied
    pub fn with_text(&self, text: String, span: Span) -> Self {
        Self {
            text,
            span,
            ..self.clone()
        }
    }

    /// One-line label used in prompts and logs
    pub fn label(&self) -> String {
        match (&self.title, &self.section) {
            (Some(title), Some(section)) => format!("{}, {}", title, section),
            (Some(title), None) => title.clone(),
            (None, Some(section)) => format!("{}, {}", self.document_id, section),
            (None, None) => self.document_id.clone(),
        }
    }
}

/// Optional generation overrides supplied by the caller
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct GenerationParams {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// A submitted chat query. Immutable once built.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Query {
    pub message: String,
    pub selected_file_ids: Vec<String>,
    pub enable_web_search: bool,
    pub include_thinking: bool,
    pub params: GenerationParams,
}

impl Query {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }
}

/// Token usage counts
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub input: u32,
    pub output: u32,
}

impl TokenUsage {
    /// Rough estimate at four characters per token
    pub fn estimate(prompt: &str, reply: &str) -> Self {
        Self {
            input: estimate_tokens(prompt),
            output: estimate_tokens(reply),
        }
    }
}

pub fn estimate_tokens(text: &str) -> u32 {
    (text.chars().count() / 4) as u32
}

/// Terminal artifact of one generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    pub answer: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,

    /// Chunks cited by the answer, in order of first citation
    pub citations: Vec<ContextChunk>,

    pub usage: TokenUsage,

    pub latency_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_serializes_snake_case() {
        let json = serde_json::to_string(&Origin::KnowledgeBase).unwrap();
        assert_eq!(json, "\"knowledge_base\"");
        assert!(Origin::KnowledgeBase < Origin::WebSearch);
    }

    #[test]
    fn test_source_id_depends_on_span_and_origin() {
        let a = ContextChunk::snippet("doc", None, "hello", 0.5, Origin::KnowledgeBase);
        let b = a.with_text("hello world".into(), Span::new(0, 11));
        let mut c = a.clone();
        c.origin = Origin::WebSearch;

        assert_eq!(a.source_id(), a.clone().source_id());
        assert_ne!(a.source_id(), b.source_id());
        assert_ne!(a.source_id(), c.source_id());
        assert_eq!(a.source_id().len(), 32);
    }

    #[test]
    fn test_with_text_leaves_original_untouched() {
        let a = ContextChunk::snippet("doc", Some("Title".into()), "abc", 0.9, Origin::Encyclopedia);
        let b = a.with_text("ab".into(), Span::new(0, 2));
        assert_eq!(a.text, "abc");
        assert_eq!(b.text, "ab");
        assert_eq!(b.title.as_deref(), Some("Title"));
        assert_eq!(b.origin, Origin::Encyclopedia);
    }

    #[test]
    fn test_snippet_span_counts_chars() {
        let chunk = ContextChunk::snippet("u", None, "Zürich", 0.8, Origin::WebSearch);
        assert_eq!(chunk.span, Span::new(0, 6));
    }

    #[test]
    fn test_token_estimate() {
        let usage = TokenUsage::estimate("abcdefgh", "abcd");
        assert_eq!(usage, TokenUsage { input: 2, output: 1 });
    }
}
