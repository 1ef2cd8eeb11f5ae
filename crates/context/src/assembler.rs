//! Context Assembler - merges chunk sources into one prompt-ready context
//!
//! Provides:
//! - Deduplication by (document id, span), keeping the higher score
//! - Deterministic ordering with a total tiebreak
//! - Character budget management with tail truncation
//! - Numbered `[document N begin]` rendering for citation markers

use futures::future::join_all;
use geoforge_common::{
    config::AssemblyConfig,
    documents::DocumentStore,
    models::{ContextChunk, Origin, Span},
};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Assembled, numbered context for one generation
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AssembledContext {
    /// Chunks in citation order; chunk `i` is cited as `[citation:i+1]`
    pub chunks: Vec<ContextChunk>,

    /// Characters of chunk text included
    pub total_chars: usize,

    /// Whether anything was cut or dropped for the budget
    pub truncated: bool,
}

impl AssembledContext {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Chunk for a 1-based citation index
    pub fn resolve(&self, index: usize) -> Option<&ContextChunk> {
        index.checked_sub(1).and_then(|i| self.chunks.get(i))
    }

    /// Render the numbered document blocks embedded in the prompt
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, chunk) in self.chunks.iter().enumerate() {
            let n = i + 1;
            out.push_str(&format!(
                "[document {} begin]\nSource: {} ({})\n{}\n[document {} end]\n",
                n,
                chunk.label(),
                chunk.origin,
                chunk.text.trim(),
                n
            ));
        }
        out
    }
}

/// Context assembler
#[derive(Debug, Clone)]
pub struct ContextAssembler {
    config: AssemblyConfig,
}

/// Total order used for the assembled context
fn chunk_order(a: &ContextChunk, b: &ContextChunk) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.origin.cmp(&b.origin))
        .then_with(|| a.document_id.cmp(&b.document_id))
        .then_with(|| a.span.start.cmp(&b.span.start))
        .then_with(|| a.span.end.cmp(&b.span.end))
}

impl ContextAssembler {
    pub fn new(config: AssemblyConfig) -> Self {
        Self { config }
    }

    /// Character budget left for chunks once the query is in the prompt
    pub fn budget_for(&self, query: &str) -> usize {
        self.config
            .budget()
            .saturating_sub(query.chars().count())
    }

    /// Merge, dedupe, order and truncate the three chunk sources
    pub fn assemble(
        &self,
        retrieved: &[ContextChunk],
        web: &[ContextChunk],
        selected: &[ContextChunk],
        query: &str,
    ) -> AssembledContext {
        // Dedupe, first seen wins on equal scores
        let mut merged: Vec<ContextChunk> = Vec::new();
        let mut seen: HashMap<(String, Span), usize> = HashMap::new();
        for chunk in retrieved.iter().chain(web).chain(selected) {
            if chunk.text.trim().is_empty() {
                continue;
            }
            let key = (chunk.document_id.clone(), chunk.span);
            match seen.get(&key) {
                Some(&idx) => {
                    if chunk.score > merged[idx].score {
                        merged[idx] = chunk.clone();
                    }
                }
                None => {
                    seen.insert(key, merged.len());
                    merged.push(chunk.clone());
                }
            }
        }

        merged.sort_by(chunk_order);

        let budget = self.budget_for(query);
        let mut chunks = Vec::with_capacity(merged.len());
        let mut used = 0;
        let mut truncated = false;

        for chunk in merged {
            let len = chunk.text.chars().count();
            if used + len <= budget {
                used += len;
                chunks.push(chunk);
                continue;
            }

            // First chunk that does not fit: keep a prefix or stop
            let remaining = budget - used;
            if remaining >= self.config.min_chunk_chars {
                let text: String = chunk.text.chars().take(remaining).collect();
                let span = Span::new(
                    chunk.span.start,
                    chunk.span.start + remaining.min(chunk.span.len()),
                );
                used += remaining;
                chunks.push(chunk.with_text(text, span));
            }
            truncated = true;
            break;
        }

        tracing::debug!(
            chunks = chunks.len(),
            total_chars = used,
            budget,
            truncated,
            "Context assembled"
        );

        AssembledContext {
            chunks,
            total_chars: used,
            truncated,
        }
    }
}

/// Load caller-selected documents as full-relevance chunks.
/// Unknown or unreadable documents are skipped.
pub async fn load_selected(
    documents: &dyn DocumentStore,
    ids: &[String],
    max_chars: usize,
) -> Vec<ContextChunk> {
    let loads = join_all(ids.iter().map(|id| documents.load(id))).await;

    let mut chunks = Vec::new();
    for (id, loaded) in ids.iter().zip(loads) {
        match loaded {
            Ok(Some(document)) => {
                let (text, span) = document.slice(Span::new(0, max_chars));
                if text.trim().is_empty() {
                    continue;
                }
                chunks.push(ContextChunk {
                    document_id: document.id,
                    text,
                    span,
                    page: None,
                    title: document.title,
                    section: None,
                    score: 1.0,
                    origin: Origin::KnowledgeBase,
                });
            }
            Ok(None) => tracing::warn!(document_id = %id, "Selected document not found"),
            Err(e) => tracing::warn!(document_id = %id, error = %e, "Selected document unreadable"),
        }
    }
    chunks
}
