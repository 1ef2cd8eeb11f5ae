//! Context Retriever
//!
//! query → embedding → vector search → rerank → selection → span expansion.
//! Upstream failures degrade to an empty result instead of an error.

use futures::future::join_all;
use geoforge_common::{
    config::RetrievalConfig,
    documents::DocumentStore,
    embeddings::Embedder,
    metrics,
    models::{ContextChunk, Origin, Span},
    rerank::Reranker,
    vector::{VectorHit, VectorStore},
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Retriever tuning
#[derive(Debug, Clone)]
pub struct RetrievalSettings {
    pub candidate_pool: usize,
    pub relevance_threshold: f32,
    pub top_n: usize,
    pub expand_margin: usize,
    pub expand_timeout: Duration,
}

impl From<&RetrievalConfig> for RetrievalSettings {
    fn from(config: &RetrievalConfig) -> Self {
        Self {
            candidate_pool: config.candidate_pool,
            relevance_threshold: config.relevance_threshold,
            top_n: config.top_n,
            expand_margin: config.expand_margin,
            expand_timeout: Duration::from_secs(config.expand_timeout_secs),
        }
    }
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self::from(&RetrievalConfig::default())
    }
}

/// Knowledge base retriever
pub struct ContextRetriever {
    embedder: Arc<dyn Embedder>,
    vector_store: Arc<dyn VectorStore>,
    reranker: Arc<dyn Reranker>,
    documents: Arc<dyn DocumentStore>,
    settings: RetrievalSettings,
}

/// A candidate that survived reranking
struct Scored {
    hit: VectorHit,
    score: f32,
}

/// Text sent to the reranker: metadata line, then the chunk
fn rerank_passage(hit: &VectorHit) -> String {
    let meta: Vec<&str> = [hit.title.as_deref(), hit.section.as_deref()]
        .into_iter()
        .flatten()
        .filter(|s| !s.is_empty())
        .collect();
    if meta.is_empty() {
        hit.text.clone()
    } else {
        format!("{}\n{}", meta.join(","), hit.text)
    }
}

/// Keep candidates strictly above the threshold, best first, ties by vector rank
fn select(hits: Vec<VectorHit>, scores: Vec<f32>, threshold: f32, top_n: usize) -> Vec<Scored> {
    let mut kept: Vec<Scored> = hits
        .into_iter()
        .zip(scores)
        .filter(|(_, score)| score.is_finite() && *score > threshold)
        .map(|(hit, score)| Scored { hit, score })
        .collect();
    kept.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.hit.rank.cmp(&b.hit.rank))
    });
    kept.truncate(top_n);
    kept
}

impl ContextRetriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        vector_store: Arc<dyn VectorStore>,
        reranker: Arc<dyn Reranker>,
        documents: Arc<dyn DocumentStore>,
        settings: RetrievalSettings,
    ) -> Self {
        Self {
            embedder,
            vector_store,
            reranker,
            documents,
            settings,
        }
    }

    pub fn settings(&self) -> &RetrievalSettings {
        &self.settings
    }

    /// Retrieve ranked supporting chunks; never fails
    pub async fn retrieve(&self, query: &str, scope: Option<&[String]>) -> Vec<ContextChunk> {
        let start = Instant::now();
        let chunks = self.retrieve_inner(query, scope).await;
        metrics::record_retrieval(start.elapsed().as_secs_f64(), chunks.len());
        tracing::debug!(
            chunks = chunks.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Retrieval finished"
        );
        chunks
    }

    async fn retrieve_inner(&self, query: &str, scope: Option<&[String]>) -> Vec<ContextChunk> {
        let embedding = match self.embedder.embed(query).await {
            Ok(embedding) => embedding,
            Err(e) => return degrade("embedding", &e),
        };

        let hits = match self
            .vector_store
            .search(&embedding, self.settings.candidate_pool, scope)
            .await
        {
            Ok(hits) => hits,
            Err(e) => return degrade("vector_store", &e),
        };
        if hits.is_empty() {
            return Vec::new();
        }

        let passages: Vec<String> = hits.iter().map(rerank_passage).collect();
        let scores = match self.reranker.rerank(query, &passages).await {
            Ok(scores) if scores.len() == hits.len() => scores,
            Ok(scores) => {
                tracing::warn!(
                    expected = hits.len(),
                    received = scores.len(),
                    "Reranker returned mismatched score count"
                );
                metrics::record_degradation("reranking");
                return Vec::new();
            }
            Err(e) => return degrade("reranking", &e),
        };

        let kept = select(
            hits,
            scores,
            self.settings.relevance_threshold,
            self.settings.top_n,
        );

        join_all(kept.into_iter().map(|s| self.expand(s))).await
    }

    /// Widen one kept chunk; falls back to the stored span on any problem
    async fn expand(&self, scored: Scored) -> ContextChunk {
        let Scored { hit, score } = scored;
        let chunk = ContextChunk {
            document_id: hit.document_id,
            text: hit.text,
            span: Span::new(hit.start, hit.end),
            page: hit.page,
            title: hit.title,
            section: hit.section,
            score,
            origin: Origin::KnowledgeBase,
        };
        if self.settings.expand_margin == 0 {
            return chunk;
        }

        let loaded = tokio::time::timeout(
            self.settings.expand_timeout,
            self.documents.load(&chunk.document_id),
        )
        .await;

        match loaded {
            Ok(Ok(Some(document))) => {
                let (text, span) = document.expand(chunk.span, self.settings.expand_margin);
                if text.trim().is_empty() {
                    chunk
                } else {
                    chunk.with_text(text, span)
                }
            }
            Ok(Ok(None)) => chunk,
            Ok(Err(e)) => {
                tracing::debug!(document_id = %chunk.document_id, error = %e, "Span expansion failed");
                chunk
            }
            Err(_) => {
                tracing::debug!(document_id = %chunk.document_id, "Span expansion timed out");
                chunk
            }
        }
    }
}

fn degrade(service: &str, error: &geoforge_common::AppError) -> Vec<ContextChunk> {
    tracing::warn!(service, error = %error, "Retrieval degraded to empty result");
    metrics::record_degradation(service);
    Vec::new()
}
