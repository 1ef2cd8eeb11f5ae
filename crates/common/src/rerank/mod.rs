//! Reranking service abstraction
//!
//! The reranker scores query/passage pairs with a cross-encoder. Scores are
//! normalized to `0.0..=1.0` by the service.

use crate::config::RerankingConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const SERVICE: &str = "reranking";

/// Trait for relevance scoring
#[async_trait]
pub trait Reranker: Send + Sync {
    /// Score every passage against the query, one score per passage, same order
    async fn rerank(&self, query: &str, passages: &[String]) -> Result<Vec<f32>>;

    /// Check that the service is reachable
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Client for the reranking service
pub struct HttpReranker {
    client: reqwest::Client,
    base_url: String,
    batch_size: usize,
}

#[derive(Serialize)]
struct PairRequest<'a> {
    qp_pairs: Vec<[&'a str; 2]>,
}

#[derive(Deserialize)]
struct PairResponse {
    pred_scores: serde_json::Value,
}

impl HttpReranker {
    pub fn new(config: &RerankingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            batch_size: config.batch_size.max(1),
        })
    }

    async fn score_batch(&self, query: &str, passages: &[String]) -> Result<Vec<f32>> {
        let request = PairRequest {
            qp_pairs: passages.iter().map(|p| [query, p.as_str()]).collect(),
        };

        let response = self
            .client
            .post(format!("{}/query", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::upstream(SERVICE, format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::upstream(SERVICE, format!("API error {}: {}", status, body)));
        }

        let result: PairResponse = response
            .json()
            .await
            .map_err(|e| AppError::upstream(SERVICE, format!("failed to parse response: {}", e)))?;

        let scores = parse_scores(result.pred_scores)?;
        if scores.len() != passages.len() {
            return Err(AppError::upstream(
                SERVICE,
                format!("expected {} scores, got {}", passages.len(), scores.len()),
            ));
        }
        Ok(scores)
    }
}

/// Scores arrive as a flat array, a single number, or either encoded as a JSON string
fn parse_scores(value: serde_json::Value) -> Result<Vec<f32>> {
    let value = match value {
        serde_json::Value::String(encoded) => serde_json::from_str(&encoded)?,
        other => other,
    };
    match value {
        serde_json::Value::Number(n) => Ok(vec![n.as_f64().unwrap_or_default() as f32]),
        other => Ok(serde_json::from_value(other)?),
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn rerank(&self, query: &str, passages: &[String]) -> Result<Vec<f32>> {
        let mut scores = Vec::with_capacity(passages.len());
        for batch in passages.chunks(self.batch_size) {
            scores.extend(self.score_batch(query, batch).await?);
        }
        Ok(scores)
    }

    async fn health_check(&self) -> Result<()> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map_err(|e| AppError::upstream(SERVICE, e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(AppError::upstream(SERVICE, format!("health returned {}", response.status())))
        }
    }
}

/// Mock reranker for testing.
///
/// Scores a passage by the share of query terms it contains, unless an
/// explicit score was registered for a passage substring.
#[derive(Default)]
pub struct MockReranker {
    fixed: HashMap<String, f32>,
    unavailable: bool,
}

impl MockReranker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unavailable() -> Self {
        Self {
            fixed: HashMap::new(),
            unavailable: true,
        }
    }

    /// Any passage containing `needle` gets `score`
    pub fn with_score(mut self, needle: impl Into<String>, score: f32) -> Self {
        self.fixed.insert(needle.into(), score);
        self
    }

    fn score(&self, query: &str, passage: &str) -> f32 {
        let mut fixed: Vec<(&String, &f32)> = self
            .fixed
            .iter()
            .filter(|(needle, _)| passage.contains(needle.as_str()))
            .collect();
        fixed.sort_by(|a, b| a.0.cmp(b.0));
        if let Some((_, score)) = fixed.first() {
            return **score;
        }

        let terms: Vec<String> = query
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .filter(|t| t.len() > 2)
            .collect();
        if terms.is_empty() {
            return 0.0;
        }
        let passage = passage.to_lowercase();
        let hits = terms.iter().filter(|t| passage.contains(t.as_str())).count();
        hits as f32 / terms.len() as f32
    }
}

#[async_trait]
impl Reranker for MockReranker {
    async fn rerank(&self, query: &str, passages: &[String]) -> Result<Vec<f32>> {
        if self.unavailable {
            return Err(AppError::upstream(SERVICE, "connection refused"));
        }
        Ok(passages.iter().map(|p| self.score(query, p)).collect())
    }

    async fn health_check(&self) -> Result<()> {
        if self.unavailable {
            Err(AppError::upstream(SERVICE, "connection refused"))
        } else {
            Ok(())
        }
    }
}

/// Create a reranker based on configuration
pub fn create_reranker(config: &RerankingConfig) -> Result<Arc<dyn Reranker>> {
    match config.provider.as_str() {
        "http" => Ok(Arc::new(HttpReranker::new(config)?)),
        "mock" => Ok(Arc::new(MockReranker::new())),
        other => {
            tracing::warn!(provider = other, "Unknown reranking provider, using mock");
            Ok(Arc::new(MockReranker::new()))
        }
    }
}
