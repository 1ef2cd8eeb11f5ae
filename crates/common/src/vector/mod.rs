//! Vector store abstraction
//!
//! Provides:
//! - A Milvus/Zilliz REST client (cosine search over the chunk collection)
//! - An in-memory store for tests and local development

use crate::config::VectorStoreConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;

const SERVICE: &str = "vector_store";

/// One nearest-neighbor hit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorHit {
    pub document_id: String,
    pub text: String,
    /// Character offset of `text` in the document
    pub start: usize,
    pub end: usize,
    pub page: Option<u32>,
    pub title: Option<String>,
    pub section: Option<String>,
    /// Cosine similarity reported by the store
    pub similarity: f32,
    /// Zero-based position in the result list
    pub rank: usize,
}

/// Trait for approximate nearest-neighbor search
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Search the `limit` nearest chunks, optionally restricted to a set of documents
    async fn search(
        &self,
        embedding: &[f32],
        limit: usize,
        scope: Option<&[String]>,
    ) -> Result<Vec<VectorHit>>;

    /// Check that the store is reachable
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Milvus REST (v2) client
pub struct MilvusStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    collection: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchRequest<'a> {
    collection_name: &'a str,
    data: [&'a [f32]; 1],
    anns_field: &'static str,
    limit: usize,
    output_fields: [&'static str; 7],
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<String>,
    search_params: SearchParams,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchParams {
    metric_type: &'static str,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Vec<MilvusRow>,
}

#[derive(Deserialize)]
struct MilvusRow {
    #[serde(default)]
    distance: f32,
    document_id: String,
    text: String,
    #[serde(default)]
    start: usize,
    #[serde(default)]
    end: usize,
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    section: Option<String>,
}

impl MilvusStore {
    pub fn new(config: &VectorStoreConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: config.uri.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            collection: config.collection.clone(),
        })
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.client.post(format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Milvus boolean expression restricting hits to the given documents
fn scope_filter(scope: &[String]) -> String {
    let ids: Vec<String> = scope
        .iter()
        .map(|id| format!("\"{}\"", id.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect();
    format!("document_id in [{}]", ids.join(", "))
}

#[async_trait]
impl VectorStore for MilvusStore {
    async fn search(
        &self,
        embedding: &[f32],
        limit: usize,
        scope: Option<&[String]>,
    ) -> Result<Vec<VectorHit>> {
        let request = SearchRequest {
            collection_name: &self.collection,
            data: [embedding],
            anns_field: "embedding",
            limit,
            output_fields: ["document_id", "text", "start", "end", "page", "title", "section"],
            filter: scope.filter(|s| !s.is_empty()).map(scope_filter),
            search_params: SearchParams {
                metric_type: "COSINE",
            },
        };

        let response = self
            .post("/v2/vectordb/entities/search")
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::upstream(SERVICE, format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::upstream(SERVICE, format!("API error {}: {}", status, body)));
        }

        let result: SearchResponse = response
            .json()
            .await
            .map_err(|e| AppError::upstream(SERVICE, format!("failed to parse response: {}", e)))?;

        if result.code != 0 {
            return Err(AppError::upstream(
                SERVICE,
                result.message.unwrap_or_else(|| format!("error code {}", result.code)),
            ));
        }

        Ok(result
            .data
            .into_iter()
            .enumerate()
            .map(|(rank, row)| VectorHit {
                document_id: row.document_id,
                end: if row.end > row.start { row.end } else { row.start + row.text.chars().count() },
                text: row.text,
                start: row.start,
                page: row.page,
                title: row.title,
                section: row.section,
                similarity: row.distance,
                rank,
            })
            .collect())
    }

    async fn health_check(&self) -> Result<()> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Describe<'a> {
            collection_name: &'a str,
        }

        let response = self
            .post("/v2/vectordb/collections/describe")
            .json(&Describe {
                collection_name: &self.collection,
            })
            .send()
            .await
            .map_err(|e| AppError::upstream(SERVICE, e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(AppError::upstream(SERVICE, format!("describe returned {}", response.status())))
        }
    }
}

/// Stored entry of the in-memory store
#[derive(Debug, Clone)]
pub struct MemoryEntry {
    pub document_id: String,
    pub text: String,
    pub start: usize,
    pub title: Option<String>,
    pub section: Option<String>,
    pub embedding: Vec<f32>,
}

/// In-memory vector store with exact cosine search
#[derive(Default)]
pub struct MemoryVectorStore {
    entries: RwLock<Vec<MemoryEntry>>,
    unavailable: bool,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose connection is down
    pub fn unavailable() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            unavailable: true,
        }
    }

    pub fn insert(&self, entry: MemoryEntry) {
        if let Ok(mut entries) = self.entries.write() {
            entries.push(entry);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn search(
        &self,
        embedding: &[f32],
        limit: usize,
        scope: Option<&[String]>,
    ) -> Result<Vec<VectorHit>> {
        if self.unavailable {
            return Err(AppError::upstream(SERVICE, "connection refused"));
        }
        let entries = self.entries.read().map_err(|_| AppError::Internal {
            message: "vector store lock poisoned".to_string(),
        })?;

        let mut scored: Vec<(f32, &MemoryEntry)> = entries
            .iter()
            .filter(|e| scope.map_or(true, |s| s.is_empty() || s.contains(&e.document_id)))
            .map(|e| (cosine(embedding, &e.embedding), e))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.truncate(limit);

        Ok(scored
            .into_iter()
            .enumerate()
            .map(|(rank, (similarity, e))| VectorHit {
                document_id: e.document_id.clone(),
                text: e.text.clone(),
                start: e.start,
                end: e.start + e.text.chars().count(),
                page: None,
                title: e.title.clone(),
                section: e.section.clone(),
                similarity,
                rank,
            })
            .collect())
    }

    async fn health_check(&self) -> Result<()> {
        if self.unavailable {
            Err(AppError::upstream(SERVICE, "connection refused"))
        } else {
            Ok(())
        }
    }
}

/// Create a vector store based on configuration
pub fn create_vector_store(config: &VectorStoreConfig) -> Result<Arc<dyn VectorStore>> {
    match config.provider.as_str() {
        "milvus" => Ok(Arc::new(MilvusStore::new(config)?)),
        "memory" => Ok(Arc::new(MemoryVectorStore::new())),
        other => Err(AppError::Configuration {
            message: format!("unknown vector store provider: {}", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(doc: &str, text: &str, embedding: Vec<f32>) -> MemoryEntry {
        MemoryEntry {
            document_id: doc.to_string(),
            text: text.to_string(),
            start: 10,
            title: None,
            section: None,
            embedding,
        }
    }

    #[test]
    fn test_scope_filter_quotes_ids() {
        let filter = scope_filter(&["a".to_string(), "b\"c".to_string()]);
        assert_eq!(filter, r#"document_id in ["a", "b\"c"]"#);
    }

    #[tokio::test]
    async fn test_memory_search_orders_by_similarity() {
        let store = MemoryVectorStore::new();
        store.insert(entry("far", "far text", vec![0.0, 1.0]));
        store.insert(entry("near", "near text", vec![1.0, 0.1]));

        let hits = store.search(&[1.0, 0.0], 10, None).await.unwrap();
        assert_eq!(hits[0].document_id, "near");
        assert_eq!(hits[0].rank, 0);
        assert_eq!(hits[1].rank, 1);
        assert_eq!(hits[0].end, 10 + "near text".len());
    }

    #[tokio::test]
    async fn test_memory_search_respects_scope() {
        let store = MemoryVectorStore::new();
        store.insert(entry("a", "alpha", vec![1.0, 0.0]));
        store.insert(entry("b", "beta", vec![1.0, 0.0]));

        let scope = vec!["b".to_string()];
        let hits = store.search(&[1.0, 0.0], 10, Some(&scope)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, "b");
    }

    #[tokio::test]
    async fn test_unavailable_store_errors() {
        let store = MemoryVectorStore::unavailable();
        assert!(store.search(&[1.0], 5, None).await.is_err());
    }
}
