//! External snippet providers
//!
//! Provides:
//! - Web search through the DuckDuckGo instant-answer API
//! - Encyclopedia lookups through Wikipedia search plus page summaries
//! - A static provider for tests

use crate::config::WebSearchConfig;
use crate::errors::{AppError, Result};
use crate::models::{ContextChunk, Origin};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Trait for keyword → snippet providers
#[async_trait]
pub trait SnippetProvider: Send + Sync {
    /// Origin tag carried by every chunk this provider returns
    fn origin(&self) -> Origin;

    /// Look up snippets for the query
    async fn search(&self, query: &str) -> Result<Vec<ContextChunk>>;
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

fn build_client(config: &WebSearchConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .user_agent(config.user_agent.clone())
        .build()
        .map_err(|e| AppError::Internal {
            message: format!("Failed to create HTTP client: {}", e),
        })
}

/// DuckDuckGo instant-answer client
pub struct DuckDuckGoProvider {
    client: reqwest::Client,
    base_url: String,
    max_chars: usize,
    relevance: f32,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct InstantAnswer {
    heading: String,
    abstract_text: String,
    #[serde(rename = "AbstractURL")]
    abstract_url: String,
    related_topics: Vec<RelatedTopic>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct RelatedTopic {
    text: String,
    #[serde(rename = "FirstURL")]
    first_url: String,
}

impl DuckDuckGoProvider {
    /// Related topics kept next to the abstract
    const MAX_RELATED: usize = 3;

    pub fn new(config: &WebSearchConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config)?,
            base_url: config.web_url.trim_end_matches('/').to_string(),
            max_chars: config.web_max_chars,
            relevance: config.web_relevance,
        })
    }

    fn to_chunks(&self, answer: InstantAnswer) -> Vec<ContextChunk> {
        let mut chunks = Vec::new();
        if !answer.abstract_text.trim().is_empty() {
            let title = (!answer.heading.is_empty()).then(|| answer.heading.clone());
            chunks.push(ContextChunk::snippet(
                answer.abstract_url.clone(),
                title,
                truncate_chars(answer.abstract_text.trim(), self.max_chars),
                self.relevance,
                Origin::WebSearch,
            ));
        }
        for topic in answer
            .related_topics
            .into_iter()
            .filter(|t| !t.text.trim().is_empty() && !t.first_url.is_empty())
            .take(Self::MAX_RELATED)
        {
            chunks.push(ContextChunk::snippet(
                topic.first_url,
                None,
                truncate_chars(topic.text.trim(), self.max_chars),
                self.relevance,
                Origin::WebSearch,
            ));
        }
        chunks
    }
}

#[async_trait]
impl SnippetProvider for DuckDuckGoProvider {
    fn origin(&self) -> Origin {
        Origin::WebSearch
    }

    async fn search(&self, query: &str) -> Result<Vec<ContextChunk>> {
        let response = self
            .client
            .get(format!("{}/", self.base_url))
            .query(&[
                ("q", query),
                ("format", "json"),
                ("no_html", "1"),
                ("skip_disambig", "1"),
            ])
            .send()
            .await
            .map_err(|e| AppError::upstream("web_search", e.to_string()))?;

        if !response.status().is_success() {
            return Err(AppError::upstream(
                "web_search",
                format!("API error {}", response.status()),
            ));
        }

        let answer: InstantAnswer = response
            .json()
            .await
            .map_err(|e| AppError::upstream("web_search", format!("failed to parse response: {}", e)))?;

        Ok(self.to_chunks(answer))
    }
}

/// Wikipedia search + summary client
pub struct WikipediaProvider {
    client: reqwest::Client,
    base_url: String,
    max_chars: usize,
    max_results: usize,
    relevance: f32,
}

#[derive(Deserialize)]
struct SearchEnvelope {
    query: SearchBody,
}

#[derive(Deserialize)]
struct SearchBody {
    search: Vec<SearchHit>,
}

#[derive(Deserialize)]
struct SearchHit {
    title: String,
}

#[derive(Deserialize)]
struct PageSummary {
    title: String,
    #[serde(default)]
    extract: String,
    #[serde(default)]
    content_urls: Option<ContentUrls>,
}

#[derive(Deserialize)]
struct ContentUrls {
    desktop: DesktopUrls,
}

#[derive(Deserialize)]
struct DesktopUrls {
    page: String,
}

impl WikipediaProvider {
    pub fn new(config: &WebSearchConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config)?,
            base_url: config.encyclopedia_url.trim_end_matches('/').to_string(),
            max_chars: config.encyclopedia_max_chars,
            max_results: config.encyclopedia_results,
            relevance: config.encyclopedia_relevance,
        })
    }

    async fn titles(&self, query: &str) -> Result<Vec<String>> {
        let limit = self.max_results.to_string();
        let response = self
            .client
            .get(format!("{}/w/api.php", self.base_url))
            .query(&[
                ("action", "query"),
                ("list", "search"),
                ("format", "json"),
                ("srsearch", query),
                ("srlimit", limit.as_str()),
            ])
            .send()
            .await
            .map_err(|e| AppError::upstream("encyclopedia", e.to_string()))?;

        if !response.status().is_success() {
            return Err(AppError::upstream(
                "encyclopedia",
                format!("search error {}", response.status()),
            ));
        }

        let envelope: SearchEnvelope = response
            .json()
            .await
            .map_err(|e| AppError::upstream("encyclopedia", format!("failed to parse search: {}", e)))?;
        Ok(envelope.query.search.into_iter().map(|h| h.title).collect())
    }

    async fn summary(&self, title: &str) -> Result<Option<ContextChunk>> {
        let mut url = reqwest::Url::parse(&self.base_url).map_err(|e| AppError::Configuration {
            message: format!("invalid encyclopedia url: {}", e),
        })?;
        let slug = title.replace(' ', "_");
        url.path_segments_mut()
            .map_err(|_| AppError::Configuration {
                message: "encyclopedia url cannot be a base".to_string(),
            })?
            .extend(["api", "rest_v1", "page", "summary", slug.as_str()]);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AppError::upstream("encyclopedia", e.to_string()))?;
        if !response.status().is_success() {
            return Ok(None);
        }

        let page: PageSummary = response
            .json()
            .await
            .map_err(|e| AppError::upstream("encyclopedia", format!("failed to parse summary: {}", e)))?;
        if page.extract.trim().is_empty() {
            return Ok(None);
        }

        let document_id = page
            .content_urls
            .map(|u| u.desktop.page)
            .unwrap_or_else(|| format!("{}/wiki/{}", self.base_url, page.title.replace(' ', "_")));
        Ok(Some(ContextChunk::snippet(
            document_id,
            Some(page.title),
            truncate_chars(page.extract.trim(), self.max_chars),
            self.relevance,
            Origin::Encyclopedia,
        )))
    }
}

#[async_trait]
impl SnippetProvider for WikipediaProvider {
    fn origin(&self) -> Origin {
        Origin::Encyclopedia
    }

    async fn search(&self, query: &str) -> Result<Vec<ContextChunk>> {
        let titles = self.titles(query).await?;
        let summaries = futures::future::join_all(titles.iter().map(|t| self.summary(t))).await;

        let mut chunks = Vec::new();
        for summary in summaries {
            match summary {
                Ok(Some(chunk)) => chunks.push(chunk),
                Ok(None) => {}
                Err(e) => tracing::debug!(error = %e, "Encyclopedia summary skipped"),
            }
        }
        Ok(chunks)
    }
}

/// Provider returning canned snippets, or failing, for tests
pub struct StaticSnippetProvider {
    origin: Origin,
    chunks: Vec<ContextChunk>,
    delay: Option<Duration>,
    fail: bool,
}

impl StaticSnippetProvider {
    pub fn new(origin: Origin, chunks: Vec<ContextChunk>) -> Self {
        Self {
            origin,
            chunks,
            delay: None,
            fail: false,
        }
    }

    pub fn failing(origin: Origin) -> Self {
        Self {
            origin,
            chunks: Vec::new(),
            delay: None,
            fail: true,
        }
    }

    /// Respond only after `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl SnippetProvider for StaticSnippetProvider {
    fn origin(&self) -> Origin {
        self.origin
    }

    async fn search(&self, _query: &str) -> Result<Vec<ContextChunk>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(AppError::upstream(self.origin.as_str(), "provider error"));
        }
        Ok(self.chunks.clone())
    }
}

/// Web search and encyclopedia providers from configuration
pub fn create_providers(
    config: &WebSearchConfig,
) -> Result<(Arc<dyn SnippetProvider>, Arc<dyn SnippetProvider>)> {
    Ok((
        Arc::new(DuckDuckGoProvider::new(config)?),
        Arc::new(WikipediaProvider::new(config)?),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("abcdef", 3), "abc...");
        assert_eq!(truncate_chars("abc", 3), "abc");
        assert_eq!(truncate_chars("Ölfeld", 2), "Öl...");
    }

    #[test]
    fn test_instant_answer_to_chunks() {
        let provider = DuckDuckGoProvider::new(&WebSearchConfig::default()).unwrap();
        let answer: InstantAnswer = serde_json::from_value(serde_json::json!({
            "Heading": "River delta",
            "AbstractText": "A river delta is a landform.",
            "AbstractURL": "https://example.org/delta",
            "RelatedTopics": [
                {"Text": "Mississippi River Delta", "FirstURL": "https://example.org/miss"},
                {"Name": "Category", "Topics": []}
            ]
        }))
        .unwrap();

        let chunks = provider.to_chunks(answer);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].title.as_deref(), Some("River delta"));
        assert_eq!(chunks[0].origin, Origin::WebSearch);
        assert_eq!(chunks[1].document_id, "https://example.org/miss");
        assert!((chunks[0].score - 0.8).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_static_provider_failure() {
        let provider = StaticSnippetProvider::failing(Origin::Encyclopedia);
        assert!(provider.search("q").await.is_err());
        assert_eq!(provider.origin(), Origin::Encyclopedia);
    }
}
