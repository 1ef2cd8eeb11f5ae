//! Web Augmenter
//!
//! Queries the web search and encyclopedia providers concurrently. Each
//! provider runs under its own timeout and contributes nothing on failure.

use geoforge_common::{metrics, models::ContextChunk, web::SnippetProvider};
use std::sync::Arc;
use std::time::Duration;

pub struct WebAugmenter {
    web: Arc<dyn SnippetProvider>,
    encyclopedia: Arc<dyn SnippetProvider>,
    timeout: Duration,
}

impl WebAugmenter {
    pub fn new(
        web: Arc<dyn SnippetProvider>,
        encyclopedia: Arc<dyn SnippetProvider>,
        timeout: Duration,
    ) -> Self {
        Self {
            web,
            encyclopedia,
            timeout,
        }
    }

    /// Web snippets followed by encyclopedia summaries; never fails
    pub async fn augment(&self, query: &str) -> Vec<ContextChunk> {
        let (mut web, encyclopedia) = tokio::join!(
            self.lookup(self.web.as_ref(), query),
            self.lookup(self.encyclopedia.as_ref(), query),
        );
        web.extend(encyclopedia);
        web
    }

    async fn lookup(&self, provider: &dyn SnippetProvider, query: &str) -> Vec<ContextChunk> {
        let origin = provider.origin();
        match tokio::time::timeout(self.timeout, provider.search(query)).await {
            Ok(Ok(chunks)) => {
                tracing::debug!(origin = %origin, count = chunks.len(), "Provider returned snippets");
                chunks
                    .into_iter()
                    .filter(|c| c.origin == origin && !c.text.trim().is_empty())
                    .collect()
            }
            Ok(Err(e)) => {
                tracing::warn!(origin = %origin, error = %e, "Snippet provider failed");
                metrics::record_degradation(origin.as_str());
                Vec::new()
            }
            Err(_) => {
                tracing::warn!(
                    origin = %origin,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Snippet provider timed out"
                );
                metrics::record_degradation(origin.as_str());
                Vec::new()
            }
        }
    }
}
