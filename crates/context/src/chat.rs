//! Chat Orchestrator - one conversational turn
//!
//! collecting_context → generating → done | failed
//!
//! Context collection fans out retrieval, web augmentation and selected
//! document loading on a `JoinSet` raced against one turn deadline.
//! Stragglers are aborted and generation proceeds with what arrived.

use geoforge_common::{
    config::AppConfig,
    documents::DocumentStore,
    errors::AppError,
    models::{ContextChunk, Query, TokenUsage},
};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

use crate::assembler::{load_selected, ContextAssembler};
use crate::augment::WebAugmenter;
use crate::generation::{GenerateOptions, GenerationClient};
use crate::retrieval::ContextRetriever;

/// Turn states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatPhase {
    CollectingContext,
    Generating,
    Done,
    Failed,
}

impl ChatPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatPhase::CollectingContext => "collecting_context",
            ChatPhase::Generating => "generating",
            ChatPhase::Done => "done",
            ChatPhase::Failed => "failed",
        }
    }
}

/// Successful turn
#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub answer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    pub sources: Vec<ContextChunk>,
    pub tokens: TokenUsage,
    pub processing_time_ms: u64,
}

/// Failed turn; the assembled context still goes back to the caller
#[derive(Debug)]
pub struct ChatFailure {
    pub error: AppError,
    pub sources: Vec<ContextChunk>,
}

/// Result of one context collection task
enum Collected {
    Retrieved(Vec<ContextChunk>),
    Web(Vec<ContextChunk>),
    Selected(Vec<ContextChunk>),
}

#[derive(Default)]
struct Gathered {
    retrieved: Vec<ContextChunk>,
    web: Vec<ContextChunk>,
    selected: Vec<ContextChunk>,
}

pub struct ChatOrchestrator {
    retriever: Arc<ContextRetriever>,
    augmenter: Arc<WebAugmenter>,
    documents: Arc<dyn DocumentStore>,
    assembler: ContextAssembler,
    generator: Arc<GenerationClient>,
    context_timeout: Duration,
    selected_excerpt_chars: usize,
}

impl ChatOrchestrator {
    pub fn new(
        retriever: Arc<ContextRetriever>,
        augmenter: Arc<WebAugmenter>,
        documents: Arc<dyn DocumentStore>,
        assembler: ContextAssembler,
        generator: Arc<GenerationClient>,
        config: &AppConfig,
    ) -> Self {
        Self {
            retriever,
            augmenter,
            documents,
            assembler,
            generator,
            context_timeout: Duration::from_secs(config.chat.context_timeout_secs),
            selected_excerpt_chars: config.documents.selected_excerpt_chars,
        }
    }

    /// Override the collection deadline
    pub fn with_context_timeout(mut self, timeout: Duration) -> Self {
        self.context_timeout = timeout;
        self
    }

    /// Run one turn
    pub async fn handle(&self, query: Query) -> std::result::Result<ChatResponse, ChatFailure> {
        let start = Instant::now();
        let mut phase = ChatPhase::CollectingContext;
        tracing::debug!(phase = phase.as_str(), web = query.enable_web_search, "Chat turn started");

        let gathered = self.collect(&query).await;
        let context = self.assembler.assemble(
            &gathered.retrieved,
            &gathered.web,
            &gathered.selected,
            &query.message,
        );

        phase = ChatPhase::Generating;
        tracing::debug!(
            phase = phase.as_str(),
            chunks = context.chunks.len(),
            truncated = context.truncated,
            "Context collected"
        );

        let options = GenerateOptions {
            params: query.params,
            include_thinking: query.include_thinking,
        };

        match self.generator.generate(&context, &query.message, options).await {
            Ok(result) => {
                phase = ChatPhase::Done;
                let sources = if result.citations.is_empty() {
                    context.chunks
                } else {
                    result.citations
                };
                let processing_time_ms = start.elapsed().as_millis() as u64;
                tracing::info!(
                    phase = phase.as_str(),
                    sources = sources.len(),
                    processing_time_ms,
                    "Chat turn completed"
                );
                Ok(ChatResponse {
                    answer: result.answer,
                    thinking: result.thinking,
                    sources,
                    tokens: result.usage,
                    processing_time_ms,
                })
            }
            Err(error) => {
                phase = ChatPhase::Failed;
                tracing::warn!(phase = phase.as_str(), error = %error, "Chat turn failed");
                Err(ChatFailure {
                    error,
                    sources: context.chunks,
                })
            }
        }
    }

    /// Fan out context collection under the turn deadline
    async fn collect(&self, query: &Query) -> Gathered {
        let mut set = JoinSet::new();

        let retriever = self.retriever.clone();
        let message = query.message.clone();
        let scope = (!query.selected_file_ids.is_empty()).then(|| query.selected_file_ids.clone());
        set.spawn(async move {
            Collected::Retrieved(retriever.retrieve(&message, scope.as_deref()).await)
        });

        if query.enable_web_search {
            let augmenter = self.augmenter.clone();
            let message = query.message.clone();
            set.spawn(async move { Collected::Web(augmenter.augment(&message).await) });
        }

        if !query.selected_file_ids.is_empty() {
            let documents = self.documents.clone();
            let ids = query.selected_file_ids.clone();
            let max_chars = self.selected_excerpt_chars;
            set.spawn(async move {
                Collected::Selected(load_selected(documents.as_ref(), &ids, max_chars).await)
            });
        }

        let deadline = tokio::time::Instant::now() + self.context_timeout;
        let mut gathered = Gathered::default();

        loop {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok(collected))) => match collected {
                    Collected::Retrieved(chunks) => gathered.retrieved = chunks,
                    Collected::Web(chunks) => gathered.web = chunks,
                    Collected::Selected(chunks) => gathered.selected = chunks,
                },
                Ok(Some(Err(e))) => {
                    tracing::warn!(error = %e, "Context task failed");
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        pending = set.len(),
                        timeout_ms = self.context_timeout.as_millis() as u64,
                        "Context collection deadline reached"
                    );
                    set.abort_all();
                    break;
                }
            }
        }

        gathered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::GenerationSettings;
    use crate::retrieval::tests::seeded_retriever;
    use crate::retrieval::RetrievalSettings;
    use geoforge_common::documents::MemoryDocumentStore;
    use geoforge_common::embeddings::MockEmbedder;
    use geoforge_common::llm::{Completion, LlmError, ScriptedLlm};
    use geoforge_common::models::Origin;
    use geoforge_common::rerank::MockReranker;
    use geoforge_common::vector::MemoryVectorStore;
    use geoforge_common::web::StaticSnippetProvider;

    fn fast_generation() -> GenerationSettings {
        GenerationSettings {
            max_retries: 1,
            retry_base: Duration::from_millis(1),
            max_retry_delay: Duration::from_millis(5),
            attempt_timeout: Duration::from_secs(5),
            ..GenerationSettings::default()
        }
    }

    fn augmenter(web: StaticSnippetProvider) -> Arc<WebAugmenter> {
        Arc::new(WebAugmenter::new(
            Arc::new(web),
            Arc::new(StaticSnippetProvider::new(Origin::Encyclopedia, vec![])),
            Duration::from_secs(1),
        ))
    }

    fn orchestrator(
        retriever: ContextRetriever,
        web: StaticSnippetProvider,
        documents: Arc<dyn DocumentStore>,
        llm: Arc<ScriptedLlm>,
    ) -> ChatOrchestrator {
        ChatOrchestrator::new(
            Arc::new(retriever),
            augmenter(web),
            documents,
            ContextAssembler::new(AppConfig::default().assembly),
            Arc::new(GenerationClient::new(llm, fast_generation())),
            &AppConfig::default(),
        )
    }

    fn empty_retriever(documents: Arc<dyn DocumentStore>) -> ContextRetriever {
        ContextRetriever::new(
            Arc::new(MockEmbedder::new(4)),
            Arc::new(MemoryVectorStore::new()),
            Arc::new(MockReranker::new()),
            documents,
            RetrievalSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_empty_knowledge_base_still_generates() {
        let documents: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
        let llm = Arc::new(ScriptedLlm::new().with_default(Completion::text("<think>hmm</think>Deltas are flat.")));
        let chat = orchestrator(
            empty_retriever(documents.clone()),
            StaticSnippetProvider::new(Origin::WebSearch, vec![]),
            documents,
            llm.clone(),
        );

        let response = chat.handle(Query::new("What is a delta?")).await.unwrap();
        assert_eq!(response.answer, "Deltas are flat.");
        assert!(response.sources.is_empty());
        assert!(response.thinking.is_none());
        assert_eq!(llm.call_count(), 1);
        assert!(llm.calls()[0].prompt.contains("No documents were found"));

        let mut query = Query::new("What is a delta?");
        query.include_thinking = true;
        let response = chat.handle(query).await.unwrap();
        assert_eq!(response.thinking.as_deref(), Some("hmm"));
    }

    #[tokio::test]
    async fn test_cited_sources_are_returned() {
        let documents: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
        let llm = Arc::new(ScriptedLlm::new().with_default(Completion::text("Gradients are low [citation:1].")));
        let chat = orchestrator(
            seeded_retriever(MockReranker::new().with_score("elevation", 0.95)),
            StaticSnippetProvider::new(Origin::WebSearch, vec![]),
            documents,
            llm.clone(),
        );

        let response = chat
            .handle(Query::new("elevation gradient of a river delta"))
            .await
            .unwrap();
        assert_eq!(response.sources.len(), 1);
        assert_eq!(response.sources[0].document_id, "delta");
        assert!(llm.calls()[0].prompt.contains("[document 1 begin]"));
    }

    #[tokio::test]
    async fn test_web_snippets_join_context_when_enabled() {
        let documents: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
        let llm = Arc::new(ScriptedLlm::new());
        let web = StaticSnippetProvider::new(
            Origin::WebSearch,
            vec![ContextChunk::snippet(
                "https://example.org/delta",
                None,
                "River deltas are depositional landforms.",
                0.8,
                Origin::WebSearch,
            )],
        );
        let chat = orchestrator(empty_retriever(documents.clone()), web, documents, llm.clone());

        let mut query = Query::new("delta");
        let response = chat.handle(query.clone()).await.unwrap();
        assert!(response.sources.is_empty());

        query.enable_web_search = true;
        let response = chat.handle(query).await.unwrap();
        assert_eq!(response.sources.len(), 1);
        assert_eq!(response.sources[0].origin, Origin::WebSearch);
    }

    #[tokio::test]
    async fn test_selected_documents_are_loaded() {
        let store = MemoryDocumentStore::new();
        store.insert("survey", Some("Survey"), "Shoreline retreat measured at 4 m per year.");
        let documents: Arc<dyn DocumentStore> = Arc::new(store);
        let llm = Arc::new(ScriptedLlm::new());
        let chat = orchestrator(
            empty_retriever(documents.clone()),
            StaticSnippetProvider::new(Origin::WebSearch, vec![]),
            documents,
            llm.clone(),
        );

        let mut query = Query::new("How fast is the shoreline retreating?");
        query.selected_file_ids = vec!["survey".to_string()];
        let response = chat.handle(query).await.unwrap();
        assert_eq!(response.sources.len(), 1);
        assert_eq!(response.sources[0].document_id, "survey");
    }

    #[tokio::test]
    async fn test_slow_provider_is_cut_at_deadline() {
        let documents: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
        let llm = Arc::new(ScriptedLlm::new());
        let web = StaticSnippetProvider::new(
            Origin::WebSearch,
            vec![ContextChunk::snippet("https://slow", None, "late", 0.8, Origin::WebSearch)],
        )
        .with_delay(Duration::from_secs(30));
        let chat = ChatOrchestrator::new(
            Arc::new(empty_retriever(documents.clone())),
            Arc::new(WebAugmenter::new(
                Arc::new(web),
                Arc::new(StaticSnippetProvider::new(Origin::Encyclopedia, vec![])),
                Duration::from_secs(60),
            )),
            documents,
            ContextAssembler::new(AppConfig::default().assembly),
            Arc::new(GenerationClient::new(llm.clone(), fast_generation())),
            &AppConfig::default(),
        )
        .with_context_timeout(Duration::from_millis(100));

        let mut query = Query::new("delta");
        query.enable_web_search = true;

        let started = Instant::now();
        let response = chat.handle(query).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(response.sources.is_empty());
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn test_generation_failure_returns_context() {
        let documents: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
        let llm = Arc::new(ScriptedLlm::new().with_responder(|_| {
            Some(Err(LlmError::Server {
                status: 500,
                message: "down".into(),
            }))
        }));
        let chat = orchestrator(
            seeded_retriever(MockReranker::new().with_score("elevation", 0.95)),
            StaticSnippetProvider::new(Origin::WebSearch, vec![]),
            documents,
            llm.clone(),
        );

        let failure = chat
            .handle(Query::new("elevation gradient of a river delta"))
            .await
            .unwrap_err();
        assert!(matches!(failure.error, AppError::GenerationFailed { attempts: 2, .. }));
        assert_eq!(failure.sources.len(), 1);
        assert_eq!(llm.call_count(), 2);
    }
}
