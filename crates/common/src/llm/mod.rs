//! LLM endpoint abstraction
//!
//! A single completion call with a typed failure, the bounded retry loop that
//! drives it, and an ordered fallback chain across configured providers.

use crate::config::LlmConfig;
use crate::errors::{AppError, Result};
use crate::models::TokenUsage;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// One completion request
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Raw endpoint reply before shape parsing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub content: String,
    /// Separate reasoning field for endpoints that return one
    pub reasoning: Option<String>,
    pub usage: Option<TokenUsage>,
}

impl Completion {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }
}

/// Classified endpoint failure
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LlmError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("request rejected {status}: {message}")]
    Rejected { status: u16, message: String },

    /// Every provider of a fallback chain spent its budget
    #[error("all providers failed after {attempts} attempts: {message}")]
    Exhausted { attempts: u32, message: String },
}

impl LlmError {
    /// Whether another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, LlmError::Rejected { .. } | LlmError::Exhausted { .. })
    }

    /// Attempts this failure stands for
    pub fn attempts(&self) -> u32 {
        match self {
            LlmError::Exhausted { attempts, .. } => *attempts,
            _ => 1,
        }
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::Connection(err.to_string())
        }
    }
}

/// Trait for chat-completion endpoints
#[async_trait]
pub trait LlmEndpoint: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> std::result::Result<Completion, LlmError>;

    fn model_name(&self) -> &str;

    /// Label of the provider that served the latest completion
    fn provider_used(&self) -> String {
        self.model_name().to_string()
    }

    /// Whether `complete` already retries, so callers must not retry again
    fn retries_internally(&self) -> bool {
        false
    }

    /// Check that the endpoint is reachable
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Bounded retry with exponential backoff and Retry-After handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base: Duration,
    /// Ceiling for any single delay, including Retry-After
    pub max_delay: Duration,
    /// Upper bound for one attempt; `None` leaves it to the endpoint
    pub attempt_timeout: Option<Duration>,
}

impl RetryPolicy {
    /// One attempt, no caller-side deadline
    pub fn single_attempt() -> Self {
        Self {
            max_retries: 0,
            base: Duration::ZERO,
            max_delay: Duration::ZERO,
            attempt_timeout: None,
        }
    }

    /// Delay before retry number `retry` (1-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2_u32.saturating_pow(retry.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.max_delay)
    }
}

impl From<&LlmConfig> for RetryPolicy {
    fn from(config: &LlmConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base: Duration::from_millis(config.retry_base_ms),
            max_delay: Duration::from_secs(config.max_retry_delay_secs),
            attempt_timeout: Some(Duration::from_secs(config.timeout_secs)),
        }
    }
}

/// Failure once the retry budget is spent
#[derive(Debug, Clone, PartialEq)]
pub struct RetryExhausted {
    pub error: LlmError,
    pub attempts: u32,
}

/// Call `endpoint` until it answers, fails non-retryably or runs out of
/// retries. Returns the completion with the number of attempts it took.
pub async fn complete_with_retry(
    endpoint: &dyn LlmEndpoint,
    request: &CompletionRequest,
    policy: &RetryPolicy,
) -> std::result::Result<(Completion, u32), RetryExhausted> {
    let mut attempt = 0;
    let mut spent = 0;

    loop {
        attempt += 1;

        let outcome = match policy.attempt_timeout {
            Some(limit) => tokio::time::timeout(limit, endpoint.complete(request))
                .await
                .unwrap_or(Err(LlmError::Timeout)),
            None => endpoint.complete(request).await,
        };

        let error = match outcome {
            Ok(completion) => return Ok((completion, spent + 1)),
            Err(e) => e,
        };
        spent += error.attempts();

        if !error.is_retryable() || attempt > policy.max_retries {
            return Err(RetryExhausted { error, attempts: spent });
        }

        let delay = match &error {
            LlmError::RateLimited {
                retry_after: Some(after),
            } => (*after).min(policy.max_delay),
            _ => policy.backoff(attempt),
        };

        tracing::warn!(
            model = endpoint.model_name(),
            attempt,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "LLM request failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

/// OpenAI-compatible chat completions client
pub struct OpenAiCompatibleLlm {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiCompatibleLlm {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            model: config.model.clone(),
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

/// Decode a chat-completions body. Bodies that are not the documented shape
/// come back verbatim as content so the caller can treat them as a bare answer.
fn parse_completion(body: &str) -> Completion {
    #[derive(Deserialize)]
    struct ChatResponse {
        #[serde(default)]
        choices: Vec<ChatChoice>,
        usage: Option<Usage>,
    }

    #[derive(Deserialize)]
    struct ChatChoice {
        message: ChatMessageResponse,
    }

    #[derive(Deserialize)]
    struct ChatMessageResponse {
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        reasoning_content: Option<String>,
    }

    #[derive(Deserialize)]
    struct Usage {
        #[serde(default)]
        prompt_tokens: u32,
        #[serde(default)]
        completion_tokens: u32,
    }

    match serde_json::from_str::<ChatResponse>(body) {
        Ok(parsed) => {
            let usage = parsed.usage.map(|u| TokenUsage {
                input: u.prompt_tokens,
                output: u.completion_tokens,
            });
            let message = parsed.choices.into_iter().next().map(|c| c.message);
            Completion {
                content: message
                    .as_ref()
                    .and_then(|m| m.content.clone())
                    .unwrap_or_default(),
                reasoning: message
                    .and_then(|m| m.reasoning_content)
                    .filter(|r| !r.trim().is_empty()),
                usage,
            }
        }
        Err(_) => Completion::text(body),
    }
}

#[async_trait]
impl LlmEndpoint for OpenAiCompatibleLlm {
    async fn complete(&self, request: &CompletionRequest) -> std::result::Result<Completion, LlmError> {
        #[derive(Serialize)]
        struct ChatMessage<'a> {
            role: &'static str,
            content: &'a str,
        }

        #[derive(Serialize)]
        struct ChatRequest<'a> {
            model: &'a str,
            messages: Vec<ChatMessage<'a>>,
            max_tokens: u32,
            temperature: f32,
        }

        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let response = self
            .authorize(self.client.post(&self.endpoint))
            .json(&body)
            .send()
            .await
            .map_err(LlmError::from_reqwest)?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(LlmError::RateLimited {
                retry_after: retry_after(&response),
            });
        }
        if status.is_server_error() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Server {
                status: status.as_u16(),
                message,
            });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let text = response.text().await.map_err(LlmError::from_reqwest)?;
        Ok(parse_completion(&text))
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn health_check(&self) -> Result<()> {
        let base = self
            .endpoint
            .trim_end_matches('/')
            .trim_end_matches("/chat/completions");
        let response = self
            .authorize(self.client.get(format!("{}/models", base)))
            .send()
            .await
            .map_err(|e| AppError::upstream("llm", e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(AppError::upstream("llm", format!("models returned {}", response.status())))
        }
    }
}

type Responder = dyn Fn(&CompletionRequest) -> Option<std::result::Result<Completion, LlmError>> + Send + Sync;

/// Scripted endpoint for tests.
///
/// Replies are taken from the queue first, then from the responder, then
/// the default reply is used.
pub struct ScriptedLlm {
    queue: Mutex<VecDeque<std::result::Result<Completion, LlmError>>>,
    responder: Option<Box<Responder>>,
    default_reply: Completion,
    delay: Option<Duration>,
    calls: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            responder: None,
            default_reply: Completion::text("Scripted answer."),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue one reply
    pub fn then(self, reply: std::result::Result<Completion, LlmError>) -> Self {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(reply);
        }
        self
    }

    pub fn with_default(mut self, reply: Completion) -> Self {
        self.default_reply = reply;
        self
    }

    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Option<std::result::Result<Completion, LlmError>> + Send + Sync + 'static,
    {
        self.responder = Some(Box::new(responder));
        self
    }

    /// Every call sleeps before replying
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Requests received so far
    pub fn calls(&self) -> Vec<CompletionRequest> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }
}

impl Default for ScriptedLlm {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmEndpoint for ScriptedLlm {
    async fn complete(&self, request: &CompletionRequest) -> std::result::Result<Completion, LlmError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.clone());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let queued = self.queue.lock().ok().and_then(|mut q| q.pop_front());
        if let Some(reply) = queued {
            return reply;
        }
        if let Some(reply) = self.responder.as_ref().and_then(|r| r(request)) {
            return reply;
        }
        Ok(self.default_reply.clone())
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

/// One link of a fallback chain
pub struct FallbackProvider {
    pub label: String,
    pub endpoint: Arc<dyn LlmEndpoint>,
    pub policy: RetryPolicy,
}

impl FallbackProvider {
    pub fn new(label: impl Into<String>, endpoint: Arc<dyn LlmEndpoint>, policy: RetryPolicy) -> Self {
        Self {
            label: label.into(),
            endpoint,
            policy,
        }
    }
}

/// Ordered provider chain.
///
/// Every provider gets its own retry budget. The next one is tried once a
/// provider has spent it or failed with a non-retryable error; when all of
/// them fail the caller sees one non-retryable [`LlmError::Exhausted`].
pub struct FallbackLlm {
    providers: Vec<FallbackProvider>,
    last_used: AtomicUsize,
}

impl FallbackLlm {
    pub fn new(providers: Vec<FallbackProvider>) -> Result<Self> {
        if providers.is_empty() {
            return Err(AppError::Configuration {
                message: "an LLM fallback chain needs at least one provider".to_string(),
            });
        }
        Ok(Self {
            providers,
            last_used: AtomicUsize::new(0),
        })
    }

    pub fn labels(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.label.as_str()).collect()
    }

    fn current(&self) -> Option<&FallbackProvider> {
        let index = self.last_used.load(Ordering::Relaxed);
        self.providers.get(index).or_else(|| self.providers.first())
    }
}

#[async_trait]
impl LlmEndpoint for FallbackLlm {
    async fn complete(&self, request: &CompletionRequest) -> std::result::Result<Completion, LlmError> {
        let mut spent = 0;
        let mut last_error = None;

        for (index, provider) in self.providers.iter().enumerate() {
            match complete_with_retry(provider.endpoint.as_ref(), request, &provider.policy).await {
                Ok((completion, _)) => {
                    self.last_used.store(index, Ordering::Relaxed);
                    if index > 0 {
                        tracing::info!(provider_used = %provider.label, skipped = index, "LLM completion served by fallback provider");
                    } else {
                        tracing::debug!(provider_used = %provider.label, "LLM completion served");
                    }
                    return Ok(completion);
                }
                Err(failure) => {
                    spent += failure.attempts;
                    tracing::warn!(
                        provider = %provider.label,
                        attempts = failure.attempts,
                        error = %failure.error,
                        "LLM provider failed"
                    );
                    last_error = Some(failure.error);
                }
            }
        }

        tracing::error!(providers = self.providers.len(), attempts = spent, "All LLM providers failed");
        Err(LlmError::Exhausted {
            attempts: spent,
            message: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    fn model_name(&self) -> &str {
        self.current().map(|p| p.endpoint.model_name()).unwrap_or_default()
    }

    fn provider_used(&self) -> String {
        self.current().map(|p| p.label.clone()).unwrap_or_default()
    }

    fn retries_internally(&self) -> bool {
        true
    }

    /// Healthy while any provider is
    async fn health_check(&self) -> Result<()> {
        let mut failures = Vec::new();
        for provider in &self.providers {
            match provider.endpoint.health_check().await {
                Ok(()) => return Ok(()),
                Err(e) => failures.push(format!("{}: {}", provider.label, e)),
            }
        }
        Err(AppError::upstream("llm", failures.join("; ")))
    }
}

fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmEndpoint>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiCompatibleLlm::new(config)?)),
        "mock" => Ok(Arc::new(ScriptedLlm::new())),
        other => Err(AppError::Configuration {
            message: format!("unknown llm provider: {}", other),
        }),
    }
}

fn provider_label(config: &LlmConfig) -> String {
    format!("{}:{}", config.provider, config.model)
}

/// Create an LLM endpoint based on configuration; `llm.fallbacks` turns it
/// into a chain with the primary first
pub fn create_llm(config: &LlmConfig) -> Result<Arc<dyn LlmEndpoint>> {
    let primary = create_provider(config)?;
    if config.fallbacks.is_empty() {
        return Ok(primary);
    }

    let mut chain = vec![FallbackProvider::new(
        provider_label(config),
        primary,
        RetryPolicy::from(config),
    )];
    for fallback in &config.fallbacks {
        chain.push(FallbackProvider::new(
            provider_label(fallback),
            create_provider(fallback)?,
            RetryPolicy::from(fallback),
        ));
    }
    let chain = FallbackLlm::new(chain)?;
    tracing::info!(providers = ?chain.labels(), "LLM fallback chain configured");
    Ok(Arc::new(chain))
}
