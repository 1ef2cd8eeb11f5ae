//! Generation Client - turns assembled context into a grounded answer
//!
//! Provides:
//! - Prompt construction (grounded, ungrounded, optional reasoning)
//! - Bounded retries with exponential backoff and Retry-After handling
//! - Reply shape parsing and citation resolution against this call's context

pub mod prompt;
pub mod reply;

use chrono::Utc;
use geoforge_common::{
    config::LlmConfig,
    errors::{AppError, Result},
    llm::{self, Completion, CompletionRequest, LlmEndpoint, RetryPolicy},
    metrics,
    models::{GenerationParams, GenerationResult, TokenUsage},
};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::assembler::AssembledContext;
pub use reply::{parse_reply, ReplyShape};

/// Retry and default sampling settings
#[derive(Debug, Clone)]
pub struct GenerationSettings {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub retry_base: Duration,
    pub max_retry_delay: Duration,
    pub attempt_timeout: Duration,
    pub default_max_tokens: u32,
    pub default_temperature: f32,
}

impl From<&LlmConfig> for GenerationSettings {
    fn from(config: &LlmConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_base: Duration::from_millis(config.retry_base_ms),
            max_retry_delay: Duration::from_secs(config.max_retry_delay_secs),
            attempt_timeout: Duration::from_secs(config.timeout_secs),
            default_max_tokens: config.max_tokens,
            default_temperature: config.temperature,
        }
    }
}

impl GenerationSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base: self.retry_base,
            max_delay: self.max_retry_delay,
            attempt_timeout: Some(self.attempt_timeout),
        }
    }
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self::from(&LlmConfig::default())
    }
}

/// Per-call options
#[derive(Debug, Clone, Copy, Default)]
pub struct GenerateOptions {
    pub params: GenerationParams,
    /// Ask for and return the reasoning trace
    pub include_thinking: bool,
}

/// Generation client
pub struct GenerationClient {
    llm: Arc<dyn LlmEndpoint>,
    settings: GenerationSettings,
}

impl GenerationClient {
    pub fn new(llm: Arc<dyn LlmEndpoint>, settings: GenerationSettings) -> Self {
        Self { llm, settings }
    }

    pub fn model_name(&self) -> &str {
        self.llm.model_name()
    }

    /// Answer a chat question from the assembled context
    pub async fn generate(
        &self,
        context: &AssembledContext,
        question: &str,
        options: GenerateOptions,
    ) -> Result<GenerationResult> {
        let prompt = prompt::chat_prompt(
            context,
            question,
            options.include_thinking,
            Utc::now().date_naive(),
        );
        self.generate_from_prompt(context, prompt, options).await
    }

    /// Run a caller-built prompt whose `[document N]` blocks come from `context`
    pub async fn generate_from_prompt(
        &self,
        context: &AssembledContext,
        prompt: String,
        options: GenerateOptions,
    ) -> Result<GenerationResult> {
        let start = Instant::now();
        let request = CompletionRequest {
            system: prompt::SYSTEM_PROMPT.to_string(),
            prompt,
            max_tokens: options
                .params
                .max_tokens
                .unwrap_or(self.settings.default_max_tokens),
            temperature: options
                .params
                .temperature
                .unwrap_or(self.settings.default_temperature),
        };

        let (completion, attempts) = match self.complete_with_retry(&request).await {
            Ok(done) => done,
            Err(e) => {
                metrics::record_generation(start.elapsed().as_secs_f64(), self.attempts_of(&e), false);
                return Err(e);
            }
        };

        let usage = completion
            .usage
            .unwrap_or_else(|| TokenUsage::estimate(&request.prompt, &completion.content));
        let shape = parse_reply(&completion);
        let shape_kind = shape.kind();

        let (answer, thinking, indices) = match shape {
            ReplyShape::Full {
                thinking,
                answer,
                citations,
            } => (answer, Some(thinking), citations),
            ReplyShape::AnswerOnly { answer, citations } => (answer, None, citations),
            ReplyShape::Malformed { raw } => (raw, None, Vec::new()),
        };

        // Citations only resolve against this call's context
        let citations = indices
            .into_iter()
            .filter_map(|i| context.resolve(i).cloned())
            .collect::<Vec<_>>();

        let latency_ms = start.elapsed().as_millis() as u64;
        metrics::record_generation(start.elapsed().as_secs_f64(), attempts, true);
        tracing::info!(
            model = self.llm.model_name(),
            provider = %self.llm.provider_used(),
            shape = shape_kind,
            attempts,
            citations = citations.len(),
            input_tokens = usage.input,
            output_tokens = usage.output,
            latency_ms,
            "Generation completed"
        );

        Ok(GenerationResult {
            answer,
            thinking: thinking.filter(|_| options.include_thinking),
            citations,
            usage,
            latency_ms,
        })
    }

    fn attempts_of(&self, error: &AppError) -> u32 {
        match error {
            AppError::GenerationFailed { attempts, .. } => *attempts,
            _ => 0,
        }
    }

    /// Make request with retry; a chain that retries on its own gets one call
    async fn complete_with_retry(&self, request: &CompletionRequest) -> Result<(Completion, u32)> {
        let policy = if self.llm.retries_internally() {
            RetryPolicy::single_attempt()
        } else {
            self.settings.retry_policy()
        };

        llm::complete_with_retry(self.llm.as_ref(), request, &policy)
            .await
            .map_err(|failure| {
                tracing::error!(attempts = failure.attempts, error = %failure.error, "LLM request failed");
                AppError::GenerationFailed {
                    attempts: failure.attempts,
                    message: failure.error.to_string(),
                }
            })
    }
}
