//! Configuration management for GeoForge services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config/default, config/{APP_ENV}, config/local)
//! - Default values
//!
//! Every section has defaults so the gateway boots with no files present.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{AppError, Result};

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Embedding service configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Reranking service configuration
    #[serde(default)]
    pub reranking: RerankingConfig,

    /// Vector store configuration
    #[serde(default)]
    pub vector_store: VectorStoreConfig,

    /// Document store configuration (span expansion, selected files)
    #[serde(default)]
    pub documents: DocumentsConfig,

    /// Web search and encyclopedia providers
    #[serde(default)]
    pub web_search: WebSearchConfig,

    /// LLM endpoint configuration
    #[serde(default)]
    pub llm: LlmConfig,

    /// Context retriever tuning
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Context assembler budget
    #[serde(default)]
    pub assembly: AssemblyConfig,

    /// Chat orchestrator configuration
    #[serde(default)]
    pub chat: ChatConfig,

    /// Discovery orchestrator configuration
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Sandbox supervisor configuration
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Maximum accepted request body in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    /// Embedding provider: http, mock
    #[serde(default = "default_http_provider")]
    pub provider: String,

    /// Base URL of the embedding service
    #[serde(default = "default_embedding_url")]
    pub url: String,

    /// Embedding dimension
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    /// Request timeout in seconds
    #[serde(default = "default_service_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RerankingConfig {
    /// Reranking provider: http, mock
    #[serde(default = "default_http_provider")]
    pub provider: String,

    /// Base URL of the reranking service
    #[serde(default = "default_reranking_url")]
    pub url: String,

    /// Query/passage pairs per request
    #[serde(default = "default_rerank_batch_size")]
    pub batch_size: usize,

    /// Request timeout in seconds
    #[serde(default = "default_service_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VectorStoreConfig {
    /// Vector store provider: milvus, memory
    #[serde(default = "default_vector_provider")]
    pub provider: String,

    /// Milvus/Zilliz REST endpoint
    #[serde(default = "default_vector_uri")]
    pub uri: String,

    /// Access token for managed deployments
    pub token: Option<String>,

    /// Collection holding the chunk embeddings
    #[serde(default = "default_collection")]
    pub collection: String,

    /// Request timeout in seconds
    #[serde(default = "default_service_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DocumentsConfig {
    /// Directory holding one `<document_id>.txt` file per document
    #[serde(default = "default_documents_root")]
    pub root_dir: String,

    /// Characters of each caller-selected document included in chat context
    #[serde(default = "default_selected_excerpt_chars")]
    pub selected_excerpt_chars: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebSearchConfig {
    /// Instant-answer web search API
    #[serde(default = "default_web_url")]
    pub web_url: String,

    /// Encyclopedia API base
    #[serde(default = "default_encyclopedia_url")]
    pub encyclopedia_url: String,

    /// Per-provider timeout in seconds
    #[serde(default = "default_web_timeout")]
    pub timeout_secs: u64,

    /// Maximum characters kept from a web snippet
    #[serde(default = "default_web_max_chars")]
    pub web_max_chars: usize,

    /// Maximum characters kept from an encyclopedia summary
    #[serde(default = "default_encyclopedia_max_chars")]
    pub encyclopedia_max_chars: usize,

    /// Encyclopedia articles fetched per query
    #[serde(default = "default_encyclopedia_results")]
    pub encyclopedia_results: usize,

    /// Relevance assigned to web snippets
    #[serde(default = "default_web_relevance")]
    pub web_relevance: f32,

    /// Relevance assigned to encyclopedia summaries
    #[serde(default = "default_encyclopedia_relevance")]
    pub encyclopedia_relevance: f32,

    /// User agent sent to public APIs
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    /// LLM provider: openai (any compatible endpoint), mock
    #[serde(default = "default_llm_provider")]
    pub provider: String,

    /// Chat completions endpoint
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,

    /// API key
    pub api_key: Option<String>,

    /// Model name
    #[serde(default = "default_llm_model")]
    pub model: String,

    /// Per-attempt timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    /// Retries after the first attempt
    #[serde(default = "default_llm_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    /// Ceiling for any single retry delay, including Retry-After
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_secs: u64,

    /// Default maximum output tokens
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Default sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Providers tried in order once this one fails; each keeps its own
    /// retry settings
    #[serde(default)]
    pub fallbacks: Vec<LlmConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrievalConfig {
    /// Nearest-neighbor candidates requested from the vector store
    #[serde(default = "default_candidate_pool")]
    pub candidate_pool: usize,

    /// Rerank score a candidate must exceed to be kept
    #[serde(default = "default_relevance_threshold")]
    pub relevance_threshold: f32,

    /// Maximum chunks returned
    #[serde(default = "default_top_n")]
    pub top_n: usize,

    /// Characters added on each side of a kept span
    #[serde(default = "default_expand_margin")]
    pub expand_margin: usize,

    /// Timeout for one span expansion in seconds
    #[serde(default = "default_expand_timeout")]
    pub expand_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssemblyConfig {
    /// Usable LLM context window in characters
    #[serde(default = "default_context_window_chars")]
    pub context_window_chars: usize,

    /// Characters reserved for the prompt template and the answer
    #[serde(default = "default_reserved_chars")]
    pub reserved_chars: usize,

    /// Smallest truncated tail worth including
    #[serde(default = "default_min_chunk_chars")]
    pub min_chunk_chars: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatConfig {
    /// Deadline for the context collection fan-out in seconds
    #[serde(default = "default_context_timeout")]
    pub context_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscoveryConfig {
    /// Seconds a finished run stays queryable
    #[serde(default = "default_retention")]
    pub retention_secs: u64,

    /// Seconds a paused run may sit idle before it is stopped
    #[serde(default = "default_paused_ttl")]
    pub paused_ttl_secs: u64,

    /// Interval of the retention sweeper in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Search terms used by the knowledge base step
    #[serde(default = "default_kb_terms")]
    pub knowledge_base_terms: usize,

    /// Search terms used by the web step
    #[serde(default = "default_web_terms")]
    pub web_terms: usize,

    /// Sources kept per knowledge base step
    #[serde(default = "default_sources_per_step")]
    pub max_sources_per_step: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SandboxConfig {
    /// Python interpreter
    #[serde(default = "default_python_path")]
    pub python_path: String,

    /// Isolation backend: auto, bwrap, process.
    /// `auto` requires bubblewrap; `process` has only interpreter-level guards
    /// and must be chosen explicitly.
    #[serde(default = "default_sandbox_backend")]
    pub backend: String,

    /// Explicit bubblewrap binary (searched in PATH otherwise)
    pub bwrap_path: Option<String>,

    /// Extra host paths mounted read-only inside bubblewrap, e.g. a virtualenv
    #[serde(default)]
    pub extra_ro_binds: Vec<String>,

    /// Parent directory for per-execution working directories
    pub work_root: Option<String>,

    /// Directory receiving copies of produced artifacts
    pub artifacts_dir: Option<String>,

    /// Default wall-clock timeout in seconds
    #[serde(default = "default_sandbox_timeout")]
    pub default_timeout_secs: u64,

    /// Largest timeout a request may ask for
    #[serde(default = "default_sandbox_max_timeout")]
    pub max_timeout_secs: u64,

    /// Resident memory ceiling in MiB
    #[serde(default = "default_memory_limit")]
    pub memory_limit_mb: u64,

    /// CPU cores the process may run on
    #[serde(default = "default_cpu_cores")]
    pub cpu_cores: usize,

    /// Concurrent executions host-wide
    #[serde(default = "default_sandbox_concurrency")]
    pub max_concurrent: usize,

    /// Seconds a request waits for a free slot
    #[serde(default = "default_queue_timeout")]
    pub queue_timeout_secs: u64,

    /// Captured bytes per stream
    #[serde(default = "default_max_output")]
    pub max_output_bytes: usize,

    /// Largest accepted source file
    #[serde(default = "default_max_code")]
    pub max_code_bytes: usize,

    /// Resource sampling interval
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_ms: u64,

    /// Wait after a kill before giving up on reaping
    #[serde(default = "default_kill_grace")]
    pub kill_grace_secs: u64,

    /// Whether requests may ask for network access at all
    #[serde(default)]
    pub permit_network: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Requests per second
    #[serde(default = "default_rate_limit")]
    pub requests_per_second: u32,

    /// Burst capacity
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Enable rate limiting
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_request_timeout() -> u64 { 120 }
fn default_shutdown_timeout() -> u64 { 30 }
fn default_max_body_bytes() -> usize { 2 * 1024 * 1024 }
fn default_http_provider() -> String { "http".to_string() }
fn default_embedding_url() -> String { "http://localhost:8810".to_string() }
fn default_embedding_dimension() -> usize { 1024 }
fn default_service_timeout() -> u64 { 10 }
fn default_reranking_url() -> String { "http://localhost:8811".to_string() }
fn default_rerank_batch_size() -> usize { 32 }
fn default_vector_provider() -> String { "milvus".to_string() }
fn default_vector_uri() -> String { "http://localhost:19530".to_string() }
fn default_collection() -> String { "geoforge_chunks".to_string() }
fn default_documents_root() -> String { "data/documents".to_string() }
fn default_selected_excerpt_chars() -> usize { 4000 }
fn default_web_url() -> String { "https://api.duckduckgo.com".to_string() }
fn default_encyclopedia_url() -> String { "https://en.wikipedia.org".to_string() }
fn default_web_timeout() -> u64 { 8 }
fn default_web_max_chars() -> usize { 1000 }
fn default_encyclopedia_max_chars() -> usize { 1500 }
fn default_encyclopedia_results() -> usize { 2 }
fn default_web_relevance() -> f32 { 0.8 }
fn default_encyclopedia_relevance() -> f32 { 0.9 }
fn default_user_agent() -> String { format!("geoforge/{}", crate::VERSION) }
fn default_llm_provider() -> String { "openai".to_string() }
fn default_llm_endpoint() -> String { "http://localhost:8000/v1/chat/completions".to_string() }
fn default_llm_model() -> String { "deepseek-r1".to_string() }
fn default_llm_timeout() -> u64 { 60 }
fn default_llm_retries() -> u32 { 3 }
fn default_retry_base_ms() -> u64 { 500 }
fn default_max_retry_delay() -> u64 { 30 }
fn default_max_tokens() -> u32 { 2048 }
fn default_temperature() -> f32 { 0.7 }
fn default_candidate_pool() -> usize { 128 }
fn default_relevance_threshold() -> f32 { 0.5 }
fn default_top_n() -> usize { 3 }
fn default_expand_margin() -> usize { 1024 }
fn default_expand_timeout() -> u64 { 5 }
fn default_context_window_chars() -> usize { 16_000 }
fn default_reserved_chars() -> usize { 4_000 }
fn default_min_chunk_chars() -> usize { 200 }
fn default_context_timeout() -> u64 { 20 }
fn default_retention() -> u64 { 3600 }
fn default_paused_ttl() -> u64 { 1800 }
fn default_sweep_interval() -> u64 { 60 }
fn default_kb_terms() -> usize { 3 }
fn default_web_terms() -> usize { 2 }
fn default_sources_per_step() -> usize { 8 }
fn default_python_path() -> String { "python3".to_string() }
fn default_sandbox_backend() -> String { "auto".to_string() }
fn default_sandbox_timeout() -> u64 { 30 }
fn default_sandbox_max_timeout() -> u64 { 300 }
fn default_memory_limit() -> u64 { 512 }
fn default_cpu_cores() -> usize { 1 }
fn default_sandbox_concurrency() -> usize { 4 }
fn default_queue_timeout() -> u64 { 10 }
fn default_max_output() -> usize { 1024 * 1024 }
fn default_max_code() -> usize { 100 * 1024 }
fn default_monitor_interval() -> u64 { 100 }
fn default_kill_grace() -> u64 { 2 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "geoforge".to_string() }
fn default_rate_limit() -> u32 { 50 }
fn default_burst() -> u32 { 100 }
fn default_enabled() -> bool { true }

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> std::result::Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))
            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            // Load local overrides
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables with APP__ prefix
            // e.g., APP__LLM__API_KEY=sk-...
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load from a specific file
    pub fn from_file(path: &str) -> std::result::Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Reject values the orchestrators cannot work with
    pub fn validate(&self) -> Result<()> {
        let fail = |message: &str| {
            Err(AppError::Configuration {
                message: message.to_string(),
            })
        };

        if self.assembly.reserved_chars >= self.assembly.context_window_chars {
            return fail("assembly.reserved_chars must be smaller than assembly.context_window_chars");
        }
        if self.retrieval.candidate_pool == 0 || self.retrieval.top_n == 0 {
            return fail("retrieval.candidate_pool and retrieval.top_n must be positive");
        }
        if self.reranking.batch_size == 0 {
            return fail("reranking.batch_size must be positive");
        }
        if self.sandbox.max_concurrent == 0 || self.sandbox.cpu_cores == 0 {
            return fail("sandbox.max_concurrent and sandbox.cpu_cores must be positive");
        }
        if self.sandbox.default_timeout_secs == 0
            || self.sandbox.default_timeout_secs > self.sandbox.max_timeout_secs
        {
            return fail("sandbox.default_timeout_secs must be in 1..=sandbox.max_timeout_secs");
        }
        if !matches!(self.sandbox.backend.as_str(), "auto" | "bwrap" | "process") {
            return fail("sandbox.backend must be one of auto, bwrap, process");
        }
        if self.rate_limit.enabled
            && (self.rate_limit.requests_per_second == 0 || self.rate_limit.burst == 0)
        {
            return fail("rate_limit.requests_per_second and rate_limit.burst must be positive");
        }
        Ok(())
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }
}

impl AssemblyConfig {
    /// Character budget left for context chunks
    pub fn budget(&self) -> usize {
        self.context_window_chars.saturating_sub(self.reserved_chars)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_http_provider(),
            url: default_embedding_url(),
            dimension: default_embedding_dimension(),
            timeout_secs: default_service_timeout(),
        }
    }
}

impl Default for RerankingConfig {
    fn default() -> Self {
        Self {
            provider: default_http_provider(),
            url: default_reranking_url(),
            batch_size: default_rerank_batch_size(),
            timeout_secs: default_service_timeout(),
        }
    }
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            provider: default_vector_provider(),
            uri: default_vector_uri(),
            token: None,
            collection: default_collection(),
            timeout_secs: default_service_timeout(),
        }
    }
}

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            root_dir: default_documents_root(),
            selected_excerpt_chars: default_selected_excerpt_chars(),
        }
    }
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            web_url: default_web_url(),
            encyclopedia_url: default_encyclopedia_url(),
            timeout_secs: default_web_timeout(),
            web_max_chars: default_web_max_chars(),
            encyclopedia_max_chars: default_encyclopedia_max_chars(),
            encyclopedia_results: default_encyclopedia_results(),
            web_relevance: default_web_relevance(),
            encyclopedia_relevance: default_encyclopedia_relevance(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            endpoint: default_llm_endpoint(),
            api_key: None,
            model: default_llm_model(),
            timeout_secs: default_llm_timeout(),
            max_retries: default_llm_retries(),
            retry_base_ms: default_retry_base_ms(),
            max_retry_delay_secs: default_max_retry_delay(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            fallbacks: Vec::new(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            candidate_pool: default_candidate_pool(),
            relevance_threshold: default_relevance_threshold(),
            top_n: default_top_n(),
            expand_margin: default_expand_margin(),
            expand_timeout_secs: default_expand_timeout(),
        }
    }
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            context_window_chars: default_context_window_chars(),
            reserved_chars: default_reserved_chars(),
            min_chunk_chars: default_min_chunk_chars(),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            context_timeout_secs: default_context_timeout(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention(),
            paused_ttl_secs: default_paused_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            knowledge_base_terms: default_kb_terms(),
            web_terms: default_web_terms(),
            max_sources_per_step: default_sources_per_step(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            python_path: default_python_path(),
            backend: default_sandbox_backend(),
            bwrap_path: None,
            extra_ro_binds: Vec::new(),
            work_root: None,
            artifacts_dir: None,
            default_timeout_secs: default_sandbox_timeout(),
            max_timeout_secs: default_sandbox_max_timeout(),
            memory_limit_mb: default_memory_limit(),
            cpu_cores: default_cpu_cores(),
            max_concurrent: default_sandbox_concurrency(),
            queue_timeout_secs: default_queue_timeout(),
            max_output_bytes: default_max_output(),
            max_code_bytes: default_max_code(),
            monitor_interval_ms: default_monitor_interval(),
            kill_grace_secs: default_kill_grace(),
            permit_network: false,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_rate_limit(),
            burst: default_burst(),
            enabled: default_enabled(),
        }
    }
}
