//! GeoForge Common Library
//!
//! Shared code for the GeoForge orchestration core including:
//! - Core data model (queries, context chunks, generation results)
//! - Provider clients (embedding, reranking, vector store, documents, web, LLM)
//! - Error types and handling
//! - Configuration management
//! - Metrics and observability

pub mod config;
pub mod documents;
pub mod embeddings;
pub mod errors;
pub mod llm;
pub mod metrics;
pub mod models;
pub mod rerank;
pub mod vector;
pub mod web;

// Re-export commonly used types
pub use config::AppConfig;
pub use embeddings::Embedder;
pub use errors::{AppError, Result};
pub use models::{ContextChunk, Origin, Span};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
