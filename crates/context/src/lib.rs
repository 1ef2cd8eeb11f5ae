//! GeoForge Context Engine
//!
//! Retrieval-augmented generation pipeline and deep discovery:
//! - Context retrieval (embed, search, rerank, select, expand)
//! - Web augmentation
//! - Context assembly with citation numbering
//! - Generation with bounded retries
//! - Chat and discovery orchestration

pub mod assembler;
pub mod augment;
pub mod chat;
pub mod discovery;
pub mod generation;
pub mod retrieval;

pub use assembler::{AssembledContext, ContextAssembler};
pub use augment::WebAugmenter;
pub use chat::{ChatFailure, ChatOrchestrator, ChatPhase, ChatResponse};
pub use discovery::{DiscoveryOrchestrator, DiscoveryStore};
pub use generation::{GenerateOptions, GenerationClient, GenerationSettings, ReplyShape};
pub use retrieval::{ContextRetriever, RetrievalSettings};
