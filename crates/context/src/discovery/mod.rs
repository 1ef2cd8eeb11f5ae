//! Deep discovery: resumable multi-step research runs
//!
//! planning → running ⇄ paused → completed | stopped | error

pub mod orchestrator;
pub mod plan;
pub mod run;
pub mod store;

pub use orchestrator::DiscoveryOrchestrator;
pub use plan::{canonical_plan, RetrievalPolicy, StepDescriptor};
pub use run::{
    Control, DiscoveryRun, DiscoverySnapshot, DiscoverySource, DiscoveryStep, RunOptions, RunStatus,
    StepStatus,
};
pub use store::{DiscoveryStore, Retention, RunHandle};
