//! GeoForge Sandbox
//!
//! Executes caller-supplied Python analysis code under CPU, memory, time and
//! network limits:
//! - Static validation before anything is spawned
//! - A bootstrap runner that restricts imports, builtins and file access
//! - bubblewrap or plain-process isolation
//! - Deadline and resident-memory supervision with process-tree kills
//! - Per-execution working directories removed on every exit path

pub mod isolation;
pub mod monitor;
pub mod policy;
pub mod registry;
pub mod runner;
pub mod supervisor;
pub mod validate;

pub use isolation::{BackendKind, IsolationBackend};
pub use policy::{ExecutionStatus, ResourceLimits, SandboxPolicy, SandboxRequest, SandboxResult, WorkdirPolicy};
pub use registry::{ExecutionEntry, ExecutionRegistry};
pub use supervisor::SandboxSupervisor;
pub use validate::{Finding, FindingKind};
