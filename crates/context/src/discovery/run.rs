//! Discovery run and step state

use chrono::{DateTime, Utc};
use geoforge_common::{errors::AppError, models::ContextChunk, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use super::plan::StepDescriptor;

/// Per-step status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Error,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Error)
    }
}

/// Aggregate run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Planning,
    Running,
    Paused,
    Completed,
    Stopped,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Planning => "planning",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Stopped => "stopped",
            RunStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Stopped | RunStatus::Error
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller control operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Pause,
    Resume,
    Stop,
}

impl Control {
    pub fn as_str(&self) -> &'static str {
        match self {
            Control::Pause => "pause",
            Control::Resume => "resume",
            Control::Stop => "stop",
        }
    }

    /// Status after applying this control from `from`, if allowed
    pub fn target(&self, from: RunStatus) -> Option<RunStatus> {
        match (self, from) {
            (Control::Pause, RunStatus::Running) => Some(RunStatus::Paused),
            (Control::Resume, RunStatus::Paused) => Some(RunStatus::Running),
            (Control::Stop, RunStatus::Running | RunStatus::Paused) => Some(RunStatus::Stopped),
            _ => None,
        }
    }
}

/// A source found by a step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySource {
    /// Stable hash of origin, document id and span
    pub id: String,
    pub chunk: ContextChunk,
    pub step_index: usize,
    pub discovered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryStep {
    pub index: usize,
    pub name: String,
    pub status: StepStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub sources: Vec<DiscoverySource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl DiscoveryStep {
    fn pending(index: usize, name: &str) -> Self {
        Self {
            index,
            name: name.to_string(),
            status: StepStatus::Pending,
            progress: 0,
            result: None,
            error: None,
            sources: Vec::new(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// Per-run options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    pub include_web_search: bool,
    pub include_knowledge_base: bool,
    /// Leading plan steps to run; the whole plan when unset
    pub max_steps: Option<usize>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            include_web_search: true,
            include_knowledge_base: true,
            max_steps: None,
        }
    }
}

/// One multi-step research run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryRun {
    pub id: Uuid,
    pub query: String,
    pub options: RunOptions,
    pub status: RunStatus,
    pub steps: Vec<DiscoveryStep>,
    /// Deduplicated by source id, in discovery order
    pub sources: Vec<DiscoverySource>,
    pub search_terms: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_report: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl DiscoveryRun {
    /// New run in `planning` with one pending step per plan entry
    pub fn new(query: impl Into<String>, options: RunOptions, plan: &[StepDescriptor]) -> Result<Self> {
        let query = query.into();
        if query.trim().is_empty() {
            return Err(AppError::validation("query must not be empty"));
        }
        let step_count = match options.max_steps {
            Some(0) => return Err(AppError::validation("max_steps must be at least 1")),
            Some(n) => n.min(plan.len()),
            None => plan.len(),
        };

        let now = Utc::now();
        Ok(Self {
            id: Uuid::now_v7(),
            query,
            options,
            status: RunStatus::Planning,
            steps: plan
                .iter()
                .take(step_count)
                .enumerate()
                .map(|(i, d)| DiscoveryStep::pending(i, d.name))
                .collect(),
            sources: Vec::new(),
            search_terms: Vec::new(),
            final_report: None,
            error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        })
    }

    /// Mean step progress, 0-100
    pub fn progress(&self) -> u8 {
        if self.steps.is_empty() {
            return 0;
        }
        let total: u32 = self.steps.iter().map(|s| s.progress as u32).sum();
        (total / self.steps.len() as u32) as u8
    }

    /// First step that has not reached a terminal status
    pub fn current_step(&self) -> Option<usize> {
        self.steps.iter().position(|s| !s.status.is_terminal())
    }

    pub fn next_pending(&self) -> Option<usize> {
        self.steps
            .iter()
            .position(|s| s.status == StepStatus::Pending)
    }

    /// Errored steps at the end of the plan; a run whose last step failed has no
    /// later step to recover in
    pub fn trailing_failures(&self) -> usize {
        self.steps
            .iter()
            .rev()
            .take_while(|s| s.status == StepStatus::Error)
            .count()
    }

    /// Leave `planning` once the plan is in place
    pub fn begin(&mut self) {
        if self.status == RunStatus::Planning {
            self.status = RunStatus::Running;
            self.touch();
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Apply a caller control, rejecting transitions the state machine does not allow
    pub fn apply(&mut self, control: Control) -> Result<RunStatus> {
        let target = control
            .target(self.status)
            .ok_or_else(|| AppError::InvalidTransition {
                id: self.id.to_string(),
                action: control.as_str().to_string(),
                status: self.status.as_str().to_string(),
            })?;
        self.status = target;
        if target.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        self.touch();
        Ok(target)
    }

    /// End the run with a terminal status unless it already ended
    pub fn finish(&mut self, status: RunStatus, error: Option<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.error = error;
        self.finished_at = Some(Utc::now());
        self.touch();
    }

    pub fn start_step(&mut self, index: usize) {
        if let Some(step) = self.steps.get_mut(index) {
            step.status = StepStatus::Running;
            step.progress = 10;
            step.started_at = Some(Utc::now());
        }
        self.touch();
    }

    pub fn set_step_progress(&mut self, index: usize, progress: u8) {
        if let Some(step) = self.steps.get_mut(index) {
            if !step.status.is_terminal() {
                step.progress = progress.min(100);
            }
        }
        self.touch();
    }

    /// Record chunks found by a running step. Returns how many were new to the run.
    pub fn add_sources(&mut self, index: usize, chunks: &[ContextChunk]) -> usize {
        let Some(step) = self.steps.get_mut(index) else {
            return 0;
        };
        if step.status.is_terminal() {
            return 0;
        }

        let now = Utc::now();
        let mut step_ids: HashSet<String> = step.sources.iter().map(|s| s.id.clone()).collect();
        let mut run_ids: HashSet<String> = self.sources.iter().map(|s| s.id.clone()).collect();
        let mut added = 0;

        for chunk in chunks {
            let source = DiscoverySource {
                id: chunk.source_id(),
                chunk: chunk.clone(),
                step_index: index,
                discovered_at: now,
            };
            if step_ids.insert(source.id.clone()) {
                step.sources.push(source.clone());
            }
            if run_ids.insert(source.id.clone()) {
                self.sources.push(source);
                added += 1;
            }
        }
        self.touch();
        added
    }

    pub fn complete_step(&mut self, index: usize, result: String) {
        if let Some(step) = self.steps.get_mut(index) {
            step.status = StepStatus::Completed;
            step.progress = 100;
            step.result = Some(result);
            step.completed_at = Some(Utc::now());
        }
        self.touch();
    }

    pub fn fail_step(&mut self, index: usize, error: String) {
        if let Some(step) = self.steps.get_mut(index) {
            step.status = StepStatus::Error;
            step.progress = 100;
            step.error = Some(error);
            step.completed_at = Some(Utc::now());
        }
        self.touch();
    }

    /// Results of finished steps, one `name: result` paragraph each
    pub fn findings(&self) -> String {
        self.steps
            .iter()
            .filter_map(|s| match (&s.result, &s.error) {
                (Some(result), _) => Some(format!("{}: {}", s.name, result)),
                (None, Some(error)) => Some(format!("{}: failed ({})", s.name, error)),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn snapshot(&self) -> DiscoverySnapshot {
        DiscoverySnapshot {
            discovery_id: self.id,
            progress: self.progress(),
            current_step: self.current_step(),
            run: self.clone(),
        }
    }
}

/// Run view returned to callers
#[derive(Debug, Clone, Serialize)]
pub struct DiscoverySnapshot {
    pub discovery_id: Uuid,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<usize>,
    #[serde(flatten)]
    pub run: DiscoveryRun,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::plan::canonical_plan;
    use geoforge_common::models::Origin;

    fn run() -> DiscoveryRun {
        DiscoveryRun::new("delta subsidence", RunOptions::default(), &canonical_plan(3, 2)).unwrap()
    }

    #[test]
    fn test_new_run_is_planning_with_pending_steps() {
        let run = run();
        assert_eq!(run.status, RunStatus::Planning);
        assert_eq!(run.steps.len(), 5);
        assert!(run.steps.iter().all(|s| s.status == StepStatus::Pending && s.progress == 0));
        assert_eq!(run.next_pending(), Some(0));
        assert!(run.final_report.is_none());
    }

    #[test]
    fn test_max_steps_truncates_plan() {
        let options = RunOptions {
            max_steps: Some(2),
            ..RunOptions::default()
        };
        let run = DiscoveryRun::new("q", options, &canonical_plan(3, 2)).unwrap();
        assert_eq!(run.steps.len(), 2);

        let options = RunOptions {
            max_steps: Some(0),
            ..RunOptions::default()
        };
        assert!(DiscoveryRun::new("q", options, &canonical_plan(3, 2)).is_err());
        assert!(DiscoveryRun::new("  ", RunOptions::default(), &canonical_plan(3, 2)).is_err());
    }

    #[test]
    fn test_transitions() {
        let mut run = run();
        // Not yet running
        assert!(run.apply(Control::Pause).is_err());
        run.status = RunStatus::Running;

        assert_eq!(run.apply(Control::Pause).unwrap(), RunStatus::Paused);
        assert!(matches!(
            run.apply(Control::Pause),
            Err(AppError::InvalidTransition { .. })
        ));
        assert_eq!(run.apply(Control::Resume).unwrap(), RunStatus::Running);
        assert!(run.apply(Control::Resume).is_err());
        assert_eq!(run.apply(Control::Stop).unwrap(), RunStatus::Stopped);
        assert!(run.finished_at.is_some());

        for control in [Control::Pause, Control::Resume, Control::Stop] {
            assert!(run.apply(control).is_err());
            assert_eq!(run.status, RunStatus::Stopped);
        }
    }

    #[test]
    fn test_finish_does_not_override_terminal() {
        let mut run = run();
        run.status = RunStatus::Running;
        run.apply(Control::Stop).unwrap();
        run.finish(RunStatus::Completed, None);
        assert_eq!(run.status, RunStatus::Stopped);
    }

    #[test]
    fn test_sources_dedupe_across_steps() {
        let mut run = run();
        let a = ContextChunk::snippet("a", None, "alpha", 0.9, Origin::KnowledgeBase);
        let b = ContextChunk::snippet("b", None, "beta", 0.8, Origin::WebSearch);

        run.start_step(0);
        assert_eq!(run.add_sources(0, &[a.clone(), a.clone()]), 1);
        assert_eq!(run.steps[0].sources.len(), 1);
        run.complete_step(0, "done".into());

        run.start_step(1);
        assert_eq!(run.add_sources(1, &[a.clone(), b]), 1);
        assert_eq!(run.steps[1].sources.len(), 2);
        assert_eq!(run.sources.len(), 2);
        assert_eq!(run.sources[0].step_index, 0);

        // Terminal steps take no more sources
        assert_eq!(run.add_sources(0, &[a]), 0);
        assert_eq!(run.steps[0].sources.len(), 1);
    }

    #[test]
    fn test_progress_and_current_step() {
        let mut run = run();
        run.start_step(0);
        assert_eq!(run.steps[0].progress, 10);
        run.set_step_progress(0, 50);
        run.complete_step(0, "ok".into());
        run.start_step(1);
        run.fail_step(1, "boom".into());
        assert_eq!(run.progress(), 40);
        assert_eq!(run.current_step(), Some(2));
        assert!(run.findings().contains("Knowledge Base Deep Dive: failed (boom)"));
        assert_eq!(run.trailing_failures(), 0);

        for index in 2..run.steps.len() {
            run.start_step(index);
            run.fail_step(index, "upstream down".into());
        }
        assert_eq!(run.trailing_failures(), run.steps.len() - 1);
    }

    #[test]
    fn test_snapshot_serializes_flat() {
        let json = serde_json::to_value(run().snapshot()).unwrap();
        assert_eq!(json["status"], "planning");
        assert_eq!(json["steps"][0]["status"], "pending");
        assert_eq!(json["progress"], 0);
        assert_eq!(json["current_step"], 0);
        assert!(json.get("discovery_id").is_some());
    }
}
