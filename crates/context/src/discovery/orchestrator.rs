//! Discovery Orchestrator - drives runs through the step plan
//!
//! Each run gets one driver task. Steps of a run are strictly serialized;
//! the retrieval sub-calls inside a step run in parallel. Controls only
//! change the run status; the driver reads it at step boundaries.

use futures::future::join_all;
use geoforge_common::{
    config::DiscoveryConfig,
    metrics,
    models::{ContextChunk, Origin, Span},
    Result,
};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::plan::{canonical_plan, report_prompt, split_search_terms, RetrievalPolicy, StepDescriptor, SKIPPED_NOTE};
use super::run::{Control, DiscoveryRun, DiscoverySnapshot, RunOptions, RunStatus};
use super::store::{DiscoveryStore, RunHandle};
use crate::assembler::{AssembledContext, ContextAssembler};
use crate::augment::WebAugmenter;
use crate::generation::{GenerateOptions, GenerationClient};
use crate::retrieval::ContextRetriever;

/// Terms kept from the analysis step
const MAX_SEARCH_TERMS: usize = 5;

/// What the driver does at a step boundary
enum Boundary {
    Step(usize),
    Report,
    Wait,
    Exit,
}

pub struct DiscoveryOrchestrator {
    retriever: Arc<ContextRetriever>,
    augmenter: Arc<WebAugmenter>,
    assembler: ContextAssembler,
    generator: Arc<GenerationClient>,
    store: Arc<DiscoveryStore>,
    plan: Vec<StepDescriptor>,
    max_sources_per_step: usize,
}

impl DiscoveryOrchestrator {
    pub fn new(
        retriever: Arc<ContextRetriever>,
        augmenter: Arc<WebAugmenter>,
        assembler: ContextAssembler,
        generator: Arc<GenerationClient>,
        store: Arc<DiscoveryStore>,
        config: &DiscoveryConfig,
    ) -> Self {
        Self {
            retriever,
            augmenter,
            assembler,
            generator,
            store,
            plan: canonical_plan(config.knowledge_base_terms, config.web_terms),
            max_sources_per_step: config.max_sources_per_step,
        }
    }

    pub fn store(&self) -> &Arc<DiscoveryStore> {
        &self.store
    }

    pub fn plan(&self) -> &[StepDescriptor] {
        &self.plan
    }

    /// Create a run and spawn its driver
    pub async fn start(self: &Arc<Self>, query: String, options: RunOptions) -> Result<DiscoverySnapshot> {
        let mut run = DiscoveryRun::new(query, options, &self.plan)?;
        run.begin();
        let snapshot = run.snapshot();
        let handle = self.store.insert(run).await;

        tracing::info!(
            discovery_id = %snapshot.discovery_id,
            steps = snapshot.run.steps.len(),
            web = options.include_web_search,
            knowledge_base = options.include_knowledge_base,
            "Discovery run started"
        );

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move { orchestrator.drive(handle).await });
        Ok(snapshot)
    }

    pub async fn snapshot(&self, id: Uuid) -> Result<DiscoverySnapshot> {
        let handle = self.store.get(id).await?;
        let run = handle.run.read().await;
        Ok(run.snapshot())
    }

    pub async fn pause(&self, id: Uuid) -> Result<RunStatus> {
        self.control(id, Control::Pause).await
    }

    pub async fn resume(&self, id: Uuid) -> Result<RunStatus> {
        self.control(id, Control::Resume).await
    }

    pub async fn stop(&self, id: Uuid) -> Result<RunStatus> {
        self.control(id, Control::Stop).await
    }

    async fn control(&self, id: Uuid, control: Control) -> Result<RunStatus> {
        let handle = self.store.get(id).await?;
        let status = handle.run.write().await.apply(control)?;
        handle.wake.notify_one();

        if status.is_terminal() {
            metrics::record_discovery_run(status.as_str());
        }
        tracing::info!(discovery_id = %id, action = control.as_str(), status = %status, "Discovery control applied");
        Ok(status)
    }

    /// Remove a run, stopping it first if it is still active
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let handle = self.store.remove(id).await?;
        let mut run = handle.run.write().await;
        if !run.status.is_terminal() {
            run.finish(RunStatus::Stopped, None);
            metrics::record_discovery_run(RunStatus::Stopped.as_str());
        }
        handle.wake.notify_one();
        tracing::info!(discovery_id = %id, "Discovery run deleted");
        Ok(())
    }

    /// Driver loop: one step per iteration, honoring controls between steps
    async fn drive(self: Arc<Self>, handle: Arc<RunHandle>) {
        loop {
            let boundary = {
                let run = handle.run.read().await;
                match run.status {
                    RunStatus::Running => match run.next_pending() {
                        Some(index) => Boundary::Step(index),
                        None => Boundary::Report,
                    },
                    RunStatus::Paused => Boundary::Wait,
                    _ => Boundary::Exit,
                }
            };

            match boundary {
                Boundary::Step(index) => self.run_step(&handle, index).await,
                Boundary::Report => {
                    self.finish(&handle).await;
                    break;
                }
                Boundary::Wait => handle.wake.notified().await,
                Boundary::Exit => break,
            }
        }

        let run = handle.run.read().await;
        tracing::info!(
            discovery_id = %run.id,
            status = %run.status,
            sources = run.sources.len(),
            "Discovery driver finished"
        );
    }

    async fn run_step(&self, handle: &RunHandle, index: usize) {
        let (id, query, options, terms, findings, accumulated) = {
            let mut run = handle.run.write().await;
            run.start_step(index);
            (
                run.id,
                run.query.clone(),
                run.options,
                run.search_terms.clone(),
                run.findings(),
                run.sources.iter().map(|s| s.chunk.clone()).collect::<Vec<_>>(),
            )
        };

        let Some(descriptor) = self.plan.get(index) else {
            handle
                .run
                .write()
                .await
                .fail_step(index, "Step is not part of the plan".to_string());
            return;
        };
        tracing::debug!(discovery_id = %id, step = index, name = descriptor.name, "Discovery step started");

        if descriptor.skippable && !sources_enabled(descriptor.retrieval, options) {
            handle.run.write().await.complete_step(index, SKIPPED_NOTE.to_string());
            metrics::record_discovery_step(descriptor.name, "skipped");
            return;
        }

        let (retrieved, web) = self.gather(descriptor.retrieval, &query, &terms, options).await;
        {
            let mut run = handle.run.write().await;
            run.add_sources(index, &retrieved);
            run.add_sources(index, &web);
            run.set_step_progress(index, 50);
        }

        let context = match descriptor.retrieval {
            RetrievalPolicy::None => {
                let (kb, external): (Vec<ContextChunk>, Vec<ContextChunk>) = accumulated
                    .into_iter()
                    .partition(|c| c.origin == Origin::KnowledgeBase);
                self.assembler.assemble(&kb, &external, &[], &query)
            }
            _ => self.assembler.assemble(&retrieved, &web, &[], &query),
        };

        let prompt = descriptor.render(&query, &findings, &context.render());
        let outcome = self
            .generator
            .generate_from_prompt(&context, prompt, GenerateOptions::default())
            .await;

        let mut run = handle.run.write().await;
        match outcome {
            Ok(result) => {
                let mut text = result.answer;
                if descriptor.extracts_terms {
                    let (body, terms) = split_search_terms(&text, MAX_SEARCH_TERMS);
                    if !terms.is_empty() {
                        run.search_terms = terms;
                    }
                    text = body;
                }
                run.complete_step(index, text);
                metrics::record_discovery_step(descriptor.name, "completed");
                tracing::info!(
                    discovery_id = %id,
                    step = index,
                    sources = run.steps.get(index).map(|s| s.sources.len()).unwrap_or(0),
                    "Discovery step completed"
                );
            }
            Err(e) => {
                tracing::warn!(discovery_id = %id, step = index, error = %e, "Discovery step failed");
                run.fail_step(index, e.to_string());
                metrics::record_discovery_step(descriptor.name, "error");
            }
        }
    }

    /// Retrieval round for one step; sub-queries run in parallel
    async fn gather(
        &self,
        policy: RetrievalPolicy,
        query: &str,
        terms: &[String],
        options: RunOptions,
    ) -> (Vec<ContextChunk>, Vec<ContextChunk>) {
        let with_terms = |n: usize| -> Vec<String> {
            std::iter::once(query.to_string())
                .chain(terms.iter().take(n).cloned())
                .collect()
        };

        let (kb_queries, web_queries) = match policy {
            RetrievalPolicy::KnowledgeBase { terms } => (with_terms(terms), Vec::new()),
            RetrievalPolicy::Web { terms } => (Vec::new(), with_terms(terms)),
            RetrievalPolicy::Combined => (with_terms(0), with_terms(0)),
            RetrievalPolicy::None => (Vec::new(), Vec::new()),
        };
        let kb_queries = if options.include_knowledge_base { kb_queries } else { Vec::new() };
        let web_queries = if options.include_web_search { web_queries } else { Vec::new() };

        let (kb, web) = tokio::join!(
            join_all(kb_queries.iter().map(|q| self.retriever.retrieve(q, None))),
            join_all(web_queries.iter().map(|q| self.augmenter.augment(q))),
        );

        (
            best_unique(kb.into_iter().flatten(), self.max_sources_per_step),
            best_unique(web.into_iter().flatten(), usize::MAX),
        )
    }

    /// Synthesize the final report once no pending steps remain
    async fn finish(&self, handle: &RunHandle) {
        let (id, query, findings, source_count, step_count, failed_tail) = {
            let run = handle.run.read().await;
            (
                run.id,
                run.query.clone(),
                run.findings(),
                run.sources.len(),
                run.steps.len(),
                run.trailing_failures(),
            )
        };

        if failed_tail > 0 {
            let message = match (failed_tail, step_count) {
                (failed, total) if failed == total => "All discovery steps failed".to_string(),
                (1, total) => format!("Discovery step {total} failed"),
                (failed, total) => format!("Discovery steps {}-{total} failed", total - failed + 1),
            };
            let mut run = handle.run.write().await;
            run.finish(RunStatus::Error, Some(message));
            metrics::record_discovery_run(run.status.as_str());
            tracing::warn!(discovery_id = %id, failed_steps = failed_tail, "Discovery run failed: no step after the failures succeeded");
            return;
        }

        let outcome = self
            .generator
            .generate_from_prompt(
                &AssembledContext::default(),
                report_prompt(&query, &findings, source_count),
                GenerateOptions::default(),
            )
            .await;

        let mut run = handle.run.write().await;
        if run.status.is_terminal() {
            return;
        }
        match outcome {
            Ok(result) => {
                run.final_report = Some(result.answer);
                run.finish(RunStatus::Completed, None);
                tracing::info!(discovery_id = %id, sources = source_count, "Discovery run completed");
            }
            Err(e) => {
                tracing::warn!(discovery_id = %id, error = %e, "Final report failed");
                run.finish(RunStatus::Error, Some(format!("Final report failed: {}", e)));
            }
        }
        metrics::record_discovery_run(run.status.as_str());
    }
}

fn sources_enabled(policy: RetrievalPolicy, options: RunOptions) -> bool {
    match policy {
        RetrievalPolicy::KnowledgeBase { .. } => options.include_knowledge_base,
        RetrievalPolicy::Web { .. } => options.include_web_search,
        RetrievalPolicy::Combined => options.include_knowledge_base || options.include_web_search,
        RetrievalPolicy::None => true,
    }
}

/// Dedupe by (document, span) keeping the best score, best first, capped
fn best_unique(chunks: impl Iterator<Item = ContextChunk>, limit: usize) -> Vec<ContextChunk> {
    let mut best: HashMap<(String, Span), ContextChunk> = HashMap::new();
    let mut order: Vec<(String, Span)> = Vec::new();
    for chunk in chunks {
        let key = (chunk.document_id.clone(), chunk.span);
        match best.get(&key) {
            Some(existing) if existing.score >= chunk.score => {}
            Some(_) => {
                best.insert(key, chunk);
            }
            None => {
                order.push(key.clone());
                best.insert(key, chunk);
            }
        }
    }

    let mut unique: Vec<ContextChunk> = order.into_iter().filter_map(|k| best.remove(&k)).collect();
    unique.sort_by(|a, b| b.score.total_cmp(&a.score));
    unique.truncate(limit);
    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::run::StepStatus;
    use crate::generation::GenerationSettings;
    use crate::retrieval::tests::seeded_retriever;
    use geoforge_common::config::AppConfig;
    use geoforge_common::errors::AppError;
    use geoforge_common::llm::{Completion, CompletionRequest, LlmError, ScriptedLlm};
    use geoforge_common::rerank::MockReranker;
    use geoforge_common::web::StaticSnippetProvider;
    use std::time::Duration;

    const ANALYSIS: &str = "Deltas subside. [citation:1]\nSEARCH TERMS: elevation gradient, sediment starvation";

    fn rejected() -> LlmError {
        LlmError::Rejected {
            status: 400,
            message: "rejected".into(),
        }
    }

    fn is_analysis(request: &CompletionRequest) -> bool {
        request.prompt.starts_with("Analyze this geospatial research query")
    }

    fn is_report(request: &CompletionRequest) -> bool {
        request.prompt.starts_with("Write a geospatial research report")
    }

    fn analysis_llm() -> ScriptedLlm {
        ScriptedLlm::new()
            .with_responder(|r| is_analysis(r).then(|| Ok(Completion::text(ANALYSIS))))
            .with_default(Completion::text("Step finding."))
    }

    fn orchestrator(llm: ScriptedLlm) -> Arc<DiscoveryOrchestrator> {
        let web = StaticSnippetProvider::new(
            Origin::WebSearch,
            vec![ContextChunk::snippet(
                "https://example.org/deltas",
                None,
                "Many deltas are sinking faster than sea level rises.",
                0.8,
                Origin::WebSearch,
            )],
        );
        let augmenter = WebAugmenter::new(
            Arc::new(web),
            Arc::new(StaticSnippetProvider::new(Origin::Encyclopedia, vec![])),
            Duration::from_secs(1),
        );
        let settings = GenerationSettings {
            max_retries: 0,
            retry_base: Duration::from_millis(1),
            max_retry_delay: Duration::from_millis(1),
            attempt_timeout: Duration::from_secs(5),
            ..GenerationSettings::default()
        };
        let config = AppConfig::default();

        Arc::new(DiscoveryOrchestrator::new(
            Arc::new(seeded_retriever(MockReranker::new().with_score("elevation", 0.95))),
            Arc::new(augmenter),
            ContextAssembler::new(config.assembly.clone()),
            Arc::new(GenerationClient::new(Arc::new(llm), settings)),
            Arc::new(DiscoveryStore::new()),
            &config.discovery,
        ))
    }

    async fn wait_for(
        orchestrator: &DiscoveryOrchestrator,
        id: Uuid,
        done: impl Fn(&DiscoverySnapshot) -> bool,
    ) -> DiscoverySnapshot {
        for _ in 0..500 {
            let snapshot = orchestrator.snapshot(id).await.unwrap();
            if done(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("discovery run {} did not reach the expected state", id);
    }

    fn terminal(snapshot: &DiscoverySnapshot) -> bool {
        snapshot.run.status.is_terminal()
    }

    #[tokio::test]
    async fn test_full_run_completes() {
        let orchestrator = orchestrator(analysis_llm());
        let started = orchestrator
            .start("How fast do river deltas subside?".into(), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(started.run.status, RunStatus::Running);

        let done = wait_for(&orchestrator, started.discovery_id, terminal).await;
        assert_eq!(done.run.status, RunStatus::Completed);
        assert_eq!(done.progress, 100);
        assert!(done.current_step.is_none());
        assert!(done.run.steps.iter().all(|s| s.status == StepStatus::Completed));
        assert_eq!(done.run.search_terms, vec!["elevation gradient", "sediment starvation"]);
        assert_eq!(done.run.steps[0].result.as_deref(), Some("Deltas subside. [citation:1]"));
        assert_eq!(done.run.final_report.as_deref(), Some("Step finding."));

        // Knowledge base and web sources, deduplicated across steps
        assert!(done.run.sources.iter().any(|s| s.chunk.origin == Origin::KnowledgeBase));
        assert!(done.run.sources.iter().any(|s| s.chunk.origin == Origin::WebSearch));
        let mut ids: Vec<&str> = done.run.sources.iter().map(|s| s.id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), done.run.sources.len());
    }

    #[tokio::test]
    async fn test_web_step_skipped_when_disabled() {
        let orchestrator = orchestrator(analysis_llm());
        let options = RunOptions {
            include_web_search: false,
            ..RunOptions::default()
        };
        let started = orchestrator.start("delta".into(), options).await.unwrap();
        let done = wait_for(&orchestrator, started.discovery_id, terminal).await;

        assert_eq!(done.run.status, RunStatus::Completed);
        assert_eq!(done.run.steps[2].result.as_deref(), Some(SKIPPED_NOTE));
        assert!(done.run.steps[2].sources.is_empty());
        assert!(done.run.sources.iter().all(|s| s.chunk.origin == Origin::KnowledgeBase));
    }

    #[tokio::test]
    async fn test_max_steps_limits_plan() {
        let orchestrator = orchestrator(analysis_llm());
        let options = RunOptions {
            max_steps: Some(2),
            ..RunOptions::default()
        };
        let started = orchestrator.start("delta".into(), options).await.unwrap();
        let done = wait_for(&orchestrator, started.discovery_id, terminal).await;
        assert_eq!(done.run.steps.len(), 2);
        assert_eq!(done.run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_failing_step_is_recorded_and_run_proceeds() {
        let llm = ScriptedLlm::new()
            .with_responder(|r| {
                if r.prompt.starts_with("Perform a cross-reference analysis") {
                    Some(Err(rejected()))
                } else {
                    None
                }
            })
            .with_default(Completion::text("Step finding."));
        let orchestrator = orchestrator(llm);
        let started = orchestrator.start("delta".into(), RunOptions::default()).await.unwrap();
        let done = wait_for(&orchestrator, started.discovery_id, terminal).await;

        assert_eq!(done.run.status, RunStatus::Completed);
        assert_eq!(done.run.steps[3].status, StepStatus::Error);
        assert!(done.run.steps[3].error.is_some());
        assert_eq!(done.run.steps[4].status, StepStatus::Completed);
        assert!(done.run.final_report.is_some());
    }

    #[tokio::test]
    async fn test_every_step_failing_fails_the_run() {
        let llm = ScriptedLlm::new().with_responder(|_| Some(Err(rejected())));
        let orchestrator = orchestrator(llm);
        let started = orchestrator.start("delta".into(), RunOptions::default()).await.unwrap();
        let done = wait_for(&orchestrator, started.discovery_id, terminal).await;

        assert_eq!(done.run.status, RunStatus::Error);
        assert_eq!(done.run.error.as_deref(), Some("All discovery steps failed"));
        assert!(done.run.steps.iter().all(|s| s.status == StepStatus::Error));
        assert!(done.run.final_report.is_none());
    }

    #[tokio::test]
    async fn test_failing_tail_fails_the_run() {
        let llm = ScriptedLlm::new().with_responder(|r| {
            if is_analysis(r) {
                Some(Ok(Completion::text(ANALYSIS)))
            } else if is_report(r) {
                Some(Ok(Completion::text("Report.")))
            } else {
                Some(Err(rejected()))
            }
        });
        let orchestrator = orchestrator(llm);
        let started = orchestrator.start("delta".into(), RunOptions::default()).await.unwrap();
        let done = wait_for(&orchestrator, started.discovery_id, terminal).await;

        assert_eq!(done.run.status, RunStatus::Error);
        assert_eq!(done.run.error.as_deref(), Some("Discovery steps 2-5 failed"));
        assert_eq!(done.run.steps[0].status, StepStatus::Completed);
        assert!(done.run.steps[1..].iter().all(|s| s.status == StepStatus::Error));
        assert!(done.run.final_report.is_none());
    }

    #[tokio::test]
    async fn test_final_report_failure_keeps_steps() {
        let llm = ScriptedLlm::new()
            .with_responder(|r| is_report(r).then(|| Err(rejected())))
            .with_default(Completion::text("Step finding."));
        let orchestrator = orchestrator(llm);
        let started = orchestrator.start("delta".into(), RunOptions::default()).await.unwrap();
        let done = wait_for(&orchestrator, started.discovery_id, terminal).await;

        assert_eq!(done.run.status, RunStatus::Error);
        assert!(done.run.error.as_deref().unwrap_or_default().starts_with("Final report failed"));
        assert!(done.run.final_report.is_none());
        assert!(done.run.steps.iter().all(|s| s.status == StepStatus::Completed));
    }

    #[tokio::test]
    async fn test_pause_then_resume_matches_uninterrupted_run() {
        let baseline = orchestrator(analysis_llm());
        let plain = baseline.start("delta".into(), RunOptions::default()).await.unwrap();
        let plain = wait_for(&baseline, plain.discovery_id, terminal).await;

        let orchestrator = orchestrator(analysis_llm());
        let started = orchestrator.start("delta".into(), RunOptions::default()).await.unwrap();
        let id = started.discovery_id;
        assert_eq!(orchestrator.pause(id).await.unwrap(), RunStatus::Paused);
        assert_eq!(orchestrator.resume(id).await.unwrap(), RunStatus::Running);
        let resumed = wait_for(&orchestrator, id, terminal).await;

        assert_eq!(resumed.run.status, plain.run.status);
        assert_eq!(resumed.run.search_terms, plain.run.search_terms);
        assert_eq!(resumed.run.final_report, plain.run.final_report);
        let results = |s: &DiscoverySnapshot| -> Vec<(StepStatus, Option<String>, usize)> {
            s.run
                .steps
                .iter()
                .map(|st| (st.status, st.result.clone(), st.sources.len()))
                .collect()
        };
        assert_eq!(results(&resumed), results(&plain));
    }

    #[tokio::test]
    async fn test_pause_holds_at_step_boundary() {
        let orchestrator = orchestrator(analysis_llm().with_delay(Duration::from_millis(50)));
        let started = orchestrator.start("delta".into(), RunOptions::default()).await.unwrap();
        let id = started.discovery_id;
        orchestrator.pause(id).await.unwrap();

        // Any in-flight step finishes, nothing new starts
        wait_for(&orchestrator, id, |s| {
            s.run.steps.iter().all(|st| st.status != StepStatus::Running)
        })
        .await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        let held = orchestrator.snapshot(id).await.unwrap();
        assert_eq!(held.run.status, RunStatus::Paused);
        assert!(held.run.steps.iter().all(|st| st.status != StepStatus::Running));
        assert!(held.run.steps.iter().filter(|st| st.status.is_terminal()).count() <= 1);

        orchestrator.resume(id).await.unwrap();
        let done = wait_for(&orchestrator, id, terminal).await;
        assert_eq!(done.run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_stop_is_terminal() {
        let orchestrator = orchestrator(analysis_llm().with_delay(Duration::from_millis(50)));
        let started = orchestrator.start("delta".into(), RunOptions::default()).await.unwrap();
        let id = started.discovery_id;

        assert_eq!(orchestrator.stop(id).await.unwrap(), RunStatus::Stopped);
        for result in [
            orchestrator.pause(id).await,
            orchestrator.resume(id).await,
            orchestrator.stop(id).await,
        ] {
            assert!(matches!(result, Err(AppError::InvalidTransition { .. })));
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        let snapshot = orchestrator.snapshot(id).await.unwrap();
        assert_eq!(snapshot.run.status, RunStatus::Stopped);
        assert!(snapshot.run.final_report.is_none());
        // At most the in-flight step ran
        assert!(snapshot.run.steps.iter().filter(|s| s.status.is_terminal()).count() <= 1);
        assert!(snapshot.run.steps.iter().all(|s| s.status != StepStatus::Running));
    }

    #[tokio::test]
    async fn test_unknown_run_and_delete() {
        let orchestrator = orchestrator(analysis_llm().with_delay(Duration::from_millis(50)));
        assert!(matches!(
            orchestrator.snapshot(Uuid::now_v7()).await,
            Err(AppError::RunNotFound { .. })
        ));
        assert!(matches!(
            orchestrator.pause(Uuid::now_v7()).await,
            Err(AppError::RunNotFound { .. })
        ));

        let started = orchestrator.start("delta".into(), RunOptions::default()).await.unwrap();
        let id = started.discovery_id;
        let handle = orchestrator.store().get(id).await.unwrap();
        orchestrator.delete(id).await.unwrap();

        assert!(orchestrator.snapshot(id).await.is_err());
        assert_eq!(handle.run.read().await.status, RunStatus::Stopped);
        assert!(orchestrator.delete(id).await.is_err());
    }

    #[test]
    fn test_best_unique_keeps_highest_copy() {
        let low = ContextChunk::snippet("a", None, "alpha", 0.4, Origin::KnowledgeBase);
        let high = ContextChunk::snippet("a", None, "alpha", 0.9, Origin::KnowledgeBase);
        let other = ContextChunk::snippet("b", None, "beta", 0.6, Origin::KnowledgeBase);

        let unique = best_unique(vec![low, other, high].into_iter(), 8);
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].document_id, "a");
        assert!((unique[0].score - 0.9).abs() < f32::EPSILON);

        let capped = best_unique(unique.into_iter(), 1);
        assert_eq!(capped.len(), 1);
    }
}
