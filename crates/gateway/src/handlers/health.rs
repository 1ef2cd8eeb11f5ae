//! Health check handler

use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use geoforge_common::errors::Result;
use serde::Serialize;
use std::future::Future;
use std::time::{Duration, Instant};

use crate::AppState;

/// Upper bound for a single dependency check
const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Aggregate reachability of the leaf services
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Online,
    Degraded,
    Offline,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: OverallStatus,
    pub version: &'static str,
    pub checks: HealthChecks,
    /// LLM provider that served the latest completion
    pub llm_provider: String,
    pub sandbox: SandboxHealth,
    pub discovery: DiscoveryHealth,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub embedding: CheckResult,
    pub reranking: CheckResult,
    pub vector_store: CheckResult,
    pub llm: CheckResult,
}

impl HealthChecks {
    fn all(&self) -> [&CheckResult; 4] {
        [&self.embedding, &self.reranking, &self.vector_store, &self.llm]
    }
}

#[derive(Serialize)]
pub struct CheckResult {
    pub status: String,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CheckResult {
    fn is_up(&self) -> bool {
        self.status == "up"
    }
}

#[derive(Serialize)]
pub struct SandboxHealth {
    pub backend: &'static str,
    pub max_concurrent: usize,
    pub available_slots: usize,
    pub in_flight: usize,
}

#[derive(Serialize)]
pub struct DiscoveryHealth {
    pub active_runs: usize,
    pub retained_runs: usize,
}

/// Check every dependency concurrently and report local capacity
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let upstreams = &state.upstreams;
    let (embedding, reranking, vector_store, llm) = tokio::join!(
        timed_check(upstreams.embedder.health_check()),
        timed_check(upstreams.reranker.health_check()),
        timed_check(upstreams.vector_store.health_check()),
        timed_check(upstreams.llm.health_check()),
    );
    let checks = HealthChecks {
        embedding,
        reranking,
        vector_store,
        llm,
    };
    let status = overall(&checks.all());
    if status != OverallStatus::Online {
        tracing::warn!(status = ?status, "Dependency health degraded");
    }

    let sandbox = &state.sandbox;
    let store = state.discovery.store();

    Json(HealthResponse {
        status,
        version: geoforge_common::VERSION,
        checks,
        llm_provider: upstreams.llm.provider_used(),
        sandbox: SandboxHealth {
            backend: sandbox.backend().name(),
            max_concurrent: sandbox.max_concurrent(),
            available_slots: sandbox.available_slots(),
            in_flight: sandbox.registry().len(),
        },
        discovery: DiscoveryHealth {
            active_runs: store.active_count().await,
            retained_runs: store.len().await,
        },
        timestamp: Utc::now(),
    })
}

async fn timed_check<F>(check: F) -> CheckResult
where
    F: Future<Output = Result<()>>,
{
    let start = Instant::now();
    let outcome = tokio::time::timeout(CHECK_TIMEOUT, check).await;
    let latency_ms = start.elapsed().as_millis() as u64;

    let error = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(_) => Some(format!("no response within {}s", CHECK_TIMEOUT.as_secs())),
    };
    CheckResult {
        status: if error.is_none() { "up" } else { "down" }.to_string(),
        latency_ms,
        error,
    }
}

fn overall(checks: &[&CheckResult]) -> OverallStatus {
    let up = checks.iter().filter(|c| c.is_up()).count();
    if up == checks.len() {
        OverallStatus::Online
    } else if up == 0 {
        OverallStatus::Offline
    } else {
        OverallStatus::Degraded
    }
}
