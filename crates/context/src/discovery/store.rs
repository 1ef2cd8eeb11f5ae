//! Process-wide discovery run store
//!
//! Runs live here from submission until a retention sweep or an explicit
//! delete removes them. Each run sits behind its own lock so unrelated runs
//! never contend.

use chrono::{DateTime, Utc};
use geoforge_common::{errors::AppError, metrics, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::run::{DiscoveryRun, RunStatus};

/// Shared state of one run: the run itself plus the driver's wake-up signal
pub struct RunHandle {
    pub run: RwLock<DiscoveryRun>,
    pub wake: Notify,
}

impl RunHandle {
    fn new(run: DiscoveryRun) -> Self {
        Self {
            run: RwLock::new(run),
            wake: Notify::new(),
        }
    }
}

/// Retention policy for finished and idle runs
#[derive(Debug, Clone, Copy)]
pub struct Retention {
    /// How long a terminal run stays queryable
    pub finished: Duration,
    /// How long a paused run may sit before it is stopped
    pub paused: Duration,
}

fn older_than(since: DateTime<Utc>, now: DateTime<Utc>, ttl: Duration) -> bool {
    (now - since).to_std().map(|age| age >= ttl).unwrap_or(false)
}

#[derive(Default)]
pub struct DiscoveryStore {
    runs: RwLock<HashMap<Uuid, Arc<RunHandle>>>,
}

impl DiscoveryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, run: DiscoveryRun) -> Arc<RunHandle> {
        let id = run.id;
        let handle = Arc::new(RunHandle::new(run));
        let mut runs = self.runs.write().await;
        runs.insert(id, handle.clone());
        metrics::set_discovery_runs(runs.len());
        handle
    }

    pub async fn get(&self, id: Uuid) -> Result<Arc<RunHandle>> {
        self.runs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::RunNotFound { id: id.to_string() })
    }

    pub async fn remove(&self, id: Uuid) -> Result<Arc<RunHandle>> {
        let mut runs = self.runs.write().await;
        let handle = runs
            .remove(&id)
            .ok_or_else(|| AppError::RunNotFound { id: id.to_string() })?;
        metrics::set_discovery_runs(runs.len());
        Ok(handle)
    }

    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.runs.read().await.is_empty()
    }

    /// Runs that have not reached a terminal status
    pub async fn active_count(&self) -> usize {
        let handles: Vec<Arc<RunHandle>> = self.runs.read().await.values().cloned().collect();
        let mut active = 0;
        for handle in handles {
            if !handle.run.read().await.status.is_terminal() {
                active += 1;
            }
        }
        active
    }

    /// Stop idle paused runs and drop expired terminal runs.
    /// Returns `(stopped, removed)`.
    pub async fn sweep(&self, retention: Retention) -> (usize, usize) {
        let now = Utc::now();

        let handles: Vec<(Uuid, Arc<RunHandle>)> = self
            .runs
            .read()
            .await
            .iter()
            .map(|(id, h)| (*id, h.clone()))
            .collect();

        let mut stopped = 0;
        let mut expired = Vec::new();
        for (id, handle) in handles {
            let mut run = handle.run.write().await;
            let status = run.status;
            match status {
                RunStatus::Paused if older_than(run.updated_at, now, retention.paused) => {
                    run.finish(RunStatus::Stopped, Some("Stopped after idling while paused".to_string()));
                    handle.wake.notify_one();
                    metrics::record_discovery_run(RunStatus::Stopped.as_str());
                    tracing::info!(discovery_id = %id, "Paused discovery run expired");
                    stopped += 1;
                }
                _ if status.is_terminal() => {
                    let finished_at = run.finished_at.unwrap_or(run.updated_at);
                    if older_than(finished_at, now, retention.finished) {
                        expired.push(id);
                    }
                }
                _ => {}
            }
        }

        let removed = if expired.is_empty() {
            0
        } else {
            let mut runs = self.runs.write().await;
            let before = runs.len();
            for id in &expired {
                runs.remove(id);
            }
            metrics::set_discovery_runs(runs.len());
            before - runs.len()
        };

        if stopped > 0 || removed > 0 {
            tracing::debug!(stopped, removed, "Discovery retention sweep");
        }
        (stopped, removed)
    }

    /// Sweep periodically until the returned task is aborted
    pub fn spawn_sweeper(self: &Arc<Self>, retention: Retention, interval: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                store.sweep(retention).await;
            }
        })
    }
}
