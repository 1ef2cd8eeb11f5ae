//! In-flight execution registry

use chrono::{DateTime, Utc};
use geoforge_common::metrics;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionEntry {
    pub execution_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub pid: Option<u32>,
    pub timeout_ms: u64,
}

#[derive(Debug, Default)]
pub struct ExecutionRegistry {
    inner: Mutex<HashMap<Uuid, ExecutionEntry>>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, ExecutionEntry>> {
        // Entries are plain data; a poisoned map is still consistent
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an execution; the entry is removed when the guard drops
    pub fn register(self: &Arc<Self>, execution_id: Uuid, timeout_ms: u64) -> RegistryGuard {
        let mut entries = self.lock();
        entries.insert(
            execution_id,
            ExecutionEntry {
                execution_id,
                started_at: Utc::now(),
                pid: None,
                timeout_ms,
            },
        );
        metrics::set_sandbox_in_flight(entries.len());
        RegistryGuard {
            registry: Arc::clone(self),
            execution_id,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn get(&self, execution_id: Uuid) -> Option<ExecutionEntry> {
        self.lock().get(&execution_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<ExecutionEntry> {
        let mut entries: Vec<ExecutionEntry> = self.lock().values().cloned().collect();
        entries.sort_by_key(|e| e.started_at);
        entries
    }
}

pub struct RegistryGuard {
    registry: Arc<ExecutionRegistry>,
    execution_id: Uuid,
}

impl RegistryGuard {
    pub fn set_pid(&self, pid: u32) {
        if let Some(entry) = self.registry.lock().get_mut(&self.execution_id) {
            entry.pid = Some(pid);
        }
    }
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        let mut entries = self.registry.lock();
        entries.remove(&self.execution_id);
        metrics::set_sandbox_in_flight(entries.len());
    }
}
