//! Run progress shared between the coordinator, its workers and the
//! monitoring endpoint.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::coordinator::SyncPhase;

/// Terminal state of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "error", rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Still copying.
    Running,
    /// Finished every namespace.
    Done,
    /// Stopped on an error.
    Failed(String),
}

/// Progress of one copy worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerProgress {
    /// Worker index.
    pub worker: usize,
    /// Source replica name.
    pub replica_name: String,
    /// Namespaces fully copied.
    pub namespaces_done: usize,
    /// Namespaces assigned.
    pub namespaces_total: usize,
    /// Documents written to the target.
    pub docs_copied: u64,
    /// Documents skipped as orphans.
    pub docs_skipped: u64,
    /// Namespace currently being copied.
    pub current_ns: Option<String>,
    /// Worker state.
    pub status: WorkerStatus,
}

/// Point-in-time view of the whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Current coordinator phase.
    pub phase: SyncPhase,
    /// Workers ordered by index.
    pub workers: Vec<WorkerProgress>,
    /// Sum of documents copied across workers.
    pub total_docs_copied: u64,
}

#[derive(Debug)]
struct Inner {
    phase: SyncPhase,
    workers: BTreeMap<usize, WorkerProgress>,
}

/// Thread-safe progress registry.
#[derive(Debug)]
pub struct ProgressTracker {
    inner: RwLock<Inner>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    /// Create a tracker in the first phase.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                phase: SyncPhase::DetectTopology,
                workers: BTreeMap::new(),
            }),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record a phase transition.
    pub fn set_phase(&self, phase: SyncPhase) {
        self.write().phase = phase;
    }

    /// Current phase.
    pub fn phase(&self) -> SyncPhase {
        self.read().phase
    }

    /// Register a worker before it starts.
    pub fn register_worker(&self, worker: usize, replica_name: &str, namespaces_total: usize) {
        self.write().workers.insert(
            worker,
            WorkerProgress {
                worker,
                replica_name: replica_name.to_string(),
                namespaces_done: 0,
                namespaces_total,
                docs_copied: 0,
                docs_skipped: 0,
                current_ns: None,
                status: WorkerStatus::Running,
            },
        );
    }

    fn update(&self, worker: usize, f: impl FnOnce(&mut WorkerProgress)) {
        if let Some(w) = self.write().workers.get_mut(&worker) {
            f(w);
        }
    }

    /// A worker started a namespace.
    pub fn start_namespace(&self, worker: usize, ns: &str) {
        self.update(worker, |w| w.current_ns = Some(ns.to_string()));
    }

    /// A worker finished a namespace.
    pub fn finish_namespace(&self, worker: usize) {
        self.update(worker, |w| {
            w.namespaces_done += 1;
            w.current_ns = None;
        });
    }

    /// A worker wrote and skipped documents.
    pub fn add_docs(&self, worker: usize, copied: u64, skipped: u64) {
        self.update(worker, |w| {
            w.docs_copied += copied;
            w.docs_skipped += skipped;
        });
    }

    /// A worker reached its terminal state.
    pub fn finish_worker(&self, worker: usize, status: WorkerStatus) {
        self.update(worker, |w| {
            w.status = status;
            w.current_ns = None;
        });
    }

    /// Current view of the run.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let inner = self.read();
        let workers: Vec<WorkerProgress> = inner.workers.values().cloned().collect();
        let total_docs_copied = workers.iter().map(|w| w.docs_copied).sum();
        ProgressSnapshot {
            phase: inner.phase,
            workers,
            total_docs_copied,
        }
    }
}
