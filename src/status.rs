//! Process-wide pipeline status tracking.
//!
//! The coordinator is an explicitly constructed object, created exactly once
//! during [`Rag::initialize`](crate::rag::Rag::initialize) and passed to the
//! ingestion and query paths. All mutation goes through its internal mutex;
//! jobs are tracked with RAII guards so a cancelled or panicking task can
//! never leave the coordinator stuck on busy.

use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

/// Point-in-time view of the ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStatus {
    /// True while any job is in flight.
    pub busy: bool,
    /// The oldest still-running job, if any.
    pub current_job: Option<Uuid>,
    /// In-flight jobs beyond the current one.
    pub queued_jobs: usize,
}

/// Terminal state of a job, recorded when its guard is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed,
    /// The guard was dropped without an explicit outcome (task cancelled or
    /// panicked).
    Aborted,
}

#[derive(Default)]
struct StatusInner {
    active: Vec<Uuid>,
    completed: u64,
    failed: u64,
    aborted: u64,
}

/// Serializes status mutation for concurrent ingestion jobs and query turns.
#[derive(Clone)]
pub struct PipelineStatusCoordinator {
    inner: Arc<Mutex<StatusInner>>,
}

impl PipelineStatusCoordinator {
    /// Constructs the coordinator. Called once, before the first ingestion
    /// or query; operations reached without one fail with `NotInitialized`.
    pub fn initialize() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StatusInner::default())),
        }
    }

    /// Registers a new in-flight job and returns its guard.
    pub fn begin_job(&self, label: &str) -> JobGuard {
        let id = Uuid::new_v4();
        {
            let mut inner = self.inner.lock();
            inner.active.push(id);
        }
        tracing::debug!(job = %id, label, "job started");
        JobGuard {
            id,
            coordinator: self.clone(),
            outcome: None,
        }
    }

    /// Current pipeline status.
    pub fn snapshot(&self) -> PipelineStatus {
        let inner = self.inner.lock();
        PipelineStatus {
            busy: !inner.active.is_empty(),
            current_job: inner.active.first().copied(),
            queued_jobs: inner.active.len().saturating_sub(1),
        }
    }

    /// (completed, failed, aborted) counts since initialization.
    pub fn totals(&self) -> (u64, u64, u64) {
        let inner = self.inner.lock();
        (inner.completed, inner.failed, inner.aborted)
    }

    fn end_job(&self, id: Uuid, outcome: JobOutcome) {
        let mut inner = self.inner.lock();
        inner.active.retain(|active| *active != id);
        match outcome {
            JobOutcome::Completed => inner.completed += 1,
            JobOutcome::Failed => inner.failed += 1,
            JobOutcome::Aborted => inner.aborted += 1,
        }
        tracing::debug!(job = %id, ?outcome, "job ended");
    }
}

/// RAII handle for one in-flight job.
///
/// Dropping the guard without calling [`finish`](Self::finish) records the
/// job as aborted and always clears it from the active set.
pub struct JobGuard {
    id: Uuid,
    coordinator: PipelineStatusCoordinator,
    outcome: Option<JobOutcome>,
}

impl JobGuard {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Records the job's terminal outcome.
    pub fn finish(mut self, outcome: JobOutcome) {
        self.outcome = Some(outcome);
        // Drop does the bookkeeping.
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        let outcome = self.outcome.take().unwrap_or(JobOutcome::Aborted);
        self.coordinator.end_job(self.id, outcome);
    }
}
