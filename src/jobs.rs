use std::collections::{HashMap, VecDeque};

use tokio::sync::{watch, Mutex, RwLock};

use crate::types::{JobId, JobState, JobStatus};

/// How one task of a job was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Succeeded,
    Failed,
    Cancelled,
}

struct JobEntry {
    status: JobStatus,
    cancel_requested: bool,
    tx: watch::Sender<JobStatus>,
}

/// Aggregate counters for broadcast jobs.
///
/// Counters only move toward the terminal state: `pending` never grows
/// after creation. Finished jobs stay queryable until `retention` newer
/// jobs have finished.
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, JobEntry>>,
    finished: Mutex<VecDeque<JobId>>,
    retention: usize,
}

impl JobRegistry {
    pub fn new(retention: usize) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            finished: Mutex::new(VecDeque::new()),
            retention: retention.max(1),
        }
    }

    /// Register a job with `total` pending tasks.
    pub async fn create(&self, job_id: JobId, total: usize) -> JobStatus {
        let status = JobStatus {
            job_id,
            state: if total == 0 { JobState::Completed } else { JobState::Running },
            total,
            pending: total,
            succeeded: 0,
            failed: 0,
            cancelled: 0,
        };
        let (tx, _rx) = watch::channel(status.clone());
        {
            let mut guard = self.jobs.write().await;
            guard.insert(
                job_id,
                JobEntry {
                    status: status.clone(),
                    cancel_requested: false,
                    tx,
                },
            );
        }
        if total == 0 {
            self.retire(job_id).await;
        }
        status
    }

    /// Record the resolution of one task. Ignored once the job is terminal.
    pub async fn resolve(&self, job_id: JobId, resolution: Resolution) {
        let finished = {
            let mut guard = self.jobs.write().await;
            let Some(entry) = guard.get_mut(&job_id) else { return; };
            if entry.status.pending == 0 {
                return;
            }

            entry.status.pending -= 1;
            match resolution {
                Resolution::Succeeded => entry.status.succeeded += 1,
                Resolution::Failed => entry.status.failed += 1,
                Resolution::Cancelled => entry.status.cancelled += 1,
            }
            if entry.status.pending == 0 && entry.status.state == JobState::Running {
                entry.status.state = JobState::Completed;
            }
            entry.tx.send_replace(entry.status.clone());
            entry.status.pending == 0
        };

        if finished {
            self.retire(job_id).await;
        }
    }

    /// Request cancellation. Returns false for unknown or finished jobs.
    pub async fn cancel(&self, job_id: JobId) -> bool {
        let mut guard = self.jobs.write().await;
        let Some(entry) = guard.get_mut(&job_id) else { return false; };
        if entry.status.pending == 0 || entry.cancel_requested {
            return false;
        }
        entry.cancel_requested = true;
        entry.status.state = JobState::Cancelled;
        entry.tx.send_replace(entry.status.clone());
        true
    }

    pub async fn is_cancelled(&self, job_id: JobId) -> bool {
        let guard = self.jobs.read().await;
        guard.get(&job_id).map(|e| e.cancel_requested).unwrap_or(false)
    }

    pub async fn status(&self, job_id: JobId) -> Option<JobStatus> {
        let guard = self.jobs.read().await;
        guard.get(&job_id).map(|e| e.status.clone())
    }

    pub async fn watch(&self, job_id: JobId) -> Option<watch::Receiver<JobStatus>> {
        let guard = self.jobs.read().await;
        guard.get(&job_id).map(|e| e.tx.subscribe())
    }

    /// Jobs that still have unresolved tasks.
    pub async fn running(&self) -> usize {
        let guard = self.jobs.read().await;
        guard.values().filter(|e| e.status.pending > 0).count()
    }

    async fn retire(&self, job_id: JobId) {
        let evicted: Vec<JobId> = {
            let mut finished = self.finished.lock().await;
            finished.push_back(job_id);
            let mut evicted = Vec::new();
            while finished.len() > self.retention {
                if let Some(old) = finished.pop_front() {
                    evicted.push(old);
                }
            }
            evicted
        };

        if !evicted.is_empty() {
            let mut guard = self.jobs.write().await;
            for id in evicted {
                guard.remove(&id);
            }
        }
    }
}
