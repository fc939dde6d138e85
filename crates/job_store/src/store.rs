//! Concurrent in-memory job store with bounded retention.
//!
//! Backed by a DashMap: reads are shared and return value copies, status
//! transitions hold the entry's exclusive lock only for the affected id.
//! A background sweeper keeps memory bounded (see [`JobStore::sweep`]).

use crate::error::{Error, Result};
use crate::job::{JobRecord, JobStatus};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Fallback cap when constructed with zero.
pub const DEFAULT_MAX_JOBS: usize = 1_000;

/// How long terminal records are retained before the sweeper drops them.
pub const DEFAULT_RETENTION_HOURS: i64 = 24;

/// Sweeper period.
const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(3600);

/// Thread-safe store of job records keyed by job id.
#[derive(Debug, Clone)]
pub struct JobStore {
    inner: Arc<JobStoreInner>,
}

#[derive(Debug)]
struct JobStoreInner {
    jobs: DashMap<String, JobRecord>,
    max_jobs: usize,
    retention: Duration,
}

impl JobStore {
    /// Create a store holding at most `max_jobs` records, keeping terminal
    /// records for `retention` before the sweeper reclaims them.
    pub fn new(max_jobs: usize, retention: Duration) -> Self {
        let max_jobs = if max_jobs == 0 {
            DEFAULT_MAX_JOBS
        } else {
            max_jobs
        };

        Self {
            inner: Arc::new(JobStoreInner {
                jobs: DashMap::new(),
                max_jobs,
                retention,
            }),
        }
    }

    /// Insert or overwrite a record by job id. Records without an id are
    /// ignored.
    pub fn add(&self, record: JobRecord) {
        if record.job_id.is_empty() {
            return;
        }
        self.inner.jobs.insert(record.job_id.clone(), record);
    }

    /// Fetch a copy of a record.
    pub fn get(&self, job_id: &str) -> Result<JobRecord> {
        self.inner
            .jobs
            .get(job_id)
            .map(|entry| entry.clone())
            .ok_or(Error::NotFound)
    }

    /// Transition a job's status, validating against the state machine.
    ///
    /// On entry to `Processing` the started-at timestamp is set if unset; on
    /// entry to any terminal status the completed-at timestamp is set.
    pub fn update_status(&self, job_id: &str, status: JobStatus, message: &str) -> Result<()> {
        self.update_status_with(job_id, status, message, None, None)
    }

    /// Like [`update_status`](Self::update_status), but lets the caller
    /// supply worker-reported timestamps. They are applied in the same
    /// exclusive section as the transition itself, and only where unset:
    /// started-at is write-once and terminal records are immutable.
    pub fn update_status_with(
        &self,
        job_id: &str,
        status: JobStatus,
        message: &str,
        started_at: Option<DateTime<Utc>>,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut entry = self.inner.jobs.get_mut(job_id).ok_or(Error::NotFound)?;

        let current = entry.status;
        if !current.can_transition_to(status) {
            return Err(Error::InvalidTransition {
                from: current,
                to: status,
            });
        }

        entry.status = status;
        entry.message = message.to_string();

        if let Some(ts) = started_at {
            if entry.started_at.is_none() {
                entry.started_at = Some(ts);
            }
        }
        if status == JobStatus::Processing && entry.started_at.is_none() {
            entry.started_at = Some(Utc::now());
        }
        if status.is_terminal() {
            entry.completed_at = Some(ended_at.unwrap_or_else(Utc::now));
        }

        Ok(())
    }

    /// All jobs belonging to a user. Consistency is per record, not across
    /// the list.
    pub fn list_by_owner(&self, user_id: &str) -> Vec<JobRecord> {
        self.inner
            .jobs
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .map(|entry| entry.clone())
            .collect()
    }

    /// All jobs currently in the given status.
    pub fn list_by_status(&self, status: JobStatus) -> Vec<JobRecord> {
        self.inner
            .jobs
            .iter()
            .filter(|entry| entry.status == status)
            .map(|entry| entry.clone())
            .collect()
    }

    /// Remove a record.
    pub fn delete(&self, job_id: &str) {
        self.inner.jobs.remove(job_id);
    }

    /// Number of records in the store.
    pub fn count(&self) -> usize {
        self.inner.jobs.len()
    }

    /// Reclaim memory. First pass removes terminal records whose completion
    /// is older than the retention window; if the store still exceeds the
    /// cap, a second pass evicts the oldest records by submission time
    /// regardless of status.
    pub fn sweep(&self, now: DateTime<Utc>) {
        let before = self.count();
        let retention = self.inner.retention;

        self.inner.jobs.retain(|_, job| {
            !(job.status.is_terminal()
                && job
                    .completed_at
                    .is_some_and(|completed| now - completed > retention))
        });

        let count = self.count();
        if count > self.inner.max_jobs {
            let mut by_age: Vec<(String, DateTime<Utc>)> = self
                .inner
                .jobs
                .iter()
                .map(|entry| (entry.job_id.clone(), entry.submitted_at))
                .collect();
            by_age.sort_by_key(|(_, submitted)| *submitted);

            for (job_id, _) in by_age.iter().take(count - self.inner.max_jobs) {
                self.inner.jobs.remove(job_id);
            }
        }

        let removed = before.saturating_sub(self.count());
        if removed > 0 {
            info!("job sweep removed {} records, {} remain", removed, self.count());
        } else {
            debug!("job sweep removed nothing, {} records", self.count());
        }
    }

    /// Spawn the hourly sweeper task. It stops when `shutdown_rx` yields.
    pub fn spawn_sweeper(&self, mut shutdown_rx: mpsc::Receiver<()>) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            // The first tick fires immediately; skip it.
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.recv() => {
                        debug!("job store sweeper shutting down");
                        break;
                    }

                    _ = ticker.tick() => {
                        store.sweep(Utc::now());
                    }
                }
            }
        })
    }
}
