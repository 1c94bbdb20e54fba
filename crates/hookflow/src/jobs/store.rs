use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::jobs::model::{Job, JobError, JobStatus, NewJob};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The job is missing or not in the status the operation needs.
    #[error("job {job_id} is {}, expected {expected}", status_label(.actual))]
    InvalidState {
        job_id: Uuid,
        expected: JobStatus,
        actual: Option<JobStatus>,
    },

    /// The job is `active` but another worker slot holds the claim.
    #[error("job {job_id} is not claimed by {worker_id}")]
    ClaimLost { job_id: Uuid, worker_id: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt job row {job_id}: {reason}")]
    Corrupt { job_id: Uuid, reason: String },

    #[error("job store lock poisoned")]
    Poisoned,
}

impl StoreError {
    pub fn is_invalid_state(&self) -> bool {
        matches!(
            self,
            StoreError::InvalidState { .. } | StoreError::ClaimLost { .. }
        )
    }
}

/// Outcome of one stall sweep.
#[derive(Debug, Default)]
pub struct Reclaimed {
    /// Jobs returned to `waiting`.
    pub requeued: Vec<Uuid>,
    /// Jobs that ran out of attempts and were failed with `MAX_ATTEMPTS_EXCEEDED`.
    pub exhausted: Vec<Job>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub waiting: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
}

/// Durable, ordered container of jobs.
///
/// Worker-scoped mutations take the claimant's slot id. A slot that no longer
/// holds the claim gets `StoreError::ClaimLost`; a call on a job that is not
/// `active` gets `StoreError::InvalidState`. Both report `is_invalid_state()`.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn enqueue(&self, job: NewJob) -> Result<Uuid, StoreError>;

    /// Claim the highest-priority, oldest eligible `waiting` job. Never blocks
    /// waiting for work; returns `None` when nothing is eligible.
    async fn claim_next(&self, worker_id: &str) -> Result<Option<Job>, StoreError>;

    async fn append_log(
        &self,
        job_id: Uuid,
        worker_id: &str,
        message: &str,
    ) -> Result<(), StoreError>;

    async fn set_progress(
        &self,
        job_id: Uuid,
        worker_id: &str,
        progress: u8,
    ) -> Result<(), StoreError>;

    async fn complete(&self, job_id: Uuid, worker_id: &str, result: Value)
        -> Result<Job, StoreError>;

    async fn fail(&self, job_id: Uuid, worker_id: &str, error: JobError)
        -> Result<Job, StoreError>;

    /// Put an `active` job back to `waiting`, eligible again at `run_at`.
    async fn retry(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: JobError,
        run_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Requeue `active` jobs claimed longer than `visibility` ago, or fail them
    /// with `MAX_ATTEMPTS_EXCEEDED` once their attempt budget is spent.
    async fn reclaim_stalled(&self, visibility: Duration) -> Result<Reclaimed, StoreError>;

    /// Is any `waiting` job eligible to run now?
    async fn has_due(&self) -> Result<bool, StoreError>;

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Newest first. `limit` is clamped to [1, 500].
    async fn list(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>, StoreError>;

    async fn counts(&self) -> Result<StatusCounts, StoreError>;
}

fn status_label(status: &Option<JobStatus>) -> &'static str {
    status.as_ref().map(JobStatus::as_str).unwrap_or("missing")
}

pub(crate) fn clamp_limit(limit: i64) -> i64 {
    limit.clamp(1, 500)
}

pub(crate) fn chrono_window(visibility: Duration) -> chrono::Duration {
    chrono::Duration::from_std(visibility).unwrap_or_else(|_| chrono::Duration::days(365))
}
