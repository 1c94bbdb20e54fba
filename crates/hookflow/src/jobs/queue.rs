use chrono::Utc;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::jobs::model::{Job, JobError, JobStatus, NewJob};
use crate::jobs::notifier::CompletionNotifier;
use crate::jobs::store::{JobStore, Reclaimed, StatusCounts, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    /// Only the wait is abandoned; the job keeps running.
    #[error("timed out after {}ms waiting for job {job_id}", .waited.as_millis())]
    Timeout { job_id: Uuid, waited: Duration },

    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Handle shared by the HTTP layer, the dispatcher and the worker slots.
///
/// Wraps a [`JobStore`] and adds the two in-process signals the store itself
/// cannot provide: waking idle slots when work appears, and waking submitters
/// when their job reaches a terminal state.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    notifier: CompletionNotifier,
    wake: Arc<Notify>,
    faults: Arc<AtomicU64>,
}

impl JobQueue {
    pub fn new<S: JobStore + 'static>(store: S) -> Self {
        Self::from_store(Arc::new(store))
    }

    pub fn from_store(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            notifier: CompletionNotifier::new(),
            wake: Arc::new(Notify::new()),
            faults: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn notifier(&self) -> &CompletionNotifier {
        &self.notifier
    }

    /// Signalled on enqueue, retry eligibility and stall reclaim.
    pub fn work_available(&self) -> &Notify {
        &self.wake
    }

    // ----------------------------
    // Enqueue
    // ----------------------------

    pub async fn enqueue(&self, job: NewJob) -> Result<Uuid, StoreError> {
        let name = job.name.clone();
        let priority = job.priority;
        let id = self.store.enqueue(job).await?;

        tracing::debug!(job_id = %id, name = %name, priority, "enqueued job");
        self.wake.notify_one();
        Ok(id)
    }

    pub async fn enqueue_now(
        &self,
        name: &str,
        payload: Value,
        priority: i32,
        max_attempts: i32,
    ) -> Result<Uuid, StoreError> {
        self.enqueue(NewJob::now(name, payload, priority, max_attempts))
            .await
    }

    // ----------------------------
    // Claim + claimant mutations
    // ----------------------------

    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<Job>, StoreError> {
        self.store.claim_next(worker_id).await
    }

    pub async fn append_log(
        &self,
        job_id: Uuid,
        worker_id: &str,
        message: &str,
    ) -> Result<(), StoreError> {
        self.store.append_log(job_id, worker_id, message).await
    }

    pub async fn set_progress(
        &self,
        job_id: Uuid,
        worker_id: &str,
        progress: u8,
    ) -> Result<(), StoreError> {
        self.store.set_progress(job_id, worker_id, progress).await
    }

    pub async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result: Value,
    ) -> Result<Job, StoreError> {
        let job = self.store.complete(job_id, worker_id, result).await?;
        self.notifier.notify(&job);
        Ok(job)
    }

    pub async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: JobError,
    ) -> Result<Job, StoreError> {
        let job = self.store.fail(job_id, worker_id, error).await?;
        self.notifier.notify(&job);
        Ok(job)
    }

    /// Requeue a claimed job; it becomes claimable again after `delay`.
    pub async fn retry(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: JobError,
        delay: Duration,
    ) -> Result<(), StoreError> {
        let run_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        self.store.retry(job_id, worker_id, error, run_at).await?;

        if delay.is_zero() {
            self.wake.notify_waiters();
        } else {
            let wake = self.wake.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                wake.notify_waiters();
            });
        }
        Ok(())
    }

    pub async fn reclaim_stalled(&self, visibility: Duration) -> Result<Reclaimed, StoreError> {
        let reclaimed = self.store.reclaim_stalled(visibility).await?;

        for job in &reclaimed.exhausted {
            self.notifier.notify(job);
        }
        if !reclaimed.requeued.is_empty() {
            self.wake.notify_waiters();
        }
        Ok(reclaimed)
    }

    /// Wake idle slots if a `waiting` job is due. Covers backoffs whose local
    /// timer lived in a process that has since exited.
    pub async fn wake_if_due(&self) -> Result<bool, StoreError> {
        let due = self.store.has_due().await?;
        if due {
            self.wake.notify_waiters();
        }
        Ok(due)
    }

    // ----------------------------
    // Reads
    // ----------------------------

    pub async fn get(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        self.store.get(job_id).await
    }

    pub async fn list(
        &self,
        status: Option<JobStatus>,
        limit: i64,
    ) -> Result<Vec<Job>, StoreError> {
        self.store.list(status, limit).await
    }

    pub async fn counts(&self) -> Result<StatusCounts, StoreError> {
        self.store.counts().await
    }

    // ----------------------------
    // Wait bridge
    // ----------------------------

    /// Block until `job_id` is `completed` or `failed`, or until `deadline`
    /// elapses. Subscribes before reading the store, so a job that finishes
    /// between the two steps is still observed exactly once.
    pub async fn await_completion(&self, job_id: Uuid, deadline: Duration) -> Result<Job, WaitError> {
        let mut subscription = self.notifier.subscribe(job_id);

        match self.store.get(job_id).await? {
            None => return Err(WaitError::NotFound(job_id)),
            Some(job) if job.is_terminal() => return Ok(job),
            Some(_) => {}
        }

        match tokio::time::timeout(deadline, subscription.recv()).await {
            Ok(Some(job)) => Ok(job),
            // The sender is only missing when registration hit a poisoned lock.
            Ok(None) => match self.store.get(job_id).await? {
                Some(job) if job.is_terminal() => Ok(job),
                Some(_) => Err(WaitError::Store(StoreError::Poisoned)),
                None => Err(WaitError::NotFound(job_id)),
            },
            Err(_) => Err(WaitError::Timeout {
                job_id,
                waited: deadline,
            }),
        }
    }

    // ----------------------------
    // Faults
    // ----------------------------

    /// Count a violated claim invariant (double completion, lost claim).
    pub fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn faults(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn broken_notifier_is_a_store_error_not_a_timeout() {
        let queue = JobQueue::new(MemoryStore::new());
        let id = queue.enqueue_now("t", json!({}), 0, 1).await.unwrap();
        queue.notifier().poison();

        let started = std::time::Instant::now();
        let err = queue
            .await_completion(id, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, WaitError::Store(StoreError::Poisoned)), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn broken_notifier_still_reports_finished_jobs() {
        let queue = JobQueue::new(MemoryStore::new());
        let id = queue.enqueue_now("t", json!({}), 0, 1).await.unwrap();
        queue.claim_next("slot-0").await.unwrap();
        queue.notifier().poison();
        queue.complete(id, "slot-0", json!(1)).await.unwrap();

        let job = queue
            .await_completion(id, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }
}
