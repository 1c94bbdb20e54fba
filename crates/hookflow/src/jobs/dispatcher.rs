use std::time::Duration;
use tokio::task::JoinHandle;

use crate::jobs::model::Job;
use crate::jobs::queue::JobQueue;
use crate::jobs::store::{Reclaimed, StoreError};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How long a claim may be held before it counts as stalled.
    pub visibility: Duration,
    pub sweep_interval: Duration,
}

impl DispatcherConfig {
    pub fn new(visibility: Duration) -> Self {
        Self {
            visibility,
            sweep_interval: (visibility / 4).max(MIN_SWEEP_INTERVAL),
        }
    }
}

/// Hands eligible jobs to idle worker slots and recovers stalled claims.
#[derive(Clone)]
pub struct Dispatcher {
    queue: JobQueue,
    cfg: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(queue: JobQueue, cfg: DispatcherConfig) -> Self {
        Self { queue, cfg }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.cfg
    }

    /// Wait until a job can be claimed for `worker_id`.
    ///
    /// The wake-up is registered before each claim attempt, so an enqueue that
    /// lands between an empty claim and the wait is not missed.
    pub async fn next_job(&self, worker_id: &str) -> Result<Job, StoreError> {
        let wake = self.queue.work_available();
        loop {
            let notified = wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.queue.claim_next(worker_id).await? {
                tracing::debug!(
                    worker_id,
                    job_id = %job.id,
                    priority = job.priority,
                    attempt = job.attempts,
                    "claimed job"
                );
                return Ok(job);
            }

            notified.await;
        }
    }

    /// One stall sweep over `active` claims older than the visibility window,
    /// then a wake-up for idle slots if any `waiting` job is already due.
    pub async fn sweep(&self) -> Result<Reclaimed, StoreError> {
        let reclaimed = self.queue.reclaim_stalled(self.cfg.visibility).await?;

        for job_id in &reclaimed.requeued {
            tracing::warn!(job_id = %job_id, "stalled claim requeued");
        }
        for job in &reclaimed.exhausted {
            tracing::error!(
                job_id = %job.id,
                attempts = job.attempts,
                "stalled claim failed: attempts exhausted"
            );
        }

        self.queue.wake_if_due().await?;
        Ok(reclaimed)
    }

    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(this.cfg.sweep_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tick.tick().await;
                if let Err(e) = this.sweep().await {
                    tracing::error!(error = %e, "stall sweep failed");
                }
            }
        })
    }
}
