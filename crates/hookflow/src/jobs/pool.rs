use rand::{rngs::StdRng, SeedableRng};
use serde_json::Value;
use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::jobs::dispatcher::Dispatcher;
use crate::jobs::error_codes::ErrorCode;
use crate::jobs::handlers::{HandlerRegistry, JobContext};
use crate::jobs::model::{Job, JobError};
use crate::jobs::queue::JobQueue;
use crate::jobs::retry::{next_delay, should_retry, RetryConfig};
use crate::jobs::store::StoreError;

const CLAIM_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub worker_id: String,
    pub concurrency: usize,
    pub retry: RetryConfig,
}

/// What one slot did with one claimed job.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotOutcome {
    Completed,
    Retrying { delay: Duration },
    Failed { code: ErrorCode },
    /// A store write failed; the claim is left to its holder or the stall sweep.
    Abandoned,
}

/// Fixed set of `concurrency` slots, each running one job at a time.
pub struct WorkerPool {
    queue: JobQueue,
    dispatcher: Dispatcher,
    registry: Arc<HandlerRegistry>,
    cfg: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(
        queue: JobQueue,
        dispatcher: Dispatcher,
        registry: Arc<HandlerRegistry>,
        cfg: WorkerPoolConfig,
    ) -> Self {
        Self {
            queue,
            dispatcher,
            registry,
            cfg,
        }
    }

    pub fn slot_id(&self, n: usize) -> String {
        format!("{}-slot-{}", self.cfg.worker_id, n)
    }

    /// Start every slot. Slots run until the returned set is dropped or aborted.
    pub fn spawn(self) -> JoinSet<()> {
        let concurrency = self.cfg.concurrency.max(1);
        let pool = Arc::new(self);
        let mut slots = JoinSet::new();

        for n in 0..concurrency {
            let pool = pool.clone();
            let slot_id = pool.slot_id(n);
            slots.spawn(async move { pool.run_slot(slot_id).await });
        }

        tracing::info!(
            worker_id = %pool.cfg.worker_id,
            concurrency,
            "worker pool started"
        );
        slots
    }

    async fn run_slot(&self, slot_id: String) {
        loop {
            match self.dispatcher.next_job(&slot_id).await {
                Ok(job) => {
                    let job_id = job.id;
                    let outcome = self.process(job, &slot_id).await;
                    tracing::debug!(job_id = %job_id, worker_id = %slot_id, ?outcome, "slot free");
                }
                Err(e) => {
                    tracing::error!(worker_id = %slot_id, error = %e, "claim failed");
                    tokio::time::sleep(CLAIM_ERROR_BACKOFF).await;
                }
            }
        }
    }

    /// Run one claimed job end to end and commit its outcome.
    pub async fn process(&self, job: Job, slot_id: &str) -> SlotOutcome {
        let job_id = job.id;
        let started = Instant::now();

        let opening = format!(
            "Processing webhook job {} with priority {} (attempt {}/{})",
            job_id, job.priority, job.attempts, job.max_attempts
        );
        if let Err(e) = self.queue.append_log(job_id, slot_id, &opening).await {
            return self.report(job_id, slot_id, "append_log", e);
        }
        if let Err(e) = self.queue.set_progress(job_id, slot_id, 10).await {
            return self.report(job_id, slot_id, "set_progress", e);
        }

        let attempts = job.attempts;
        let max_attempts = job.max_attempts;
        let result = self.run_handler(job, slot_id).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(value) => self.commit_success(job_id, slot_id, value, latency_ms).await,
            Err(err) => {
                self.commit_failure(job_id, slot_id, err, attempts, max_attempts, latency_ms)
                    .await
            }
        }
    }

    async fn run_handler(&self, job: Job, slot_id: &str) -> Result<Value, JobError> {
        let Some(handler) = self.registry.handler_for(&job.name) else {
            return Err(JobError::new(
                ErrorCode::UnknownJobType,
                format!("no handler for job name={}", job.name),
            ));
        };

        let ctx = JobContext::new(self.queue.clone(), job.id, slot_id);
        match tokio::spawn(handler(job, ctx)).await {
            Ok(res) => res,
            Err(join) if join.is_panic() => Err(JobError::new(
                ErrorCode::HandlerPanic,
                format!("handler panicked: {}", panic_message(join.into_panic())),
            )),
            Err(join) => Err(JobError::new(
                ErrorCode::HandlerPanic,
                format!("handler task aborted: {join}"),
            )),
        }
    }

    async fn commit_success(
        &self,
        job_id: Uuid,
        slot_id: &str,
        value: Value,
        latency_ms: u64,
    ) -> SlotOutcome {
        let done = format!("Successfully processed webhook job {job_id}");
        if let Err(e) = self.queue.append_log(job_id, slot_id, &done).await {
            return self.report(job_id, slot_id, "append_log", e);
        }
        if let Err(e) = self.queue.set_progress(job_id, slot_id, 100).await {
            return self.report(job_id, slot_id, "set_progress", e);
        }

        match self.queue.complete(job_id, slot_id, value).await {
            Ok(_) => {
                tracing::info!(job_id = %job_id, worker_id = slot_id, latency_ms, "job completed");
                SlotOutcome::Completed
            }
            Err(e) => self.report(job_id, slot_id, "complete", e),
        }
    }

    async fn commit_failure(
        &self,
        job_id: Uuid,
        slot_id: &str,
        err: JobError,
        attempts: i32,
        max_attempts: i32,
        latency_ms: u64,
    ) -> SlotOutcome {
        let line = format!("Error processing webhook job {job_id}: {}", err.message);
        if let Err(e) = self.queue.append_log(job_id, slot_id, &line).await {
            return self.report(job_id, slot_id, "append_log", e);
        }

        let code = err.code;
        if should_retry(code, attempts, max_attempts) {
            let delay = next_delay(attempts, &self.cfg.retry, &mut StdRng::from_entropy());
            return match self.queue.retry(job_id, slot_id, err, delay).await {
                Ok(()) => {
                    tracing::warn!(
                        job_id = %job_id,
                        worker_id = slot_id,
                        code = %code,
                        attempt = attempts,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "job attempt failed, retrying"
                    );
                    SlotOutcome::Retrying { delay }
                }
                Err(e) => self.report(job_id, slot_id, "retry", e),
            };
        }

        match self.queue.fail(job_id, slot_id, err).await {
            Ok(job) => {
                tracing::warn!(
                    job_id = %job_id,
                    worker_id = slot_id,
                    code = %code,
                    attempt = job.attempts,
                    latency_ms,
                    "job failed"
                );
                SlotOutcome::Failed { code }
            }
            Err(e) => self.report(job_id, slot_id, "fail", e),
        }
    }

    fn report(&self, job_id: Uuid, slot_id: &str, op: &str, err: StoreError) -> SlotOutcome {
        if err.is_invalid_state() {
            self.queue.record_fault();
            tracing::error!(
                job_id = %job_id,
                worker_id = slot_id,
                op,
                error = %err,
                "claim invariant violated; dropping job from this slot"
            );
        } else {
            tracing::error!(
                job_id = %job_id,
                worker_id = slot_id,
                op,
                error = %err,
                "job store write failed; claim left to the stall sweep"
            );
        }
        SlotOutcome::Abandoned
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
