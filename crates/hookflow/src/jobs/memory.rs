use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use crate::jobs::model::{Job, JobError, JobStatus, LogEntry, NewJob};
use crate::jobs::store::{
    chrono_window, clamp_limit, JobStore, Reclaimed, StatusCounts, StoreError,
};

/// (priority desc, arrival asc)
type WaitingKey = (Reverse<i32>, i64, Uuid);

#[derive(Default)]
struct State {
    jobs: HashMap<Uuid, Job>,
    waiting: BTreeSet<WaitingKey>,
    next_seq: i64,
}

impl State {
    fn push_waiting(&mut self, job: &Job) {
        self.waiting.insert((Reverse(job.priority), job.seq, job.id));
    }

    fn claimed_mut(&mut self, job_id: Uuid, worker_id: &str) -> Result<&mut Job, StoreError> {
        let job = self.jobs.get_mut(&job_id).ok_or(StoreError::InvalidState {
            job_id,
            expected: JobStatus::Active,
            actual: None,
        })?;

        if job.status != JobStatus::Active {
            return Err(StoreError::InvalidState {
                job_id,
                expected: JobStatus::Active,
                actual: Some(job.status),
            });
        }
        if job.locked_by.as_deref() != Some(worker_id) {
            return Err(StoreError::ClaimLost {
                job_id,
                worker_id: worker_id.to_string(),
            });
        }
        Ok(job)
    }
}

/// In-process job store. The lock is never held across an `.await`.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }

    fn finish(
        &self,
        job_id: Uuid,
        worker_id: &str,
        outcome: Result<Value, JobError>,
    ) -> Result<Job, StoreError> {
        let mut state = self.lock()?;
        let job = state.claimed_mut(job_id, worker_id)?;
        let now = Utc::now();

        match outcome {
            Ok(result) => {
                job.status = JobStatus::Completed;
                job.result = Some(result);
            }
            Err(error) => {
                job.status = JobStatus::Failed;
                job.error = Some(error);
            }
        }
        job.locked_by = None;
        job.finished_at = Some(now);
        job.updated_at = now;
        Ok(job.clone())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn enqueue(&self, new: NewJob) -> Result<Uuid, StoreError> {
        let mut state = self.lock()?;
        state.next_seq += 1;

        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            seq: state.next_seq,
            name: new.name,
            payload: new.payload,
            priority: new.priority,
            status: JobStatus::Waiting,
            attempts: 0,
            max_attempts: new.max_attempts,
            progress: 0,
            log: Vec::new(),
            result: None,
            error: None,
            last_error: None,
            locked_by: None,
            run_at: new.run_at,
            created_at: now,
            claimed_at: None,
            finished_at: None,
            updated_at: now,
        };

        let id = job.id;
        state.push_waiting(&job);
        state.jobs.insert(id, job);
        Ok(id)
    }

    async fn claim_next(&self, worker_id: &str) -> Result<Option<Job>, StoreError> {
        let mut state = self.lock()?;
        let now = Utc::now();

        let key = state
            .waiting
            .iter()
            .find(|(_, _, id)| state.jobs.get(id).is_some_and(|j| j.run_at <= now))
            .copied();

        let Some(key) = key else {
            return Ok(None);
        };
        state.waiting.remove(&key);

        let job_id = key.2;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| StoreError::Corrupt {
                job_id,
                reason: "waiting index points at a missing job".into(),
            })?;

        job.status = JobStatus::Active;
        job.attempts += 1;
        job.locked_by = Some(worker_id.to_string());
        job.claimed_at = Some(now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn append_log(
        &self,
        job_id: Uuid,
        worker_id: &str,
        message: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let job = state.claimed_mut(job_id, worker_id)?;
        let now = Utc::now();
        job.log.push(LogEntry {
            at: now,
            message: message.to_string(),
        });
        job.updated_at = now;
        Ok(())
    }

    async fn set_progress(
        &self,
        job_id: Uuid,
        worker_id: &str,
        progress: u8,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let job = state.claimed_mut(job_id, worker_id)?;
        job.progress = progress.min(100);
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result: Value,
    ) -> Result<Job, StoreError> {
        self.finish(job_id, worker_id, Ok(result))
    }

    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: JobError,
    ) -> Result<Job, StoreError> {
        self.finish(job_id, worker_id, Err(error))
    }

    async fn retry(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: JobError,
        run_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let job = state.claimed_mut(job_id, worker_id)?;

        job.status = JobStatus::Waiting;
        job.last_error = Some(error);
        job.run_at = run_at;
        job.locked_by = None;
        job.claimed_at = None;
        job.updated_at = Utc::now();

        let job = job.clone();
        state.push_waiting(&job);
        Ok(())
    }

    async fn reclaim_stalled(&self, visibility: Duration) -> Result<Reclaimed, StoreError> {
        let mut state = self.lock()?;
        let now = Utc::now();
        let cutoff = now - chrono_window(visibility);

        let stalled: Vec<Uuid> = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Active)
            .filter(|j| j.claimed_at.is_some_and(|at| at < cutoff))
            .map(|j| j.id)
            .collect();

        let mut out = Reclaimed::default();
        for job_id in stalled {
            let Some(job) = state.jobs.get_mut(&job_id) else {
                continue;
            };

            job.locked_by = None;
            job.updated_at = now;

            if job.attempts >= job.max_attempts {
                job.status = JobStatus::Failed;
                job.error = Some(JobError::max_attempts_exceeded(job.attempts));
                job.finished_at = Some(now);
                out.exhausted.push(job.clone());
            } else {
                job.status = JobStatus::Waiting;
                job.claimed_at = None;
                let job = job.clone();
                state.push_waiting(&job);
                out.requeued.push(job_id);
            }
        }

        Ok(out)
    }

    async fn has_due(&self) -> Result<bool, StoreError> {
        let state = self.lock()?;
        let now = Utc::now();
        Ok(state
            .waiting
            .iter()
            .any(|(_, _, id)| state.jobs.get(id).is_some_and(|j| j.run_at <= now)))
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.lock()?.jobs.get(&job_id).cloned())
    }

    async fn list(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>, StoreError> {
        let state = self.lock()?;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();

        jobs.sort_by(|a, b| b.seq.cmp(&a.seq));
        jobs.truncate(clamp_limit(limit) as usize);
        Ok(jobs)
    }

    async fn counts(&self) -> Result<StatusCounts, StoreError> {
        let state = self.lock()?;
        let mut counts = StatusCounts::default();
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Waiting => counts.waiting += 1,
                JobStatus::Active => counts.active += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}
