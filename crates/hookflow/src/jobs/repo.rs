use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgListener;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::jobs::model::{Job, JobError, JobStatus, LogEntry, NewJob};
use crate::jobs::queue::JobQueue;
use crate::jobs::store::{clamp_limit, JobStore, Reclaimed, StatusCounts, StoreError};

/// Carries the id of every job that reached a terminal state.
pub const JOB_FINISHED_CHANNEL: &str = "hookflow_job_finished";
/// Carries the id of every job that became claimable (enqueue, requeue).
pub const JOB_READY_CHANNEL: &str = "hookflow_job_ready";

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    seq: i64,
    name: String,
    payload_json: Value,
    priority: i32,
    status: String,
    attempts: i32,
    max_attempts: i32,
    progress: i16,
    log_json: Json<Vec<LogEntry>>,
    result_json: Option<Value>,
    error_json: Option<Json<JobError>>,
    last_error_json: Option<Json<JobError>>,
    locked_by: Option<String>,
    run_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    claimed_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(|reason| StoreError::Corrupt {
                job_id: row.id,
                reason,
            })?;
        let progress = u8::try_from(row.progress).map_err(|_| StoreError::Corrupt {
            job_id: row.id,
            reason: format!("progress out of range: {}", row.progress),
        })?;

        Ok(Job {
            id: row.id,
            seq: row.seq,
            name: row.name,
            payload: row.payload_json,
            priority: row.priority,
            status,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            progress,
            log: row.log_json.0,
            result: row.result_json,
            error: row.error_json.map(|j| j.0),
            last_error: row.last_error_json.map(|j| j.0),
            locked_by: row.locked_by,
            run_at: row.run_at,
            created_at: row.created_at,
            claimed_at: row.claimed_at,
            finished_at: row.finished_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct JobsRepo {
    pool: PgPool,
}

impl JobsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Explain why a fenced write touched no row.
    async fn rejection(&self, job_id: Uuid, worker_id: &str) -> StoreError {
        let current = sqlx::query_as::<_, (String, Option<String>)>(
            "SELECT status, locked_by FROM jobs WHERE id = $1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await;

        match current {
            Ok(None) => StoreError::InvalidState {
                job_id,
                expected: JobStatus::Active,
                actual: None,
            },
            Ok(Some((status, _))) if status != JobStatus::Active.as_str() => {
                StoreError::InvalidState {
                    job_id,
                    expected: JobStatus::Active,
                    actual: status.parse().ok(),
                }
            }
            Ok(Some(_)) => StoreError::ClaimLost {
                job_id,
                worker_id: worker_id.to_string(),
            },
            Err(e) => StoreError::Database(e),
        }
    }

    /// Terminal transition plus notification, committed together.
    async fn finish(
        &self,
        job_id: Uuid,
        worker_id: &str,
        outcome: Result<Value, JobError>,
    ) -> Result<Job, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = match outcome {
            Ok(result) => {
                sqlx::query_as::<_, JobRow>(
                    r#"
                    UPDATE jobs
                    SET status = 'completed',
                        result_json = $3,
                        locked_by = NULL,
                        finished_at = now(),
                        updated_at = now()
                    WHERE id = $1
                      AND status = 'active'
                      AND locked_by = $2
                    RETURNING *
                    "#,
                )
                .bind(job_id)
                .bind(worker_id)
                .bind(result)
                .fetch_optional(&mut *tx)
                .await?
            }
            Err(error) => {
                sqlx::query_as::<_, JobRow>(
                    r#"
                    UPDATE jobs
                    SET status = 'failed',
                        error_json = $3,
                        locked_by = NULL,
                        finished_at = now(),
                        updated_at = now()
                    WHERE id = $1
                      AND status = 'active'
                      AND locked_by = $2
                    RETURNING *
                    "#,
                )
                .bind(job_id)
                .bind(worker_id)
                .bind(Json(error))
                .fetch_optional(&mut *tx)
                .await?
            }
        };

        let Some(row) = row else {
            tx.rollback().await?;
            return Err(self.rejection(job_id, worker_id).await);
        };

        publish(&mut tx, JOB_FINISHED_CHANNEL, job_id).await?;
        tx.commit().await?;
        Job::try_from(row)
    }

    /// Bridge notifications from other processes into `queue`: ready work
    /// wakes an idle slot, finished jobs wake their local waiters.
    pub async fn spawn_listener(&self, queue: JobQueue) -> Result<JoinHandle<()>, StoreError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener
            .listen_all([JOB_READY_CHANNEL, JOB_FINISHED_CHANNEL])
            .await?;

        let repo = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                let notification = match listener.recv().await {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::warn!(error = %e, "job listener error; reconnecting");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };

                if notification.channel() == JOB_READY_CHANNEL {
                    queue.work_available().notify_one();
                    continue;
                }

                let Ok(job_id) = notification.payload().parse::<Uuid>() else {
                    tracing::warn!(payload = notification.payload(), "bad completion payload");
                    continue;
                };
                if !queue.notifier().is_waiting(job_id) {
                    continue;
                }

                match repo.get(job_id).await {
                    Ok(Some(job)) if job.is_terminal() => {
                        queue.notifier().notify(&job);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(job_id = %job_id, error = %e, "completion lookup failed")
                    }
                }
            }
        }))
    }
}

/// Delivered to listeners when `tx` commits; dropped if it rolls back.
async fn publish(
    tx: &mut Transaction<'_, Postgres>,
    channel: &str,
    job_id: Uuid,
) -> Result<(), StoreError> {
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(channel)
        .bind(job_id.to_string())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[async_trait]
impl JobStore for JobsRepo {
    async fn enqueue(&self, job: NewJob) -> Result<Uuid, StoreError> {
        let mut tx = self.pool.begin().await?;

        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (name, payload_json, priority, max_attempts, run_at, status)
            VALUES ($1, $2, $3, $4, $5, 'waiting')
            RETURNING id
            "#,
        )
        .bind(&job.name)
        .bind(&job.payload)
        .bind(job.priority)
        .bind(job.max_attempts)
        .bind(job.run_at)
        .fetch_one(&mut *tx)
        .await?;

        publish(&mut tx, JOB_READY_CHANNEL, id).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// `FOR UPDATE SKIP LOCKED` keeps concurrent claimers off the same row.
    async fn claim_next(&self, worker_id: &str) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            WITH next AS (
                SELECT id
                FROM jobs
                WHERE status = 'waiting'
                  AND run_at <= now()
                ORDER BY priority DESC, created_at ASC, seq ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            UPDATE jobs j
            SET status = 'active',
                attempts = j.attempts + 1,
                locked_by = $1,
                claimed_at = now(),
                updated_at = now()
            FROM next
            WHERE j.id = next.id
            RETURNING j.*
            "#,
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn append_log(
        &self,
        job_id: Uuid,
        worker_id: &str,
        message: &str,
    ) -> Result<(), StoreError> {
        let entry = Json(vec![LogEntry {
            at: Utc::now(),
            message: message.to_string(),
        }]);

        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET log_json = log_json || $3,
                updated_at = now()
            WHERE id = $1
              AND status = 'active'
              AND locked_by = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(entry)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(self.rejection(job_id, worker_id).await);
        }
        Ok(())
    }

    async fn set_progress(
        &self,
        job_id: Uuid,
        worker_id: &str,
        progress: u8,
    ) -> Result<(), StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET progress = $3,
                updated_at = now()
            WHERE id = $1
              AND status = 'active'
              AND locked_by = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(i16::from(progress.min(100)))
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(self.rejection(job_id, worker_id).await);
        }
        Ok(())
    }

    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result: Value,
    ) -> Result<Job, StoreError> {
        self.finish(job_id, worker_id, Ok(result)).await
    }

    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: JobError,
    ) -> Result<Job, StoreError> {
        self.finish(job_id, worker_id, Err(error)).await
    }

    async fn retry(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: JobError,
        run_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'waiting',
                last_error_json = $3,
                run_at = $4,
                locked_by = NULL,
                claimed_at = NULL,
                updated_at = now()
            WHERE id = $1
              AND status = 'active'
              AND locked_by = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(Json(error))
        .bind(run_at)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(self.rejection(job_id, worker_id).await);
        }
        Ok(())
    }

    async fn reclaim_stalled(&self, visibility: Duration) -> Result<Reclaimed, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Rows mid-commit by their claimant are locked and skipped.
        let stalled = sqlx::query_as::<_, (Uuid, i32, i32)>(
            r#"
            SELECT id, attempts, max_attempts
            FROM jobs
            WHERE status = 'active'
              AND claimed_at < now() - make_interval(secs => $1)
            ORDER BY claimed_at ASC
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(visibility.as_secs_f64())
        .fetch_all(&mut *tx)
        .await?;

        let mut out = Reclaimed::default();
        for (job_id, attempts, max_attempts) in stalled {
            if attempts >= max_attempts {
                let row = sqlx::query_as::<_, JobRow>(
                    r#"
                    UPDATE jobs
                    SET status = 'failed',
                        error_json = $2,
                        locked_by = NULL,
                        finished_at = now(),
                        updated_at = now()
                    WHERE id = $1
                    RETURNING *
                    "#,
                )
                .bind(job_id)
                .bind(Json(JobError::max_attempts_exceeded(attempts)))
                .fetch_one(&mut *tx)
                .await?;

                publish(&mut tx, JOB_FINISHED_CHANNEL, job_id).await?;
                out.exhausted.push(Job::try_from(row)?);
            } else {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET status = 'waiting',
                        locked_by = NULL,
                        claimed_at = NULL,
                        updated_at = now()
                    WHERE id = $1
                    "#,
                )
                .bind(job_id)
                .execute(&mut *tx)
                .await?;

                publish(&mut tx, JOB_READY_CHANNEL, job_id).await?;
                out.requeued.push(job_id);
            }
        }

        tx.commit().await?;
        Ok(out)
    }

    async fn has_due(&self) -> Result<bool, StoreError> {
        let (due,) = sqlx::query_as::<_, (bool,)>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM jobs
                WHERE status = 'waiting' AND run_at <= now()
            )
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(due)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Job::try_from).transpose()
    }

    async fn list(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT *
            FROM jobs
            WHERE ($1::text IS NULL OR status = $1)
            ORDER BY created_at DESC, seq DESC
            LIMIT $2
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .bind(clamp_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn counts(&self) -> Result<StatusCounts, StoreError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM jobs GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            match status.parse::<JobStatus>() {
                Ok(JobStatus::Waiting) => counts.waiting = n,
                Ok(JobStatus::Active) => counts.active = n,
                Ok(JobStatus::Completed) => counts.completed = n,
                Ok(JobStatus::Failed) => counts.failed = n,
                Err(reason) => tracing::warn!(%reason, "ignoring unknown status in counts"),
            }
        }
        Ok(counts)
    }
}
