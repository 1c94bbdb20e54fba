use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::jobs::{ErrorCode, Job, JobError, JobStatus};

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobListItem {
    pub id: Uuid,
    pub name: String,
    pub status: JobStatus,
    pub priority: i32,
    pub attempts: i32,
    pub max_attempts: i32,
    pub progress: u8,

    pub error_code: Option<ErrorCode>,
    pub last_error_code: Option<ErrorCode>,

    pub run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&Job> for JobListItem {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            name: job.name.clone(),
            status: job.status,
            priority: job.priority,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            progress: job.progress,
            error_code: job.error.as_ref().map(|e| e.code),
            last_error_code: job.last_error.as_ref().map(|e| e.code),
            run_at: job.run_at,
            created_at: job.created_at,
            finished_at: job.finished_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListJobsResponse {
    pub items: Vec<JobListItem>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExplainResponse {
    pub job_id: Uuid,
    pub name: String,
    pub status: JobStatus,
    pub summary: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub progress: u8,
    pub error: Option<JobError>,
    pub last_error: Option<JobError>,
    pub suggested_action: Option<String>,
}
