use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::jobs::queue::JobQueue;
use crate::jobs::store::{StatusCounts, StoreError};

#[derive(Debug, Clone, Serialize)]
pub struct Metrics {
    pub at: DateTime<Utc>,
    pub jobs: StatusCounts,
    /// Runnable backlog: `waiting` jobs, including backed-off retries.
    pub queue_depth: i64,
    /// Job ids with a submitter currently blocked on them in this process.
    pub pending_waits: usize,
    /// Claim invariant violations seen by this process's worker slots.
    pub faults: u64,
}

impl Metrics {
    pub async fn snapshot(queue: &JobQueue) -> Result<Self, StoreError> {
        let jobs = queue.counts().await?;
        Ok(Self {
            at: Utc::now(),
            jobs,
            queue_depth: jobs.waiting,
            pending_waits: queue.notifier().pending(),
            faults: queue.faults(),
        })
    }

    /// Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        format!(
            concat!(
                "# HELP hookflow_queue_depth Number of waiting jobs\n",
                "# TYPE hookflow_queue_depth gauge\n",
                "hookflow_queue_depth {}\n",
                "# HELP hookflow_jobs Jobs by status\n",
                "# TYPE hookflow_jobs gauge\n",
                "hookflow_jobs{{status=\"waiting\"}} {}\n",
                "hookflow_jobs{{status=\"active\"}} {}\n",
                "hookflow_jobs{{status=\"completed\"}} {}\n",
                "hookflow_jobs{{status=\"failed\"}} {}\n",
                "# HELP hookflow_pending_waits Submitters blocked on a job\n",
                "# TYPE hookflow_pending_waits gauge\n",
                "hookflow_pending_waits {}\n",
                "# HELP hookflow_claim_faults_total Claim invariant violations\n",
                "# TYPE hookflow_claim_faults_total counter\n",
                "hookflow_claim_faults_total {}\n"
            ),
            self.queue_depth,
            self.jobs.waiting,
            self.jobs.active,
            self.jobs.completed,
            self.jobs.failed,
            self.pending_waits,
            self.faults
        )
    }
}
