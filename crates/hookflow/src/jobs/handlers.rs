use serde_json::Value;
use std::{collections::HashMap, pin::Pin, sync::Arc};
use uuid::Uuid;

use crate::downstream::DownstreamClient;
use crate::jobs::model::{Job, JobError};
use crate::jobs::queue::JobQueue;

pub const WEBHOOK_HIGH: &str = "webhook-high";
pub const WEBHOOK_LOW: &str = "webhook-low";

pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
type HandlerFn = dyn Fn(Job, JobContext) -> BoxFuture<'static, Result<Value, JobError>> + Send + Sync;

/// What a running handler may touch: its own job's log and progress, fenced
/// by the slot that holds the claim.
#[derive(Clone)]
pub struct JobContext {
    queue: JobQueue,
    job_id: Uuid,
    worker_id: String,
}

impl JobContext {
    pub fn new(queue: JobQueue, job_id: Uuid, worker_id: impl Into<String>) -> Self {
        Self {
            queue,
            job_id,
            worker_id: worker_id.into(),
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Progress and log writes are advisory; a failed write is logged, not
    /// returned to the handler.
    pub async fn log(&self, message: impl AsRef<str>) {
        if let Err(e) = self
            .queue
            .append_log(self.job_id, &self.worker_id, message.as_ref())
            .await
        {
            tracing::warn!(job_id = %self.job_id, worker_id = %self.worker_id, error = %e, "job log write failed");
        }
    }

    pub async fn progress(&self, pct: u8) {
        if let Err(e) = self
            .queue
            .set_progress(self.job_id, &self.worker_id, pct)
            .await
        {
            tracing::warn!(job_id = %self.job_id, worker_id = %self.worker_id, error = %e, "job progress write failed");
        }
    }
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<HandlerFn>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(Job, JobContext) -> BoxFuture<'static, Result<Value, JobError>>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(name.to_string(), Arc::new(handler));
    }

    pub fn handler_for(&self, name: &str) -> Option<Arc<HandlerFn>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

pub fn boxed<'a, T>(fut: impl std::future::Future<Output = T> + Send + 'a) -> BoxFuture<'a, T> {
    Box::pin(fut)
}

/// Handler that relays the job payload to the downstream endpoint and returns
/// its parsed response body as the job result.
pub fn relay_handler(
    client: DownstreamClient,
) -> impl Fn(Job, JobContext) -> BoxFuture<'static, Result<Value, JobError>> + Send + Sync + 'static
{
    let client = Arc::new(client);
    move |job, ctx| {
        let client = client.clone();
        boxed(async move { relay(&client, &job, &ctx).await })
    }
}

async fn relay(client: &DownstreamClient, job: &Job, ctx: &JobContext) -> Result<Value, JobError> {
    tracing::debug!(
        job_id = %ctx.job_id(),
        worker_id = ctx.worker_id(),
        url = client.url(),
        timeout_ms = client.timeout().as_millis() as u64,
        "relaying job payload"
    );
    ctx.log(format!("Sending data to downstream: {}", client.url()))
        .await;
    ctx.progress(30).await;

    let res = client.call(&job.payload).await;
    ctx.progress(70).await;

    let response = res?;
    ctx.log(format!(
        "Received response from downstream with status {}",
        response.status
    ))
    .await;
    ctx.progress(90).await;

    Ok(response.body)
}

/// Registry serving both webhook routes with the same relay handler.
pub fn webhook_registry(client: DownstreamClient) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(WEBHOOK_HIGH, relay_handler(client.clone()));
    registry.register(WEBHOOK_LOW, relay_handler(client));
    registry
}
