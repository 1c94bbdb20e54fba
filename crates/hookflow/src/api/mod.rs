use axum::extract::rejection::JsonRejection;
use axum::extract::DefaultBodyLimit;
use axum::response::Html;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::jobs::error_codes::suggested_action;
use crate::jobs::handlers::{WEBHOOK_HIGH, WEBHOOK_LOW};
use crate::jobs::{Job, JobQueue, JobStatus, Metrics};

pub mod error;
pub mod models;

pub use error::{ApiError, ApiResult};
use models::{ExplainResponse, JobListItem, ListJobsQuery, ListJobsResponse};

pub const HIGH_PRIORITY: i32 = 100;
pub const LOW_PRIORITY: i32 = 1;

#[derive(Clone)]
pub struct ApiState {
    pub queue: JobQueue,
    /// How long a webhook request blocks on its job.
    pub wait_timeout: Duration,
    pub max_attempts: i32,
    pub max_payload_bytes: usize,
}

pub fn router(state: ApiState) -> Router {
    let body_limit = DefaultBodyLimit::max(state.max_payload_bytes);

    Router::new()
        .route("/", get(admin_index))
        // Webhooks
        .route("/webhook/high-priority", post(webhook_high))
        .route("/webhook/low-priority", post(webhook_low))
        // Admin / inspect
        .route("/jobs", get(list_jobs))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/explain", get(explain_job))
        // Metrics
        .route("/metrics", get(metrics))
        .route("/metrics/prom", get(metrics_prom))
        // Health
        .route("/health", get(health))
        .layer(body_limit)
        .with_state(state)
}

// ----------------------------
// Webhooks
// ----------------------------

pub async fn webhook_high(
    State(state): State<ApiState>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    relay_webhook(&state, WEBHOOK_HIGH, HIGH_PRIORITY, body).await
}

pub async fn webhook_low(
    State(state): State<ApiState>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    relay_webhook(&state, WEBHOOK_LOW, LOW_PRIORITY, body).await
}

/// Enqueue the body and block until the job is terminal or the wait expires.
async fn relay_webhook(
    state: &ApiState,
    name: &str,
    priority: i32,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(payload) = body?;

    let job_id = state
        .queue
        .enqueue_now(name, payload, priority, state.max_attempts)
        .await
        .map_err(|e| {
            tracing::error!(name, error = %e, "webhook enqueue failed");
            ApiError::WebhookFailed(e.to_string())
        })?;

    let job = state
        .queue
        .await_completion(job_id, state.wait_timeout)
        .await
        .map_err(|e| {
            tracing::warn!(name, job_id = %job_id, error = %e, "webhook wait failed");
            ApiError::WebhookFailed(e.to_string())
        })?;

    match job.status {
        JobStatus::Completed => Ok(Json(job.result.unwrap_or(Value::Null))),
        _ => {
            let message = job
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| "Unknown error".to_string());
            tracing::warn!(name, job_id = %job_id, %message, "webhook job failed");
            Err(ApiError::WebhookFailed(message))
        }
    }
}

// ----------------------------
// Admin
// ----------------------------

const ADMIN_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8" />
  <meta name="viewport" content="width=device-width, initial-scale=1" />
  <title>hookflow</title>
  <style>
    :root {
      color-scheme: light;
      --bg: #f6f7fb;
      --panel: #ffffff;
      --border: #d7dbe6;
      --text: #1b1f2a;
      --muted: #5b6275;
      --accent: #1f6feb;
    }
    * { box-sizing: border-box; }
    body {
      margin: 0;
      font-family: "Segoe UI", "Helvetica Neue", Arial, sans-serif;
      background: var(--bg);
      color: var(--text);
    }
    header {
      padding: 20px 24px;
      border-bottom: 1px solid var(--border);
      background: var(--panel);
    }
    h1 { margin: 0; font-size: 20px; }
    main {
      padding: 16px 24px 32px;
      display: grid;
      gap: 16px;
      grid-template-columns: repeat(auto-fit, minmax(320px, 1fr));
    }
    section {
      background: var(--panel);
      border: 1px solid var(--border);
      border-radius: 10px;
      padding: 12px 14px;
    }
    h2 { margin: 0 0 8px; font-size: 16px; }
    .muted { color: var(--muted); font-size: 12px; }
    label { display: block; font-size: 12px; margin: 6px 0 4px; }
    input {
      width: 100%;
      padding: 8px;
      border: 1px solid var(--border);
      border-radius: 6px;
    }
    button {
      margin-top: 8px;
      padding: 8px 12px;
      border: 1px solid var(--accent);
      background: var(--accent);
      color: white;
      border-radius: 6px;
      cursor: pointer;
    }
    pre {
      margin: 10px 0 0;
      padding: 10px;
      background: #0f172a;
      color: #e5e7eb;
      border-radius: 8px;
      font-size: 12px;
      overflow: auto;
      min-height: 120px;
    }
  </style>
</head>
<body>
  <header>
    <h1>hookflow</h1>
    <div class="muted">Webhooks: POST /webhook/high-priority, POST /webhook/low-priority. Admin: GET /jobs, /jobs/:id, /jobs/:id/explain, /metrics, /metrics/prom</div>
  </header>
  <main>
    <section>
      <h2>Metrics</h2>
      <div class="muted">Jobs per status, blocked submitters, claim faults.</div>
      <button onclick="show('/metrics', 'metrics-out')">Refresh</button>
      <pre id="metrics-out">{}</pre>
    </section>
    <section>
      <h2>List Jobs</h2>
      <label>Status</label>
      <input id="jobs-status" placeholder="waiting | active | completed | failed" />
      <label>Limit</label>
      <input id="jobs-limit" placeholder="100" />
      <button onclick="listJobs()">Fetch</button>
      <pre id="jobs-out">{}</pre>
    </section>
    <section>
      <h2>Job</h2>
      <label>Job ID</label>
      <input id="job-id" placeholder="uuid" />
      <button onclick="byId('', 'job-out')">Snapshot</button>
      <button onclick="byId('/explain', 'job-out')">Explain</button>
      <pre id="job-out">{}</pre>
    </section>
  </main>
  <script>
    async function show(path, targetId) {
      const res = await fetch(path);
      const txt = await res.text();
      let out = txt;
      try { out = JSON.stringify(JSON.parse(txt), null, 2); } catch (e) {}
      document.getElementById(targetId).textContent = out;
    }

    function listJobs() {
      const params = new URLSearchParams();
      const status = document.getElementById("jobs-status").value.trim();
      const limit = document.getElementById("jobs-limit").value.trim();
      if (status) params.set("status", status);
      if (limit) params.set("limit", limit);
      show("/jobs?" + params.toString(), "jobs-out");
    }

    function byId(suffix, targetId) {
      const id = document.getElementById("job-id").value.trim();
      if (!id) return;
      show("/jobs/" + id + suffix, targetId);
    }
  </script>
</body>
</html>
"#;

pub async fn admin_index() -> Html<&'static str> {
    Html(ADMIN_HTML)
}

pub async fn list_jobs(
    State(state): State<ApiState>,
    Query(q): Query<ListJobsQuery>,
) -> ApiResult<Json<ListJobsResponse>> {
    let status = match q.status.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(s) => Some(s.parse::<JobStatus>().map_err(ApiError::BadRequest)?),
    };

    let jobs = state.queue.list(status, q.limit.unwrap_or(100)).await?;
    Ok(Json(ListJobsResponse {
        items: jobs.iter().map(JobListItem::from).collect(),
    }))
}

async fn find_job(state: &ApiState, id: Uuid) -> ApiResult<Job> {
    state
        .queue
        .get(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job {id} not found")))
}

/// Non-blocking read; works after a webhook caller gave up waiting.
pub async fn get_job(State(state): State<ApiState>, Path(id): Path<Uuid>) -> ApiResult<Json<Job>> {
    Ok(Json(find_job(&state, id).await?))
}

pub async fn explain_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ExplainResponse>> {
    let job = find_job(&state, id).await?;

    let summary = match job.status {
        JobStatus::Completed => format!("Completed after {} attempt(s).", job.attempts.max(1)),
        JobStatus::Failed => format!(
            "Failed after {} attempt(s): {}.",
            job.attempts.max(1),
            job.error
                .as_ref()
                .map(|e| e.code.as_str())
                .unwrap_or("UNKNOWN")
        ),
        JobStatus::Active => format!(
            "Running on {} (attempt {}/{}, {}%).",
            job.locked_by.as_deref().unwrap_or("unknown"),
            job.attempts,
            job.max_attempts,
            job.progress
        ),
        JobStatus::Waiting if job.last_error.is_some() => format!(
            "Retry scheduled. Next run at {}.",
            job.run_at.to_rfc3339()
        ),
        JobStatus::Waiting => "Waiting to run.".to_string(),
    };

    let suggested_action = job
        .error
        .as_ref()
        .or(job.last_error.as_ref())
        .map(|e| suggested_action(e.code).to_string());

    Ok(Json(ExplainResponse {
        job_id: job.id,
        name: job.name,
        status: job.status,
        summary,
        attempts: job.attempts,
        max_attempts: job.max_attempts,
        progress: job.progress,
        error: job.error,
        last_error: job.last_error,
        suggested_action,
    }))
}

pub async fn metrics(State(state): State<ApiState>) -> ApiResult<Json<Metrics>> {
    Ok(Json(Metrics::snapshot(&state.queue).await?))
}

pub async fn metrics_prom(State(state): State<ApiState>) -> Response {
    match Metrics::snapshot(&state.queue).await {
        Ok(m) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            m.render_prometheus(),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics error: {e}"),
        )
            .into_response(),
    }
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
