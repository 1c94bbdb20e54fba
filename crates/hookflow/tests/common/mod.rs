#![allow(dead_code)]

use axum::{http::StatusCode, routing::post, Json, Router};
use hookflow::downstream::DownstreamClient;
use hookflow::jobs::handlers::webhook_registry;
use hookflow::jobs::{
    Dispatcher, DispatcherConfig, HandlerRegistry, JobQueue, MemoryStore, RetryConfig,
    WorkerPool, WorkerPoolConfig,
};
use serde_json::{json, Value};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// Serve `app` on an ephemeral local port and return its base URL.
pub async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub listener");
    let addr = listener.local_addr().expect("stub local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("stub server");
    });
    format!("http://{addr}")
}

/// Downstream that answers 200 `{"ok":true}`.
pub async fn stub_ok() -> String {
    let url = serve(Router::new().route("/hook", post(|| async { Json(json!({"ok": true})) }))).await;
    format!("{url}/hook")
}

/// Downstream that echoes the request body back.
pub async fn stub_echo() -> String {
    let url = serve(Router::new().route("/hook", post(|Json(body): Json<Value>| async move { Json(body) }))).await;
    format!("{url}/hook")
}

pub async fn stub_status(code: u16) -> String {
    let status = StatusCode::from_u16(code).expect("valid status code");
    let url = serve(Router::new().route("/hook", post(move || async move { status }))).await;
    format!("{url}/hook")
}

/// Downstream that never answers.
pub async fn stub_hang() -> String {
    let url = serve(Router::new().route(
        "/hook",
        post(|| async {
            std::future::pending::<()>().await;
            StatusCode::OK
        }),
    ))
    .await;
    format!("{url}/hook")
}

pub struct Relay {
    pub queue: JobQueue,
    pub slots: JoinSet<()>,
}

pub struct RelayOpts {
    pub call_timeout: Duration,
    pub visibility: Duration,
    pub concurrency: usize,
    pub retry: RetryConfig,
}

impl Default for RelayOpts {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(5),
            visibility: Duration::from_secs(60),
            concurrency: 2,
            retry: fast_retry(),
        }
    }
}

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        base: Duration::from_millis(10),
        max: Duration::from_millis(50),
        jitter_pct: 0.0,
    }
}

/// In-memory queue with a running worker pool relaying to `downstream_url`.
pub fn start_relay(downstream_url: &str, opts: RelayOpts) -> Relay {
    let queue = JobQueue::new(MemoryStore::new());
    let client = DownstreamClient::new(downstream_url, opts.call_timeout).expect("http client");
    let slots = spawn_pool(&queue, webhook_registry(client), &opts);
    Relay { queue, slots }
}

pub fn spawn_pool(queue: &JobQueue, registry: HandlerRegistry, opts: &RelayOpts) -> JoinSet<()> {
    let dispatcher = Dispatcher::new(queue.clone(), DispatcherConfig::new(opts.visibility));
    WorkerPool::new(
        queue.clone(),
        dispatcher,
        Arc::new(registry),
        WorkerPoolConfig {
            worker_id: "test".to_string(),
            concurrency: opts.concurrency,
            retry: opts.retry.clone(),
        },
    )
    .spawn()
}

/// Connect to `TEST_DATABASE_URL`, migrate, and empty the jobs table.
/// `None` when the variable is unset, so Postgres tests can be skipped.
pub async fn setup_db() -> Option<PgPool> {
    let _ = dotenvy::dotenv();

    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set; skipping Postgres test");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("failed to connect to TEST_DATABASE_URL");

    hookflow::db::run_migrations(&pool)
        .await
        .expect("migrations failed");

    sqlx::query("TRUNCATE TABLE jobs RESTART IDENTITY")
        .execute(&pool)
        .await
        .expect("truncate failed");

    Some(pool)
}
