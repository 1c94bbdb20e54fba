use hookflow::api;
use hookflow::config::Config;
use hookflow::db;
use hookflow::downstream::DownstreamClient;
use hookflow::jobs::handlers::webhook_registry;
use hookflow::jobs::{
    Dispatcher, JobQueue, JobsRepo, MemoryStore, WorkerPool, WorkerPoolConfig,
};

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hookflow=info,worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = Config::from_env()?;

    tracing::info!(
        worker_id = %cfg.worker_id,
        concurrency = cfg.concurrency,
        call_timeout_secs = cfg.call_timeout.as_secs(),
        wait_timeout_secs = cfg.wait_timeout.as_secs(),
        visibility_secs = cfg.visibility.as_secs(),
        max_attempts = cfg.max_attempts,
        store = if cfg.database_url.is_some() { "postgres" } else { "memory" },
        downstream = %cfg.downstream_url,
        "hookflow starting"
    );

    // ---- Store ----
    let (queue, listener) = match &cfg.database_url {
        Some(url) => {
            let pool = db::make_pool(url).await?;
            if cfg.migrate_on_startup {
                db::run_migrations(&pool).await?;
            }
            let repo = JobsRepo::new(pool);
            let queue = JobQueue::new(repo.clone());
            let listener = repo.spawn_listener(queue.clone()).await?;
            (queue, Some(listener))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; jobs live in process memory and are lost on restart");
            (JobQueue::new(MemoryStore::new()), None)
        }
    };

    // ---- Dispatcher + worker slots ----
    let client = DownstreamClient::new(cfg.downstream_url.clone(), cfg.call_timeout)?;
    let registry = Arc::new(webhook_registry(client));
    tracing::info!(handlers = ?registry.names(), "job handlers registered");

    let dispatcher = Dispatcher::new(queue.clone(), cfg.dispatcher());
    let sweeper = dispatcher.spawn_sweeper();

    let mut slots = WorkerPool::new(
        queue.clone(),
        dispatcher,
        registry,
        WorkerPoolConfig {
            worker_id: cfg.worker_id.clone(),
            concurrency: cfg.concurrency,
            retry: cfg.retry(),
        },
    )
    .spawn();

    // ---- HTTP ----
    let app = api::router(api::ApiState {
        queue,
        wait_timeout: cfg.wait_timeout,
        max_attempts: cfg.max_attempts,
        max_payload_bytes: cfg.max_payload_bytes,
    });
    let addr = cfg.listen_addr();

    let api_handle = tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!("listening on http://{addr}");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        Ok::<(), anyhow::Error>(())
    });

    let listener = async move {
        match listener {
            Some(handle) => handle.await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        res = api_handle => res??,
        res = sweeper => anyhow::bail!("stall sweeper stopped: {res:?}"),
        res = listener => anyhow::bail!("job listener stopped: {res:?}"),
        Some(res) = slots.join_next() => anyhow::bail!("worker slot stopped: {res:?}"),
    }

    // Jobs still active are picked up again by the stall sweep.
    slots.abort_all();
    tracing::info!("hookflow stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
