use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

pub async fn make_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let max_connections = env_u64("HOOKFLOW_DB_MAX_CONNECTIONS")
        .unwrap_or(8)
        .clamp(1, 64) as u32;

    let acquire_timeout_secs = env_u64("HOOKFLOW_DB_ACQUIRE_TIMEOUT_SECS")
        .unwrap_or(10)
        .clamp(1, 60);

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(acquire_timeout_secs))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("SET jit = OFF").execute(&mut *conn).await?;
                Ok(())
            })
        })
        .connect(database_url)
        .await?;

    tracing::debug!(max_connections, acquire_timeout_secs, "database pool ready");
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
