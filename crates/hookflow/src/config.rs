use std::time::Duration;

use crate::jobs::{DispatcherConfig, RetryConfig};

/// Runtime configuration, built once at startup and passed by reference.
///
/// Every option is read from `HOOKFLOW_<NAME>` first, then from the bare
/// `<NAME>`.
#[derive(Clone, Debug)]
pub struct Config {
    /// `None` runs the queue in process memory.
    pub database_url: Option<String>,
    pub downstream_url: String,
    pub worker_id: String,
    pub concurrency: usize,
    pub call_timeout: Duration,
    pub wait_timeout: Duration,
    pub visibility: Duration,
    pub max_attempts: i32,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub host: String,
    pub port: u16,
    pub max_payload_bytes: usize,
    pub migrate_on_startup: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |name: &str| setting(&lookup, name);
        let secs = |name: &str, default: u64| {
            Duration::from_secs(get(name).and_then(|s| s.trim().parse().ok()).unwrap_or(default))
        };

        let database_url = get("DATABASE_URL");

        let downstream_url = get("DOWNSTREAM_URL")
            .or_else(|| get("N8N_WEBHOOK_URL"))
            .ok_or_else(|| anyhow::anyhow!("DOWNSTREAM_URL is missing"))?;

        let worker_id = get("WORKER_ID")
            .or_else(|| lookup("HOSTNAME").filter(|s| !s.trim().is_empty()))
            .unwrap_or_else(|| "worker-1".to_string());

        let concurrency = get("CONCURRENCY")
            .and_then(|s| s.trim().parse::<usize>().ok())
            .unwrap_or(10)
            .max(1);

        let port = get("PORT")
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(3000);

        let max_payload_bytes = get("MAX_PAYLOAD_BYTES")
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(256 * 1024);

        let migrate_on_startup = get("MIGRATE_ON_STARTUP")
            .map(|v| parse_bool(&v))
            .unwrap_or(false);

        let cfg = Self {
            database_url,
            downstream_url,
            worker_id,
            concurrency,
            call_timeout: secs("CALL_TIMEOUT_SECS", 120),
            wait_timeout: secs("WAIT_TIMEOUT_SECS", 120),
            visibility: secs("VISIBILITY_SECS", 150),
            max_attempts: max_attempts(&lookup),
            retry_base: secs("RETRY_BASE_SECS", 1),
            retry_max: secs("RETRY_MAX_SECS", 30),
            host: get("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port,
            max_payload_bytes,
            migrate_on_startup,
        };

        if cfg.visibility <= cfg.call_timeout {
            tracing::warn!(
                visibility_secs = cfg.visibility.as_secs(),
                call_timeout_secs = cfg.call_timeout.as_secs(),
                "visibility window is not longer than the call timeout; slow calls will be reclaimed while still running"
            );
        }

        Ok(cfg)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            base: self.retry_base,
            max: self.retry_max,
            ..RetryConfig::default()
        }
    }

    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig::new(self.visibility)
    }
}

/// `HOOKFLOW_<name>`, else `<name>`; blank values count as unset.
pub fn setting(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(&format!("HOOKFLOW_{name}"))
        .filter(|s| !s.trim().is_empty())
        .or_else(|| lookup(name).filter(|s| !s.trim().is_empty()))
}

/// Attempt budget for new jobs. Shared with `hookflowctl enqueue`.
pub fn max_attempts(lookup: impl Fn(&str) -> Option<String>) -> i32 {
    setting(lookup, "MAX_ATTEMPTS")
        .and_then(|s| s.trim().parse::<i32>().ok())
        .unwrap_or(3)
        .max(1)
}

fn parse_bool(v: &str) -> bool {
    matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
