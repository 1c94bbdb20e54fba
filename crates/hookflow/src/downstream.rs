//! Outbound call executor: one timeout-bounded POST of a job payload to the
//! configured downstream URL.

use serde_json::Value;
use std::error::Error as _;
use std::time::Duration;

use crate::jobs::error_codes::ErrorCode;
use crate::jobs::model::JobError;

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("downstream responded with status {status_code}: {status_text}")]
    Downstream { status_code: u16, status_text: String },

    #[error("downstream call timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("failed to call downstream: {0}")]
    Transport(String),
}

impl From<CallError> for JobError {
    fn from(err: CallError) -> Self {
        let message = err.to_string();
        match err {
            CallError::Downstream {
                status_code,
                status_text,
            } => JobError::downstream(status_code, status_text),
            CallError::Timeout(_) => JobError::new(ErrorCode::Timeout, message),
            CallError::Transport(_) => JobError::new(ErrorCode::TransportError, message),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownstreamResponse {
    pub status: u16,
    pub body: Value,
}

#[derive(Debug, Clone)]
pub struct DownstreamClient {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl DownstreamClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, CallError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| CallError::Transport(error_chain(&e)))?;
        Ok(Self::with_client(client, url, timeout))
    }

    pub fn with_client(client: reqwest::Client, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            url: url.into(),
            timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn call(&self, payload: &Value) -> Result<DownstreamResponse, CallError> {
        // Dropping the in-flight future on expiry aborts the request and
        // closes its connection.
        match tokio::time::timeout(self.timeout, self.send(payload)).await {
            Ok(res) => res,
            Err(_) => {
                tracing::warn!(
                    url = %self.url,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "downstream call timed out"
                );
                Err(CallError::Timeout(self.timeout))
            }
        }
    }

    async fn send(&self, payload: &Value) -> Result<DownstreamResponse, CallError> {
        let response = self
            .client
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .map_err(|e| CallError::Transport(error_chain(&e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CallError::Downstream {
                status_code: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or("").to_string(),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| CallError::Transport(error_chain(&e)))?;

        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .map_err(|e| CallError::Transport(format!("malformed response body: {e}")))?
        };

        tracing::debug!(url = %self.url, status = status.as_u16(), "downstream responded");
        Ok(DownstreamResponse {
            status: status.as_u16(),
            body,
        })
    }
}

/// reqwest's top-level message hides the interesting part (DNS, refused, reset).
fn error_chain(err: &reqwest::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
