// crates/hookflow/src/jobs/error_codes.rs
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    DownstreamError,
    Timeout,
    TransportError,
    MaxAttemptsExceeded,
    UnknownJobType,
    HandlerPanic,
    /// A code written by a newer build that this one does not know.
    #[serde(other)]
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DownstreamError => "DOWNSTREAM_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::TransportError => "TRANSPORT_ERROR",
            Self::MaxAttemptsExceeded => "MAX_ATTEMPTS_EXCEEDED",
            Self::UnknownJobType => "UNKNOWN_JOB_TYPE",
            Self::HandlerPanic => "HANDLER_PANIC",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn suggested_action(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::DownstreamError => {
            "Downstream rejected the payload. Check the target's logs for the status returned; not retried."
        }
        ErrorCode::Timeout => {
            "Downstream did not answer within the call timeout. Check its latency or raise the timeout."
        }
        ErrorCode::TransportError => {
            "Network-level failure (DNS, connect, reset). Check the downstream URL and its availability."
        }
        ErrorCode::MaxAttemptsExceeded => {
            "Claims kept stalling until the attempt budget ran out. Look for crashed or hung worker processes."
        }
        ErrorCode::UnknownJobType => {
            "No handler is registered for this job name. Register one or stop producing it."
        }
        ErrorCode::HandlerPanic => {
            "The handler panicked. Capture the panic message from the worker logs and fix the handler."
        }
        ErrorCode::Unknown => "Inspect the error message and worker logs.",
    }
}
