use thiserror::Error;

pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Message fragments that mark a failure as a dropped connection or a
/// truncated body rather than a real rejection.
const TRANSIENT_PATTERNS: &[&str] = &[
    "failed to fetch",
    "fetch failed",
    "connection closed",
    "unexpected end of json input",
    "invalid json",
    "load failed",
    "networkerror when attempting to fetch resource",
];

/// Engine error taxonomy. `Clone` so one failure can be handed to every
/// caller joined on the same in-flight lookup.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// Network-class failure or an exceeded per-call deadline. Retryable up to a budget.
    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Backend rejected request{}: {message}", status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    BackendRejected { status: Option<u16>, message: String },

    #[error("Run {run_id} failed: {message}")]
    RunFailed { run_id: String, message: String },

    #[error("Run {run_id} was cancelled: {message}")]
    RunCancelled { run_id: String, message: String },

    /// Poll budget ran out before the run reached a terminal state. The run
    /// itself has not failed.
    #[error("Run {run_id} still running after {attempts} status checks; check back later")]
    StillRunning { run_id: String, attempts: u32 },

    /// The session or loop was replaced mid-flight.
    #[error("Superseded by a newer request")]
    Superseded,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl SyncError {
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        SyncError::BackendRejected {
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Timeout(_) => true,
            SyncError::Superseded | SyncError::Config(_) | SyncError::StillRunning { .. } => false,
            other => is_transient_message(&other.to_string()),
        }
    }

    /// 404-class rejection, used to detect endpoints the backend doesn't serve.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SyncError::BackendRejected {
                status: Some(404 | 405 | 410),
                ..
            }
        )
    }

    pub fn is_superseded(&self) -> bool {
        matches!(self, SyncError::Superseded)
    }
}

impl From<anyhow::Error> for SyncError {
    fn from(err: anyhow::Error) -> Self {
        SyncError::Other(format!("{err:#}"))
    }
}

pub fn is_transient_message(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    TRANSIENT_PATTERNS.iter().any(|p| lowered.contains(p))
}
