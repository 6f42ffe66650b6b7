use thiserror::Error;

pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    /// 404-class response: the resource or the endpoint itself is missing.
    #[error("Not found (status {status}): {message}")]
    NotFound { status: u16, message: String },
}

impl IngestError {
    /// Timeout and connection-level failures. These are worth retrying;
    /// API rejections are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, IngestError::Network(_) | IngestError::Timeout(_))
    }

    /// Used to detect endpoints the backend doesn't serve.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            IngestError::NotFound { .. } | IngestError::Api { status: 404 | 405 | 410, .. }
        )
    }

    /// Classify a non-2xx response.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            404 | 405 | 410 => IngestError::NotFound { status, message },
            _ => IngestError::Api { status, message },
        }
    }
}

impl From<reqwest::Error> for IngestError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            IngestError::Timeout(err.to_string())
        } else if err.is_decode() {
            IngestError::Parse(err.to_string())
        } else if let Some(status) = err.status() {
            IngestError::from_status(status.as_u16(), err.to_string())
        } else {
            IngestError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(err: serde_json::Error) -> Self {
        IngestError::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_covers_network_and_timeout_only() {
        assert!(IngestError::Network("reset".into()).is_transient());
        assert!(IngestError::Timeout("15s".into()).is_transient());
        assert!(!IngestError::Parse("bad".into()).is_transient());
        assert!(!IngestError::Api {
            status: 503,
            message: "busy".into()
        }
        .is_transient());
    }

    #[test]
    fn not_found_matches_404_class() {
        let err = IngestError::from_status(404, "no route".into());
        assert!(matches!(err, IngestError::NotFound { status: 404, .. }));
        assert!(err.is_not_found());
        let err = IngestError::Api {
            status: 500,
            message: "boom".into(),
        };
        assert!(!err.is_not_found());
    }
}
