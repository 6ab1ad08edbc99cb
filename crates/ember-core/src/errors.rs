use std::time::Duration;

/// Typed error hierarchy for job service calls.
/// Classifies errors as fatal (don't retry), retryable, or malformed.
#[derive(Clone, Debug, thiserror::Error)]
pub enum JobServiceError {
    // Fatal, never retried
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("job not found: {0}")]
    NotFound(String),

    // Retryable
    #[error("rate limited")]
    RateLimited,
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    // The service answered 2xx but the body made no sense
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl JobServiceError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::ServerError { .. } | Self::NetworkError(_) | Self::Timeout(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed(_) | Self::InvalidRequest(_) | Self::NotFound(_)
        )
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::NotFound(_) => "not_found",
            Self::RateLimited => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::NetworkError(_) => "network_error",
            Self::Timeout(_) => "timeout",
            Self::InvalidResponse(_) => "invalid_response",
        }
    }

    /// Classify a non-2xx HTTP status code.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            404 => Self::NotFound(body),
            408 => Self::ServerError { status, body },
            429 => Self::RateLimited,
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(JobServiceError::RateLimited.is_retryable());
        assert!(JobServiceError::ServerError { status: 502, body: "bad gateway".into() }.is_retryable());
        assert!(JobServiceError::NetworkError("reset".into()).is_retryable());
        assert!(JobServiceError::Timeout(Duration::from_secs(10)).is_retryable());
    }

    #[test]
    fn fatal_classification() {
        assert!(JobServiceError::AuthenticationFailed("bad key".into()).is_fatal());
        assert!(JobServiceError::InvalidRequest("bad".into()).is_fatal());
        assert!(JobServiceError::NotFound("j1".into()).is_fatal());
    }

    #[test]
    fn invalid_response_is_neither() {
        let err = JobServiceError::InvalidResponse("missing id".into());
        assert!(!err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn from_status_mapping() {
        assert!(JobServiceError::from_status(401, String::new()).is_fatal());
        assert!(JobServiceError::from_status(403, String::new()).is_fatal());
        assert!(matches!(
            JobServiceError::from_status(404, "gone".into()),
            JobServiceError::NotFound(_)
        ));
        assert!(JobServiceError::from_status(408, String::new()).is_retryable());
        assert!(JobServiceError::from_status(429, String::new()).is_retryable());
        assert!(JobServiceError::from_status(503, String::new()).is_retryable());
        assert!(JobServiceError::from_status(400, "bad input".into()).is_fatal());
        assert!(JobServiceError::from_status(409, String::new()).is_fatal());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(JobServiceError::RateLimited.error_kind(), "rate_limited");
        assert_eq!(
            JobServiceError::Timeout(Duration::from_secs(1)).error_kind(),
            "timeout"
        );
        assert_eq!(
            JobServiceError::InvalidResponse(String::new()).error_kind(),
            "invalid_response"
        );
    }
}
