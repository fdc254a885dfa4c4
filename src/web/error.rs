//! Error taxonomy shared by the orchestrator and the gateway.

use hyper::StatusCode;

/// Everything a `route`, `ensure` or eviction call can fail with.
///
/// `Clone` because a single spawn outcome is handed to every caller that
/// joined it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestratorError {
    #[error("unknown model alias: {0}")]
    UnknownAlias(String),

    #[error(
        "insufficient memory for {alias}: requested {requested_bytes} bytes, {available_bytes} available"
    )]
    InsufficientCapacity {
        alias: String,
        requested_bytes: u64,
        available_bytes: u64,
    },

    #[error("worker {alias} did not become healthy within {seconds}s")]
    SpawnTimeout { alias: String, seconds: u64 },

    #[error("worker {alias} failed to start: {reason}")]
    SpawnFailed { alias: String, reason: String },

    #[error("worker {alias} crashed: {reason}")]
    WorkerCrashed { alias: String, reason: String },

    #[error("request to {alias} timed out after {seconds}s")]
    RequestTimeout { alias: String, seconds: u64 },

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("upstream error from {alias}: {reason}")]
    Upstream { alias: String, reason: String },
}

impl OrchestratorError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownAlias(_) => StatusCode::NOT_FOUND,
            Self::InsufficientCapacity { .. }
            | Self::SpawnTimeout { .. }
            | Self::RequestTimeout { .. }
            | Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::SpawnFailed { .. } | Self::WorkerCrashed { .. } | Self::Upstream { .. } => {
                StatusCode::BAD_GATEWAY
            }
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Whether a client may simply try again later.
    pub fn is_retryable(&self) -> bool {
        self.status_code() == StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_and_timeouts_are_busy() {
        let capacity = OrchestratorError::InsufficientCapacity {
            alias: "stt-fast".into(),
            requested_bytes: 10,
            available_bytes: 1,
        };
        let spawn_timeout = OrchestratorError::SpawnTimeout {
            alias: "stt-fast".into(),
            seconds: 120,
        };
        let request_timeout = OrchestratorError::RequestTimeout {
            alias: "stt-fast".into(),
            seconds: 120,
        };
        for err in [capacity, spawn_timeout, request_timeout] {
            assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
            assert!(err.is_retryable());
        }
    }

    #[test]
    fn test_crashes_are_upstream_failures() {
        let crashed = OrchestratorError::WorkerCrashed {
            alias: "tts-fast".into(),
            reason: "connection refused".into(),
        };
        assert_eq!(crashed.status_code(), StatusCode::BAD_GATEWAY);
        assert!(!crashed.is_retryable());
    }

    #[test]
    fn test_remaining_mappings() {
        assert_eq!(
            OrchestratorError::UnknownAlias("nope".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            OrchestratorError::Conflict("busy".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            OrchestratorError::Unauthorized.status_code(),
            StatusCode::UNAUTHORIZED
        );
    }
}
