//! Error types for switchyard.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::time::Duration;

/// Result type alias for switchyard operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for switchyard.
///
/// Everything except `Config`, `BadRequest` and `Internal` is an expected
/// dispatch outcome rather than a fault.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("No target became available within {}s", waited.as_secs_f64())]
    NoTargetAvailable { waited: Duration },

    #[error("Target '{target}' failed after {attempts} attempts: {last_error}")]
    DeliveryExhausted {
        target: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Target '{target}' returned {status}: {body}")]
    NonRetryableUpstream {
        target: String,
        status: u16,
        body: String,
    },

    #[error(
        "Request cost {request_cost} would exceed the per-minute ceiling of target '{target}' ({window_cost}/{limit} used)"
    )]
    CostCeilingExceeded {
        target: String,
        window_cost: u64,
        request_cost: u64,
        limit: u64,
    },

    #[error("Target '{target}' returned an unreadable response: {message}")]
    InvalidResponse { target: String, message: String },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status reported to the client.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::NoTargetAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::DeliveryExhausted { .. } => StatusCode::BAD_GATEWAY,
            Error::NonRetryableUpstream { .. } => StatusCode::BAD_GATEWAY,
            Error::CostCeilingExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::InvalidResponse { .. } => StatusCode::BAD_GATEWAY,
            Error::Cancelled => StatusCode::GATEWAY_TIMEOUT,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Target the failure is attributed to, if any.
    pub fn target(&self) -> Option<&str> {
        match self {
            Error::DeliveryExhausted { target, .. }
            | Error::NonRetryableUpstream { target, .. }
            | Error::CostCeilingExceeded { target, .. }
            | Error::InvalidResponse { target, .. } => Some(target),
            _ => None,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();

        // Return OpenAI-compatible error format
        let body = serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": "switchyard_error",
                "code": status.as_u16()
            }
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (
                Error::NoTargetAvailable {
                    waited: Duration::from_secs(300),
                },
                503,
            ),
            (
                Error::DeliveryExhausted {
                    target: "a".into(),
                    attempts: 2,
                    last_error: "503".into(),
                },
                502,
            ),
            (
                Error::NonRetryableUpstream {
                    target: "a".into(),
                    status: 400,
                    body: "bad".into(),
                },
                502,
            ),
            (
                Error::CostCeilingExceeded {
                    target: "a".into(),
                    window_cost: 95,
                    request_cost: 10,
                    limit: 100,
                },
                429,
            ),
            (
                Error::InvalidResponse {
                    target: "a".into(),
                    message: "eof".into(),
                },
                502,
            ),
            (Error::Cancelled, 504),
            (Error::BadRequest("x".into()), 400),
        ];
        for (error, expected) in cases {
            assert_eq!(error.status().as_u16(), expected, "{}", error);
        }
    }

    #[tokio::test]
    async fn test_error_body_is_openai_shaped() {
        let response = Error::NoTargetAvailable {
            waited: Duration::from_secs(3),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["type"], "switchyard_error");
        assert_eq!(body["error"]["code"], 503);
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("No target became available"));
    }

    #[test]
    fn test_target_attribution() {
        let err = Error::NonRetryableUpstream {
            target: "beta".into(),
            status: 404,
            body: String::new(),
        };
        assert_eq!(err.target(), Some("beta"));
        assert_eq!(Error::Cancelled.target(), None);
    }
}
