//! HTTP request handlers.

use axum::{
    extract::{Extension, State},
    http::{HeaderName, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

use super::retry::{format_retries_header, AttemptRecord};
use super::server::{AppState, RequestId};
use crate::error::Error;

/// Response header: correlation ID (UUID v4).
pub const SWITCHYARD_REQUEST_ID_HEADER: &str = "x-switchyard-request-id";
/// Response header: target that served (or last failed) the request.
pub const SWITCHYARD_TARGET_HEADER: &str = "x-switchyard-target";
/// Response header: wall-clock latency in milliseconds (integer).
pub const SWITCHYARD_LATENCY_MS_HEADER: &str = "x-switchyard-latency-ms";
/// Response header: estimated cost units recorded against the target.
pub const SWITCHYARD_COST_HEADER: &str = "x-switchyard-cost";
/// Response header: failed attempts per target, e.g. `2/alpha`.
pub const SWITCHYARD_RETRIES_HEADER: &str = "x-switchyard-retries";

/// Attach switchyard metadata headers to a response.
///
/// Values that are not valid header text are skipped rather than failing
/// the response.
fn attach_switchyard_headers(
    response: &mut Response,
    request_id: &str,
    latency_ms: u64,
    target: Option<&str>,
    cost: Option<u64>,
    attempts: &[AttemptRecord],
) {
    let headers = response.headers_mut();

    let mut insert = |name: &'static str, value: &str| {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    };

    insert(SWITCHYARD_REQUEST_ID_HEADER, request_id);
    insert(SWITCHYARD_LATENCY_MS_HEADER, &latency_ms.to_string());
    if let Some(target) = target {
        insert(SWITCHYARD_TARGET_HEADER, target);
    }
    if let Some(cost) = cost {
        insert(SWITCHYARD_COST_HEADER, &cost.to_string());
    }
    if let Some(retries) = format_retries_header(attempts) {
        insert(SWITCHYARD_RETRIES_HEADER, &retries);
    }
}

/// Handle POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Json(payload): Json<Value>,
) -> Response {
    let start = std::time::Instant::now();
    let correlation_id = request_id.0.to_string();

    let messages = payload
        .get("messages")
        .and_then(Value::as_array)
        .map_or(0, Vec::len);
    tracing::info!(
        request_id = %correlation_id,
        messages,
        "Received chat completion request"
    );

    // Cancelled when this handler returns or is dropped, so queued waits and
    // retry sleeps stop with the client.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let attempts: Arc<Mutex<Vec<AttemptRecord>>> = Arc::new(Mutex::new(Vec::new()));

    let result = match tokio::time::timeout(
        state.config.server.request_timeout(),
        state
            .dispatcher
            .process_request_tracked(&payload, &cancel, attempts.clone()),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => {
            cancel.cancel();
            tracing::warn!(request_id = %correlation_id, "Request deadline exceeded");
            Err(Error::Cancelled)
        }
    };

    let latency_ms = start.elapsed().as_millis() as u64;
    let recorded = attempts
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();

    match result {
        Ok(delivery) => {
            tracing::info!(
                request_id = %correlation_id,
                target_id = %delivery.target.id,
                latency_ms,
                cost = delivery.cost,
                failed_attempts = delivery.attempts.len(),
                "Request completed"
            );
            let mut response = Json(delivery.body).into_response();
            attach_switchyard_headers(
                &mut response,
                &correlation_id,
                latency_ms,
                Some(&delivery.target.id),
                Some(delivery.cost),
                &recorded,
            );
            response
        }
        Err(error) => {
            tracing::warn!(
                request_id = %correlation_id,
                status = error.status().as_u16(),
                error = %error,
                latency_ms,
                "Request failed"
            );
            let target = error
                .target()
                .map(str::to_string)
                .or_else(|| recorded.last().map(|a| a.target.clone()));
            let mut response = error.into_response();
            attach_switchyard_headers(
                &mut response,
                &correlation_id,
                latency_ms,
                target.as_deref(),
                None,
                &recorded,
            );
            response
        }
    }
}

/// Handle GET /health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let statuses = state.dispatcher.target_statuses();
    let available = statuses.iter().filter(|s| s.available).count();
    let status = if statuses.is_empty() { "degraded" } else { "ok" };

    Json(serde_json::json!({
        "status": status,
        "service": "switchyard",
        "targets": statuses.len(),
        "available_targets": available,
    }))
}

/// Handle GET /targets - current usage and availability per target
pub async fn list_targets(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "algorithm": state.dispatcher.selector().algorithm().as_str(),
        "available_permits": state.dispatcher.available_permits(),
        "targets": state.dispatcher.target_statuses(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::ErrorClass;

    fn record(target: &str) -> AttemptRecord {
        AttemptRecord {
            target: target.to_string(),
            class: ErrorClass::InternalError,
        }
    }

    #[test]
    fn test_attach_headers_success() {
        let mut response = Response::new(axum::body::Body::empty());
        attach_switchyard_headers(
            &mut response,
            "req-123",
            42,
            Some("alpha"),
            Some(17),
            &[record("alpha"), record("alpha")],
        );

        let headers = response.headers();
        assert_eq!(headers[SWITCHYARD_REQUEST_ID_HEADER], "req-123");
        assert_eq!(headers[SWITCHYARD_LATENCY_MS_HEADER], "42");
        assert_eq!(headers[SWITCHYARD_TARGET_HEADER], "alpha");
        assert_eq!(headers[SWITCHYARD_COST_HEADER], "17");
        assert_eq!(headers[SWITCHYARD_RETRIES_HEADER], "2/alpha");
    }

    #[test]
    fn test_attach_headers_error_without_target() {
        let mut response = Response::new(axum::body::Body::empty());
        attach_switchyard_headers(&mut response, "req-456", 5, None, None, &[]);

        let headers = response.headers();
        assert_eq!(headers[SWITCHYARD_REQUEST_ID_HEADER], "req-456");
        assert!(headers.get(SWITCHYARD_TARGET_HEADER).is_none());
        assert!(headers.get(SWITCHYARD_COST_HEADER).is_none());
        assert!(headers.get(SWITCHYARD_RETRIES_HEADER).is_none());
    }

    #[test]
    fn test_attach_headers_skips_invalid_values() {
        let mut response = Response::new(axum::body::Body::empty());
        attach_switchyard_headers(&mut response, "req-789", 1, Some("bad\nname"), None, &[]);
        assert!(response.headers().get(SWITCHYARD_TARGET_HEADER).is_none());
        assert_eq!(response.headers()[SWITCHYARD_REQUEST_ID_HEADER], "req-789");
    }
}
