//! Shared helpers for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use switchyard::config::TargetConfig;
use switchyard::proxy::{BackendTransport, OutboundRequest, TransportError, TransportResponse};
use tokio::time::Instant;

/// Scripted reply for one delivery attempt.
#[derive(Debug, Clone, Copy)]
pub enum Reply {
    Status(u16),
    ConnectionError,
}

/// One call observed by [`MockTransport`].
#[derive(Debug, Clone)]
pub struct Call {
    pub target: String,
    pub at: Instant,
    pub payload: Value,
}

/// In-memory transport. Targets are recognised by their `http://<id>.test` URL.
#[derive(Default)]
pub struct MockTransport {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<Call>>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every send takes `delay` before replying.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Queue replies for `target`; once exhausted it answers 200.
    pub fn script(&self, target: &str, replies: &[Reply]) {
        self.scripts
            .lock()
            .unwrap()
            .entry(target.to_string())
            .or_default()
            .extend(replies.iter().copied());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, target: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.target == target)
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

fn target_from_url(url: &str) -> String {
    url.trim_start_matches("http://")
        .split(".test")
        .next()
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl BackendTransport for MockTransport {
    async fn send(&self, request: &OutboundRequest) -> Result<TransportResponse, TransportError> {
        let target = target_from_url(&request.url);
        self.calls.lock().unwrap().push(Call {
            target: target.clone(),
            at: Instant::now(),
            payload: request.payload.clone(),
        });

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let reply = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&target)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Reply::Status(200));

        match reply {
            Reply::Status(200) => Ok(TransportResponse {
                status: 200,
                body: json!({
                    "id": format!("cmpl-{}", target),
                    "object": "chat.completion",
                    "choices": [{"index": 0, "message": {"role": "assistant", "content": "ok"}}]
                })
                .to_string(),
            }),
            Reply::Status(status) => Ok(TransportResponse {
                status,
                body: json!({"error": {"message": format!("upstream {}", status)}}).to_string(),
            }),
            Reply::ConnectionError => Err(TransportError::Other("connection refused".to_string())),
        }
    }

    async fn probe(&self, _url: &str) -> Result<(), TransportError> {
        Ok(())
    }
}

/// A target with no limits, reachable through [`MockTransport`].
pub fn target(id: &str) -> TargetConfig {
    TargetConfig {
        url: Some(format!("http://{}.test/v1/chat/completions", id)),
        ..TargetConfig::unlimited(id)
    }
}

pub fn chat_payload() -> Value {
    json!({
        "messages": [{"role": "user", "content": "Hello"}]
    })
}
