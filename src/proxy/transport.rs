//! Backend transport abstraction.
//!
//! The dispatcher only ever talks to targets through [`BackendTransport`],
//! so tests can script backend behavior without a network.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

/// Transport-level failures: no HTTP status was obtained.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

/// A fully built chat-completion request for one target.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub payload: Value,
}

/// Status and raw body returned by a target.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

/// Sends requests to backend targets.
#[async_trait]
pub trait BackendTransport: Send + Sync {
    /// POST `request.payload` as JSON to `request.url`.
    ///
    /// Any HTTP status is a successful transport result.
    async fn send(&self, request: &OutboundRequest) -> Result<TransportResponse, TransportError>;

    /// Liveness probe. Any HTTP response counts as alive.
    async fn probe(&self, url: &str) -> Result<(), TransportError>;
}

/// [`BackendTransport`] backed by a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Create a transport with a 120s request timeout and 10s connect timeout.
    pub fn new() -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BackendTransport for HttpTransport {
    async fn send(&self, request: &OutboundRequest) -> Result<TransportResponse, TransportError> {
        let response = self
            .client
            .post(&request.url)
            .headers(request.headers.clone())
            .json(&request.payload)
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(TransportResponse { status, body })
    }

    async fn probe(&self, url: &str) -> Result<(), TransportError> {
        self.client.get(url).send().await?;
        Ok(())
    }
}
