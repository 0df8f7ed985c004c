//! HTTP proxy server module.
//!
//! This module provides the OpenAI-compatible HTTP API that accepts
//! requests and dispatches them to admitted targets.

pub mod dispatcher;
mod handlers;
pub mod retry;
mod server;
pub mod transport;

pub use dispatcher::{Admitted, Delivery, Dispatcher, TargetStatus};
pub use handlers::{
    SWITCHYARD_COST_HEADER, SWITCHYARD_LATENCY_MS_HEADER, SWITCHYARD_REQUEST_ID_HEADER,
    SWITCHYARD_RETRIES_HEADER, SWITCHYARD_TARGET_HEADER,
};
pub use retry::{format_retries_header, AttemptRecord};
pub use server::{create_router, run_server, AppState, RequestId};
pub use transport::{
    BackendTransport, HttpTransport, OutboundRequest, TransportError, TransportResponse,
};
