//! HTTP server setup and configuration.

use axum::{
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use super::dispatcher::Dispatcher;
use super::handlers;
use super::transport::{BackendTransport, HttpTransport};
use crate::config::{Config, ConfigError};
use crate::router::TargetRegistry;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Build the dispatcher for `config` on top of `transport`.
    pub fn new(config: Config, transport: Arc<dyn BackendTransport>) -> Result<Self, ConfigError> {
        let registry = TargetRegistry::new(config.targets.clone())?;
        let dispatcher = Dispatcher::new(registry, &config.balancer, transport);
        Ok(Self {
            dispatcher: Arc::new(dispatcher),
            config: Arc::new(config),
        })
    }
}

/// Per-request correlation id, inserted as a request extension.
#[derive(Debug, Clone, Copy)]
pub struct RequestId(pub Uuid);

async fn assign_request_id(mut request: Request, next: Next) -> Response {
    request.extensions_mut().insert(RequestId(Uuid::new_v4()));
    next.run(request).await
}

/// Create the axum router with all endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // OpenAI-compatible endpoint
        .route("/v1/chat/completions", post(handlers::chat_completions))
        // switchyard extensions
        .route("/health", get(handlers::health))
        .route("/targets", get(handlers::list_targets))
        // State and middleware
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(assign_request_id)),
        )
}

/// Run the HTTP server until Ctrl-C.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let listen_addr = config.server.listen.clone();

    if config.targets.is_empty() {
        tracing::warn!("No targets configured - every request will be refused");
    }

    let transport = Arc::new(HttpTransport::new()?);
    let state = AppState::new(config, transport)?;

    tracing::info!(
        targets = state.dispatcher.registry().len(),
        algorithm = %state.config.balancer.algorithm,
        concurrency_limit = state.config.balancer.concurrency_limit,
        "Dispatcher ready"
    );

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(address = %listen_addr, "Starting switchyard server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
