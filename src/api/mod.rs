//! Transport Listener
//!
//! HTTP server exposing the WebSocket endpoints, built with Axum.
//!
//! # Endpoints
//!
//! ## WebSocket
//! - `GET /channels/:id/messages` - Channel-bound connection
//! - `GET /channels/:id/messages/*subtopic` - Channel-bound connection on a sub-topic
//! - `GET /ws` - Command connection
//!
//! ## Health
//! - `GET /health/live` - Liveness probe
//! - `GET /health/ready` - Readiness probe
//! - `GET /health` - Full health status
//!
//! ## Metrics
//! - `GET /metrics` - Prometheus exposition
//!
//! # Example
//!
//! ```rust,ignore
//! use ws_adapter::api::{serve, AppState};
//! use ws_adapter::auth::StaticAuthority;
//! use ws_adapter::broker::InMemoryBroker;
//! use ws_adapter::config::Config;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let state = AppState::new(
//!         &config,
//!         Arc::new(StaticAuthority::new()),
//!         Arc::new(InMemoryBroker::default()),
//!     );
//!     serve(state).await?;
//!     Ok(())
//! }
//! ```

pub mod dto;
pub mod error;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::{AppState, ServerSettings};

use axum::{routing::get, Router};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

use crate::registry::SubscriptionRegistry;
use crate::websocket::{channel_handler, command_handler};

/// How long shutdown waits for open connections to close
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Build the router with all routes and middleware
pub fn build_router(state: AppState) -> Router {
    let channel_routes = Router::new()
        .route("/:id/messages", get(channel_handler))
        .route("/:id/messages/*subtopic", get(channel_handler));

    let health_routes = Router::new()
        .route("/live", get(routes::health::liveness))
        .route("/ready", get(routes::health::readiness))
        .route("/", get(routes::health::full_health));

    // Create shared state
    let shared_state = Arc::new(state);

    Router::new()
        .nest("/channels", channel_routes)
        .route("/ws", get(command_handler))
        .nest("/health", health_routes)
        .route("/metrics", get(routes::metrics::prometheus))
        .layer(TraceLayer::new_for_http())
        .with_state(shared_state)
}

/// Start the server and run until a shutdown signal
pub async fn serve(state: AppState) -> Result<(), ApiError> {
    serve_with_shutdown(state, shutdown_signal()).await
}

/// Start the server and run until `signal` resolves
///
/// Live connections are closed with "going away" once shutdown begins.
pub async fn serve_with_shutdown<F>(state: AppState, signal: F) -> Result<(), ApiError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = state.config.addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    serve_listener(listener, state, signal).await
}

/// Run the server on an already bound listener
pub async fn serve_listener<F>(
    listener: tokio::net::TcpListener,
    state: AppState,
    signal: F,
) -> Result<(), ApiError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let shutdown = state.shutdown.clone();
    let broker = Arc::clone(&state.broker);
    let registry = Arc::clone(&state.registry);
    let router = build_router(state);

    tracing::info!("WebSocket adapter service started, exposed port {}", listener.local_addr()?.port());

    let result = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            signal.await;
            shutdown.cancel();
        })
        .await
        .map_err(|e| ApiError::Internal(format!("Server error: {}", e)));

    drain(&registry, DRAIN_TIMEOUT).await;
    broker.close().await;
    result
}

/// Wait for the pumps to finish their close handshakes
async fn drain(registry: &SubscriptionRegistry, timeout: Duration) {
    let wait = async {
        while registry.connection_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    if tokio::time::timeout(timeout, wait).await.is_err() {
        let connections = registry.connection_count().await;
        tracing::warn!(
            connections = connections,
            "Connections still open after shutdown timeout"
        );
    }
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
