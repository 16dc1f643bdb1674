//! # ws-adapter
//!
//! WebSocket protocol adapter for an IoT messaging platform. Client sessions
//! publish and subscribe to channels; messages are relayed through a
//! subject-based broker shared with the platform's other protocol adapters.
//!
//! ## Features
//!
//! - **Channel relay**: channels with sub-topics and wildcards, mapped to broker subjects
//! - **Per-operation authorization**: every publish and subscribe asks the authority
//! - **Shared envelope**: payloads travel in the format every adapter understands
//! - **Backpressure**: bounded drop-oldest outbound queue per connection
//! - **Resilience**: transparent broker reconnection, lost subscriptions close their clients
//!
//! ## Modules
//!
//! - [`channel`]: Channel parsing and subject mapping
//! - [`envelope`]: Message envelope codec
//! - [`broker`]: Broker client facade (NATS, in-memory)
//! - [`auth`]: Authorization client
//! - [`registry`]: Subscription registry
//! - [`service`]: Adapter service and its decorators
//! - [`websocket`]: Connection pump and WebSocket handlers
//! - [`api`]: HTTP server with Axum
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ws_adapter::api::{serve, AppState};
//! use ws_adapter::auth::StaticAuthority;
//! use ws_adapter::broker::InMemoryBroker;
//! use ws_adapter::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let authority = StaticAuthority::new();
//!     authority.grant("secret-token", "thing-1", ["temperature"]);
//!
//!     let state = AppState::new(
//!         &Config::default(),
//!         Arc::new(authority),
//!         Arc::new(InMemoryBroker::default()),
//!     );
//!
//!     // ws://localhost:8180/channels/temperature/messages?authorization=secret-token
//!     serve(state).await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod auth;
pub mod broker;
pub mod channel;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod service;
pub mod websocket;

// Re-export top-level types for convenience
pub use error::{AdapterError, AdapterResult};

pub use channel::Channel;

pub use envelope::{CodecLimits, Envelope, EnvelopeCodec};

pub use broker::{
    BrokerEvent, BrokerStatus, InMemoryBroker, MessageHandler, NatsBroker, NatsConfig, PubSub,
    SubscriptionHandle,
};

pub use auth::{AccessAuthority, AccessError, HttpAuthority, Identity, StaticAuthority};

pub use connection::{CloseReason, ConnectionContext, ConnectionId};

pub use registry::{Subscription, SubscriptionRegistry};

pub use service::{AdapterService, LoggingMiddleware, MetricsMiddleware, Service};

pub use websocket::{
    ClientMessage, ConnectionPump, OutboundQueue, PumpMode, PumpSettings, PumpState,
    ServerMessage,
};

pub use api::{build_router, serve, ApiError, AppState};

pub use config::{Config, ConfigError};
