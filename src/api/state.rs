//! Application State
//!
//! Shared state accessible by all handlers.
//! Wrapped in Arc for thread-safe sharing across async tasks.

use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::auth::AccessAuthority;
use crate::broker::PubSub;
use crate::config::Config;
use crate::envelope::EnvelopeCodec;
use crate::registry::SubscriptionRegistry;
use crate::service::{self, Service};
use crate::websocket::PumpSettings;

/// Shared application state for all handlers
#[derive(Clone)]
pub struct AppState {
    /// Decorated relay service used by every connection
    pub service: Arc<dyn Service>,
    /// Live subscriptions per connection
    pub registry: Arc<SubscriptionRegistry>,
    /// Authority consulted before channel-mode upgrades
    pub authority: Arc<dyn AccessAuthority>,
    /// Shared broker connection
    pub broker: Arc<dyn PubSub>,
    /// Payload limits checked before upgrades
    pub codec: EnvelopeCodec,
    /// Connection settings
    pub config: Arc<ServerSettings>,
    /// Prometheus handle, when a recorder is installed
    pub metrics: Option<PrometheusHandle>,
    /// Cancelled on shutdown; every connection token derives from it
    pub shutdown: CancellationToken,
    /// Server start time for uptime tracking
    pub start_time: Instant,
}

/// Per-connection settings derived from the configuration
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub outbound_queue_capacity: usize,
    pub pump: PumpSettings,
}

impl ServerSettings {
    /// Get the socket address string
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl From<&Config> for ServerSettings {
    fn from(config: &Config) -> Self {
        Self {
            host: config.server.host.clone(),
            port: config.server.port,
            outbound_queue_capacity: config.limits.outbound_queue_capacity,
            pump: PumpSettings {
                publish_retries: config.broker.publish_retries,
                retry_backoff: Duration::from_millis(config.broker.retry_backoff_ms),
                ..PumpSettings::default()
            },
        }
    }
}

impl AppState {
    /// Wire the registry and service chain around an authority and a broker
    pub fn new(
        config: &Config,
        authority: Arc<dyn AccessAuthority>,
        broker: Arc<dyn PubSub>,
    ) -> Self {
        let codec = EnvelopeCodec::new(config.limits.codec());
        let registry = Arc::new(SubscriptionRegistry::new(config.limits.max_connections));
        let service = service::build(
            Arc::clone(&authority),
            Arc::clone(&broker),
            Arc::clone(&registry),
            codec.clone(),
        );

        Self {
            service,
            registry,
            authority,
            broker,
            codec,
            config: Arc::new(ServerSettings::from(config)),
            metrics: None,
            shutdown: CancellationToken::new(),
            start_time: Instant::now(),
        }
    }

    /// Expose a Prometheus recorder on `/metrics`
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Get server uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Get WebSocket connection count
    pub async fn connection_count(&self) -> usize {
        self.registry.connection_count().await
    }
}
