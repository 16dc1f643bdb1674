//! Adapter Service
//!
//! Orchestrates publish, subscribe and unsubscribe for a connection:
//! authorization against the channel authority, envelope stamping, broker
//! interaction and registry bookkeeping.
//!
//! The core [`AdapterService`] is wrapped by decorators implementing the same
//! [`Service`] trait; [`build`] composes the production chain.

mod logging;
mod metrics;

pub use self::logging::LoggingMiddleware;
pub use self::metrics::MetricsMiddleware;

use async_trait::async_trait;
use std::sync::Arc;

use crate::auth::{AccessAuthority, Identity};
use crate::broker::{BrokerEvent, MessageHandler, PubSub};
use crate::channel::Channel;
use crate::connection::{CloseReason, ConnectionContext};
use crate::envelope::{Envelope, EnvelopeCodec};
use crate::error::{AdapterError, AdapterResult};
use crate::registry::{Subscription, SubscriptionRegistry};
use crate::websocket::PushOutcome;

/// Relay operations available to a connection
#[async_trait]
pub trait Service: Send + Sync {
    /// Publish `payload` on `channel` on behalf of the token's owner
    async fn publish(
        &self,
        ctx: &Arc<ConnectionContext>,
        channel: &Channel,
        token: &str,
        content_type: &str,
        payload: Vec<u8>,
    ) -> AdapterResult<()>;

    /// Subscribe the connection to `channel`; idempotent per connection
    async fn subscribe(
        &self,
        ctx: &Arc<ConnectionContext>,
        channel: &Channel,
        token: &str,
    ) -> AdapterResult<Subscription>;

    /// Drop the connection's subscription to `channel`, if any
    async fn unsubscribe(&self, ctx: &Arc<ConnectionContext>, channel: &Channel)
        -> AdapterResult<bool>;
}

/// Core relay service
pub struct AdapterService {
    authority: Arc<dyn AccessAuthority>,
    broker: Arc<dyn PubSub>,
    registry: Arc<SubscriptionRegistry>,
    codec: EnvelopeCodec,
}

impl AdapterService {
    pub fn new(
        authority: Arc<dyn AccessAuthority>,
        broker: Arc<dyn PubSub>,
        registry: Arc<SubscriptionRegistry>,
        codec: EnvelopeCodec,
    ) -> Self {
        Self {
            authority,
            broker,
            registry,
            codec,
        }
    }
}

#[async_trait]
impl Service for AdapterService {
    async fn publish(
        &self,
        _ctx: &Arc<ConnectionContext>,
        channel: &Channel,
        token: &str,
        content_type: &str,
        payload: Vec<u8>,
    ) -> AdapterResult<()> {
        channel.ensure_publishable()?;
        if payload.is_empty() {
            return Err(AdapterError::MalformedMessage("empty payload".to_string()));
        }
        self.codec.validate(&payload, content_type)?;

        let identity = self.authority.check_access(token, channel.id()).await?;

        let envelope = Envelope::new(channel.clone(), identity.0, content_type, payload);
        self.broker.publish(&envelope).await
    }

    async fn subscribe(
        &self,
        ctx: &Arc<ConnectionContext>,
        channel: &Channel,
        token: &str,
    ) -> AdapterResult<Subscription> {
        let identity = self.authority.check_access(token, channel.id()).await?;

        let broker = Arc::clone(&self.broker);
        let handler = delivery_handler(Arc::clone(ctx), channel.clone(), identity);
        let target = channel.clone();

        self.registry
            .add(ctx.id(), channel, move || async move {
                broker.subscribe(&target, handler).await
            })
            .await
    }

    async fn unsubscribe(
        &self,
        ctx: &Arc<ConnectionContext>,
        channel: &Channel,
    ) -> AdapterResult<bool> {
        Ok(self.registry.remove(ctx.id(), channel).await)
    }
}

/// Broker callback feeding a connection's outbound queue
///
/// Messages published by `identity` itself are not echoed back. A lost
/// subscription closes the connection so the client resubscribes.
fn delivery_handler(
    ctx: Arc<ConnectionContext>,
    channel: Channel,
    identity: Identity,
) -> MessageHandler {
    Box::new(move |event| match event {
        BrokerEvent::Message(envelope) => {
            if envelope.publisher == identity.as_str() {
                return;
            }
            if ctx.outbound().push(envelope) == PushOutcome::DroppedOldest {
                tracing::debug!(
                    connection_id = %ctx.id(),
                    channel = %channel,
                    "Outbound queue full, dropped oldest message"
                );
            }
        }
        BrokerEvent::Lost => {
            tracing::warn!(
                connection_id = %ctx.id(),
                channel = %channel,
                "Broker subscription lost, closing connection"
            );
            ctx.terminate(CloseReason::subscription_lost());
        }
    })
}

/// Build the service chain used by the transport
pub fn build(
    authority: Arc<dyn AccessAuthority>,
    broker: Arc<dyn PubSub>,
    registry: Arc<SubscriptionRegistry>,
    codec: EnvelopeCodec,
) -> Arc<dyn Service> {
    let core = AdapterService::new(authority, broker, registry, codec);
    Arc::new(MetricsMiddleware::new(LoggingMiddleware::new(core)))
}
