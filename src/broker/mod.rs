//! Broker Client Facade
//!
//! A single broker connection is shared by every connection pump. This
//! module defines the capability the rest of the adapter depends on and the
//! pieces shared by its implementations.
//!
//! ## Implementations
//!
//! - [`NatsBroker`]: NATS text protocol over TCP, with transparent reconnection
//! - [`InMemoryBroker`]: in-process subject broker for tests and standalone runs
//!
//! ## Delivery model
//!
//! Every subscription gets its own delivery task. The handler of one
//! subscription is therefore never invoked concurrently with itself, while
//! different subscriptions are delivered in parallel. Once a
//! [`SubscriptionHandle`] is cancelled no further handler call starts.

mod memory;
mod nats;

pub use memory::InMemoryBroker;
pub use nats::{NatsBroker, NatsConfig};

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::channel::Channel;
use crate::envelope::{Envelope, EnvelopeCodec};
use crate::error::AdapterResult;

/// Event delivered to a subscription handler
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// A message published on the subscribed subject
    Message(Envelope),
    /// The broker connection dropped; this subscription will not deliver again
    Lost,
}

/// Callback invoked for every event of a subscription
pub type MessageHandler = Box<dyn FnMut(BrokerEvent) + Send + 'static>;

/// Health of the shared broker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerStatus {
    Connected,
    Reconnecting,
    Closed,
}

impl fmt::Display for BrokerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BrokerStatus::Connected => "connected",
            BrokerStatus::Reconnecting => "reconnecting",
            BrokerStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Publish/subscribe capability of the shared broker connection
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Fire-and-forget publish of an envelope on its channel's subject
    async fn publish(&self, envelope: &Envelope) -> AdapterResult<()>;

    /// Subscribe to a channel; `handler` receives every delivery
    async fn subscribe(
        &self,
        channel: &Channel,
        handler: MessageHandler,
    ) -> AdapterResult<SubscriptionHandle>;

    /// Tear the connection down; later calls fail with `BrokerUnavailable`
    async fn close(&self);

    /// Current connection health
    fn status(&self) -> BrokerStatus;
}

/// Cancellable broker-level subscription
///
/// Dropping the handle cancels the subscription.
pub struct SubscriptionHandle {
    subject: String,
    active: Arc<AtomicBool>,
    on_cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SubscriptionHandle {
    pub(crate) fn new(
        subject: String,
        active: Arc<AtomicBool>,
        on_cancel: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            subject,
            active,
            on_cancel: Some(Box::new(on_cancel)),
        }
    }

    /// Broker subject of this subscription
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Whether deliveries are still being dispatched
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop deliveries and release the broker subscription
    pub fn cancel(&mut self) {
        self.active.store(false, Ordering::Release);
        if let Some(on_cancel) = self.on_cancel.take() {
            on_cancel();
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("subject", &self.subject)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Raw item pushed by a broker reader to a subscription's delivery task
#[derive(Debug)]
pub(crate) enum RawDelivery {
    Bytes(Vec<u8>),
    Lost,
}

/// Spawn the delivery task of one subscription
///
/// Decodes raw broker bytes and invokes the handler serially until the
/// channel closes, the subscription is cancelled, or the broker reports
/// the subscription lost.
pub(crate) fn spawn_delivery(
    subject: String,
    codec: EnvelopeCodec,
    active: Arc<AtomicBool>,
    mut rx: mpsc::UnboundedReceiver<RawDelivery>,
    mut handler: MessageHandler,
) {
    tokio::spawn(async move {
        while let Some(raw) = rx.recv().await {
            if !active.load(Ordering::Acquire) {
                break;
            }
            match raw {
                RawDelivery::Bytes(bytes) => match codec.decode(&bytes) {
                    Ok(envelope) => handler(BrokerEvent::Message(envelope)),
                    Err(e) => {
                        tracing::warn!(
                            subject = %subject,
                            error = %e,
                            "Dropping undecodable broker message"
                        );
                    }
                },
                RawDelivery::Lost => {
                    active.store(false, Ordering::Release);
                    handler(BrokerEvent::Lost);
                    break;
                }
            }
        }
        tracing::trace!(subject = %subject, "Delivery task finished");
    });
}
