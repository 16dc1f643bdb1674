//! In-process subject broker
//!
//! Implements [`PubSub`] without a network hop. Used as the deterministic
//! test double and for running the adapter standalone. Outages can be
//! simulated with [`InMemoryBroker::disconnect`] / [`InMemoryBroker::reconnect`].

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{
    spawn_delivery, BrokerStatus, MessageHandler, PubSub, RawDelivery, SubscriptionHandle,
};
use crate::channel::{subject_matches, Channel};
use crate::envelope::{Envelope, EnvelopeCodec};
use crate::error::{AdapterError, AdapterResult};

/// In-memory implementation of the broker facade
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

struct Inner {
    codec: EnvelopeCodec,
    status: RwLock<BrokerStatus>,
    /// Subscription id → slot
    subscriptions: RwLock<HashMap<u64, Slot>>,
    next_id: AtomicU64,
    published: AtomicU64,
}

struct Slot {
    pattern: String,
    tx: mpsc::UnboundedSender<RawDelivery>,
}

impl InMemoryBroker {
    /// Create a connected broker
    pub fn new(codec: EnvelopeCodec) -> Self {
        Self {
            inner: Arc::new(Inner {
                codec,
                status: RwLock::new(BrokerStatus::Connected),
                subscriptions: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                published: AtomicU64::new(0),
            }),
        }
    }

    /// Simulate a dropped connection
    ///
    /// Every live subscription is reported lost and removed; publish and
    /// subscribe fail with `BrokerUnavailable` until [`reconnect`](Self::reconnect).
    pub fn disconnect(&self) {
        *self.inner.status.write() = BrokerStatus::Reconnecting;
        let lost = self.inner.drain();
        tracing::warn!(subscriptions = lost, "In-memory broker disconnected");
    }

    /// Simulate a successful reconnection
    pub fn reconnect(&self) {
        let mut status = self.inner.status.write();
        if *status == BrokerStatus::Reconnecting {
            *status = BrokerStatus::Connected;
            tracing::info!("In-memory broker reconnected");
        }
    }

    /// Number of live broker-level subscriptions
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.read().len()
    }

    /// Number of messages accepted by `publish`
    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    fn ensure_connected(&self) -> AdapterResult<()> {
        match *self.inner.status.read() {
            BrokerStatus::Connected => Ok(()),
            status => Err(AdapterError::BrokerUnavailable(format!(
                "broker is {}",
                status
            ))),
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(EnvelopeCodec::default())
    }
}

impl Inner {
    /// Report every subscription lost and forget it
    fn drain(&self) -> usize {
        let drained: Vec<Slot> = self
            .subscriptions
            .write()
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        for slot in &drained {
            let _ = slot.tx.send(RawDelivery::Lost);
        }
        drained.len()
    }
}

#[async_trait]
impl PubSub for InMemoryBroker {
    async fn publish(&self, envelope: &Envelope) -> AdapterResult<()> {
        self.ensure_connected()?;

        let bytes = self.inner.codec.encode(envelope)?;
        let subject = envelope.channel.subject();

        let subscriptions = self.inner.subscriptions.read();
        for slot in subscriptions.values() {
            if subject_matches(&slot.pattern, &subject) {
                let _ = slot.tx.send(RawDelivery::Bytes(bytes.clone()));
            }
        }
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &Channel,
        handler: MessageHandler,
    ) -> AdapterResult<SubscriptionHandle> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let subject = channel.subject();
        let (tx, rx) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(true));

        {
            // Status stays read-locked until the slot is in, so a concurrent
            // disconnect either refuses this subscribe or drains the slot
            let status = self.inner.status.read();
            if *status != BrokerStatus::Connected {
                return Err(AdapterError::BrokerUnavailable(format!(
                    "broker is {}",
                    *status
                )));
            }
            self.inner.subscriptions.write().insert(
                id,
                Slot {
                    pattern: subject.clone(),
                    tx,
                },
            );
        }

        spawn_delivery(
            subject.clone(),
            self.inner.codec.clone(),
            Arc::clone(&active),
            rx,
            handler,
        );

        tracing::debug!(subject = %subject, sid = id, "In-memory subscription created");

        let inner = Arc::clone(&self.inner);
        Ok(SubscriptionHandle::new(subject, active, move || {
            inner.subscriptions.write().remove(&id);
        }))
    }

    async fn close(&self) {
        *self.inner.status.write() = BrokerStatus::Closed;
        self.inner.drain();
    }

    fn status(&self) -> BrokerStatus {
        *self.inner.status.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerEvent;
    use std::time::Duration;

    fn collector() -> (MessageHandler, mpsc::UnboundedReceiver<BrokerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Box::new(move |event| {
                let _ = tx.send(event);
            }),
            rx,
        )
    }

    fn message(channel: &str, payload: &str) -> Envelope {
        Envelope::new(
            Channel::parse(channel).unwrap(),
            "thing-1",
            "text/plain",
            payload.as_bytes().to_vec(),
        )
    }

    async fn next_payload(rx: &mut mpsc::UnboundedReceiver<BrokerEvent>) -> Vec<u8> {
        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(BrokerEvent::Message(env))) => env.payload,
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber_in_order() {
        let broker = InMemoryBroker::default();
        let (handler, mut rx) = collector();
        let _handle = broker
            .subscribe(&Channel::parse("alerts").unwrap(), handler)
            .await
            .unwrap();

        for i in 0..10 {
            broker
                .publish(&message("alerts", &i.to_string()))
                .await
                .unwrap();
        }

        for i in 0..10 {
            assert_eq!(next_payload(&mut rx).await, i.to_string().into_bytes());
        }
        assert_eq!(broker.published_count(), 10);
    }

    #[tokio::test]
    async fn test_wildcard_subscription() {
        let broker = InMemoryBroker::default();
        let (handler, mut rx) = collector();
        let _handle = broker
            .subscribe(&Channel::parse("temperature/*").unwrap(), handler)
            .await
            .unwrap();

        broker
            .publish(&message("temperature/room1", "21.5"))
            .await
            .unwrap();
        broker.publish(&message("humidity/room1", "40")).await.unwrap();

        assert_eq!(next_payload(&mut rx).await, b"21.5".to_vec());
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_cancel_removes_subscription() {
        let broker = InMemoryBroker::default();
        let (handler, _rx) = collector();
        let mut handle = broker
            .subscribe(&Channel::parse("alerts").unwrap(), handler)
            .await
            .unwrap();
        assert_eq!(broker.subscription_count(), 1);

        handle.cancel();
        assert_eq!(broker.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_and_reconnect() {
        let broker = InMemoryBroker::default();
        let (handler, mut rx) = collector();
        let _handle = broker
            .subscribe(&Channel::parse("alerts").unwrap(), handler)
            .await
            .unwrap();

        broker.disconnect();
        assert_eq!(broker.status(), BrokerStatus::Reconnecting);
        assert!(matches!(rx.recv().await, Some(BrokerEvent::Lost)));

        let (handler, _rx2) = collector();
        let err = broker
            .subscribe(&Channel::parse("alerts").unwrap(), handler)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::BrokerUnavailable(_)));
        assert!(broker.publish(&message("alerts", "x")).await.is_err());

        broker.reconnect();
        let (handler, _rx3) = collector();
        assert!(broker
            .subscribe(&Channel::parse("alerts").unwrap(), handler)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_publish_validates_before_dispatch() {
        let broker = InMemoryBroker::new(EnvelopeCodec::new(crate::envelope::CodecLimits {
            max_payload_bytes: 4,
            ..Default::default()
        }));
        let err = broker
            .publish(&message("alerts", "too long"))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::PayloadTooLarge { .. }));
        assert_eq!(broker.published_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_disconnect_racing_subscribes_leaves_no_live_slot() {
        for _ in 0..20 {
            let broker = InMemoryBroker::default();
            let channel = Channel::parse("alerts").unwrap();

            let subscribers: Vec<_> = (0..16)
                .map(|_| {
                    let broker = broker.clone();
                    let channel = channel.clone();
                    tokio::spawn(async move {
                        let (handler, rx) = collector();
                        broker.subscribe(&channel, handler).await.map(|h| (h, rx))
                    })
                })
                .collect();
            broker.disconnect();

            let mut live = Vec::new();
            for task in subscribers {
                if let Ok(pair) = task.await.unwrap() {
                    live.push(pair);
                }
            }

            assert_eq!(broker.subscription_count(), 0);
            for (_handle, rx) in live.iter_mut() {
                let event = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
                assert!(matches!(event, Ok(Some(BrokerEvent::Lost))));
            }
        }
    }
}
