//! Subscription Registry
//!
//! Tracks the broker subscriptions of every connection so a subscribe can be
//! made idempotent and a closing connection can release everything at once.
//!
//! Each connection entry sits behind its own mutex, held across the broker
//! subscribe of an add. Concurrent adds for one connection therefore produce
//! a single broker subscription, and a `remove_all` waits for an in-flight
//! add before marking the entry closed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::broker::SubscriptionHandle;
use crate::channel::Channel;
use crate::connection::ConnectionId;
use crate::error::{AdapterError, AdapterResult};

/// A channel subscription owned by one connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    pub id: Uuid,
    pub channel: Channel,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    fn new(channel: Channel) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel,
            created_at: Utc::now(),
        }
    }
}

struct RegisteredSubscription {
    info: Subscription,
    handle: SubscriptionHandle,
}

#[derive(Default)]
struct ConnectionEntry {
    subscriptions: HashMap<Channel, RegisteredSubscription>,
    closed: bool,
}

/// Connection → {channel → subscription}
pub struct SubscriptionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<Mutex<ConnectionEntry>>>>,
    max_connections: usize,
}

impl SubscriptionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            max_connections,
        }
    }

    /// Register a new connection
    ///
    /// Fails when the connection limit has been reached.
    pub async fn register(&self, id: ConnectionId) -> AdapterResult<()> {
        let mut connections = self.connections.write().await;
        if connections.len() >= self.max_connections {
            return Err(AdapterError::TooManyConnections(self.max_connections));
        }
        connections.entry(id).or_default();

        tracing::debug!(connection_id = %id, "Connection registered");
        Ok(())
    }

    /// Add a subscription, creating the broker subscription only if absent
    ///
    /// Returns the existing subscription when the connection already
    /// subscribed to `channel`; `subscribe` is then not called.
    pub async fn add<F, Fut>(
        &self,
        id: ConnectionId,
        channel: &Channel,
        subscribe: F,
    ) -> AdapterResult<Subscription>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AdapterResult<SubscriptionHandle>>,
    {
        let entry = self.entry(id).await.ok_or(AdapterError::ConnectionClosed)?;
        let mut entry = entry.lock().await;
        if entry.closed {
            return Err(AdapterError::ConnectionClosed);
        }

        if let Some(existing) = entry.subscriptions.get(channel) {
            return Ok(existing.info.clone());
        }

        let handle = subscribe().await?;
        let info = Subscription::new(channel.clone());
        entry.subscriptions.insert(
            channel.clone(),
            RegisteredSubscription {
                info: info.clone(),
                handle,
            },
        );

        tracing::debug!(
            connection_id = %id,
            channel = %channel,
            subscription_id = %info.id,
            "Subscription added"
        );
        Ok(info)
    }

    /// Remove one subscription, cancelling its broker handle
    pub async fn remove(&self, id: ConnectionId, channel: &Channel) -> bool {
        let Some(entry) = self.entry(id).await else {
            return false;
        };
        let removed = entry.lock().await.subscriptions.remove(channel);

        match removed {
            Some(mut sub) => {
                sub.handle.cancel();
                tracing::debug!(connection_id = %id, channel = %channel, "Subscription removed");
                true
            }
            None => false,
        }
    }

    /// Drop the connection and cancel every subscription it holds
    ///
    /// Returns the number of subscriptions cancelled.
    pub async fn remove_all(&self, id: ConnectionId) -> usize {
        let Some(entry) = self.connections.write().await.remove(&id) else {
            return 0;
        };

        let mut entry = entry.lock().await;
        entry.closed = true;
        let count = entry.subscriptions.len();
        for (_, mut sub) in entry.subscriptions.drain() {
            sub.handle.cancel();
        }

        tracing::debug!(connection_id = %id, subscriptions = count, "Connection removed");
        count
    }

    pub async fn contains(&self, id: ConnectionId, channel: &Channel) -> bool {
        match self.entry(id).await {
            Some(entry) => entry.lock().await.subscriptions.contains_key(channel),
            None => false,
        }
    }

    /// Subscriptions currently held by a connection
    pub async fn subscriptions(&self, id: ConnectionId) -> Vec<Subscription> {
        match self.entry(id).await {
            Some(entry) => entry
                .lock()
                .await
                .subscriptions
                .values()
                .map(|s| s.info.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    pub async fn subscription_count(&self, id: ConnectionId) -> usize {
        match self.entry(id).await {
            Some(entry) => entry.lock().await.subscriptions.len(),
            None => 0,
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    async fn entry(&self, id: ConnectionId) -> Option<Arc<Mutex<ConnectionEntry>>> {
        self.connections.read().await.get(&id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerEvent, InMemoryBroker, PubSub};
    use crate::envelope::Envelope;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn channel(raw: &str) -> Channel {
        Channel::parse(raw).unwrap()
    }

    fn subscribe_with(
        broker: &InMemoryBroker,
        channel: &Channel,
        calls: &Arc<AtomicUsize>,
    ) -> impl Future<Output = AdapterResult<SubscriptionHandle>> {
        let broker = broker.clone();
        let channel = channel.clone();
        let calls = Arc::clone(calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            broker.subscribe(&channel, Box::new(|_| {})).await
        }
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let registry = SubscriptionRegistry::new(2);
        registry.register(Uuid::new_v4()).await.unwrap();
        registry.register(Uuid::new_v4()).await.unwrap();

        let result = registry.register(Uuid::new_v4()).await;
        assert_eq!(result, Err(AdapterError::TooManyConnections(2)));
        assert_eq!(registry.connection_count().await, 2);
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let broker = InMemoryBroker::default();
        let registry = SubscriptionRegistry::new(10);
        let id = Uuid::new_v4();
        registry.register(id).await.unwrap();

        let alerts = channel("alerts");
        let calls = Arc::new(AtomicUsize::new(0));

        let first = registry
            .add(id, &alerts, || subscribe_with(&broker, &alerts, &calls))
            .await
            .unwrap();
        let second = registry
            .add(id, &alerts, || subscribe_with(&broker, &alerts, &calls))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.subscription_count(), 1);
        assert_eq!(registry.subscription_count(id).await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_adds_create_one_subscription() {
        let broker = InMemoryBroker::default();
        let registry = SubscriptionRegistry::new(10);
        let id = Uuid::new_v4();
        registry.register(id).await.unwrap();

        let alerts = channel("alerts");
        let calls = Arc::new(AtomicUsize::new(0));

        let (a, b) = tokio::join!(
            registry.add(id, &alerts, || subscribe_with(&broker, &alerts, &calls)),
            registry.add(id, &alerts, || subscribe_with(&broker, &alerts, &calls)),
        );

        assert_eq!(a.unwrap().id, b.unwrap().id);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.subscription_count(), 1);
    }

    #[tokio::test]
    async fn test_remove_cancels_handle() {
        let broker = InMemoryBroker::default();
        let registry = SubscriptionRegistry::new(10);
        let id = Uuid::new_v4();
        registry.register(id).await.unwrap();

        let alerts = channel("alerts");
        let calls = Arc::new(AtomicUsize::new(0));
        registry
            .add(id, &alerts, || subscribe_with(&broker, &alerts, &calls))
            .await
            .unwrap();
        assert!(registry.contains(id, &alerts).await);

        assert!(registry.remove(id, &alerts).await);
        assert!(!registry.remove(id, &alerts).await);
        assert!(!registry.contains(id, &alerts).await);
        assert_eq!(broker.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_remove_all_stops_deliveries() {
        let broker = InMemoryBroker::default();
        let registry = SubscriptionRegistry::new(10);
        let id = Uuid::new_v4();
        registry.register(id).await.unwrap();

        let delivered = Arc::new(AtomicUsize::new(0));
        for raw in ["alerts", "temperature/room1"] {
            let ch = channel(raw);
            let sub_ch = ch.clone();
            let counter = Arc::clone(&delivered);
            let b = broker.clone();
            registry
                .add(id, &ch, || async move {
                    b.subscribe(
                        &sub_ch,
                        Box::new(move |event| {
                            if let BrokerEvent::Message(_) = event {
                                counter.fetch_add(1, Ordering::SeqCst);
                            }
                        }),
                    )
                    .await
                })
                .await
                .unwrap();
        }

        assert_eq!(registry.remove_all(id).await, 2);
        assert_eq!(registry.connection_count().await, 0);
        assert_eq!(broker.subscription_count(), 0);

        let env = Envelope::new(channel("alerts"), "thing-x", "text/plain", b"late".to_vec());
        broker.publish(&env).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_add_after_remove_all_fails() {
        let broker = InMemoryBroker::default();
        let registry = SubscriptionRegistry::new(10);
        let id = Uuid::new_v4();
        registry.register(id).await.unwrap();
        registry.remove_all(id).await;

        let alerts = channel("alerts");
        let calls = Arc::new(AtomicUsize::new(0));
        let result = registry
            .add(id, &alerts, || subscribe_with(&broker, &alerts, &calls))
            .await;

        assert_eq!(result, Err(AdapterError::ConnectionClosed));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(broker.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_subscribe_leaves_no_entry() {
        let broker = InMemoryBroker::default();
        let registry = SubscriptionRegistry::new(10);
        let id = Uuid::new_v4();
        registry.register(id).await.unwrap();
        broker.disconnect();

        let alerts = channel("alerts");
        let calls = Arc::new(AtomicUsize::new(0));
        let result = registry
            .add(id, &alerts, || subscribe_with(&broker, &alerts, &calls))
            .await;

        assert!(matches!(result, Err(AdapterError::BrokerUnavailable(_))));
        assert!(!registry.contains(id, &alerts).await);
    }
}
