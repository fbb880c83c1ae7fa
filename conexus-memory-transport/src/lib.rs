#![forbid(unsafe_code)]

//! In-process [`Transport`] implementation for tests, examples, and local
//! development: every `MemoryTransport` clone backed by the same `registry`
//! behaves like nodes sharing one broker, with no real network involved.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use conexus::{ConexusError, MessageHandler, SubscriptionId, Transport};

struct StoredValue {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct Registry {
    subscribers: Mutex<HashMap<String, Vec<(SubscriptionId, MessageHandler)>>>,
    store: Mutex<HashMap<String, StoredValue>>,
    next_subscription_id: AtomicU64,
}

/// Shared broker backing every connected [`MemoryTransport`] handle.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    registry: Arc<Registry>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a [`MemoryTransport`] handle sharing this broker's channels and
    /// key/value store.
    pub fn connect(&self) -> MemoryTransport {
        MemoryTransport { registry: self.registry.clone(), connected: Arc::new(AtomicBool::new(false)) }
    }
}

/// A connection to a [`MemoryBroker`]. Cheap to clone; all clones sharing the
/// same broker see each other's publishes and subscriptions.
#[derive(Clone)]
pub struct MemoryTransport {
    registry: Arc<Registry>,
    connected: Arc<AtomicBool>,
}

impl MemoryTransport {
    /// Stand up a transport on a brand-new, unshared broker.
    pub fn standalone() -> Self {
        MemoryBroker::new().connect()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<(), ConexusError> {
        self.connected.store(true, Ordering::Release);
        tracing::debug!("memory transport: connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ConexusError> {
        self.connected.store(false, Ordering::Release);
        tracing::debug!("memory transport: disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), ConexusError> {
        if !self.is_connected() {
            return Err(ConexusError::TransportUnavailable("not connected".to_string()));
        }

        let handlers: Vec<MessageHandler> = self
            .registry
            .subscribers
            .lock()
            .expect("MemoryTransport.publish: lock poisoned")
            .get(channel)
            .map(|subs| subs.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default();

        for handler in handlers {
            handler(payload.clone());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str, handler: MessageHandler) -> Result<SubscriptionId, ConexusError> {
        let id = SubscriptionId(self.registry.next_subscription_id.fetch_add(1, Ordering::Relaxed));
        self.registry
            .subscribers
            .lock()
            .expect("MemoryTransport.subscribe: lock poisoned")
            .entry(channel.to_string())
            .or_default()
            .push((id, handler));
        Ok(id)
    }

    async fn unsubscribe(&self, channel: &str, subscription: SubscriptionId) -> Result<(), ConexusError> {
        if let Some(subs) = self.registry.subscribers.lock().expect("MemoryTransport.unsubscribe: lock poisoned").get_mut(channel) {
            subs.retain(|(id, _)| *id != subscription);
        }
        Ok(())
    }

    async fn store(&self, key: &str, value: Vec<u8>) -> Result<(), ConexusError> {
        self.registry
            .store
            .lock()
            .expect("MemoryTransport.store: lock poisoned")
            .insert(key.to_string(), StoredValue { bytes: value, expires_at: None });
        Ok(())
    }

    async fn store_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), ConexusError> {
        self.registry
            .store
            .lock()
            .expect("MemoryTransport.store_with_ttl: lock poisoned")
            .insert(key.to_string(), StoredValue { bytes: value, expires_at: Some(Instant::now() + ttl) });
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, ConexusError> {
        let mut store = self.registry.store.lock().expect("MemoryTransport.retrieve: lock poisoned");
        match store.get(key) {
            Some(entry) if entry.expires_at.map(|at| Instant::now() >= at).unwrap_or(false) => {
                store.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.bytes.clone())),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), ConexusError> {
        self.registry.store.lock().expect("MemoryTransport.delete: lock poisoned").remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn publish_delivers_to_subscribers_on_a_shared_broker() {
        let broker = MemoryBroker::new();
        let publisher = broker.connect();
        let subscriber = broker.connect();
        publisher.connect().await.unwrap();
        subscriber.connect().await.unwrap();

        let received = Arc::new(AtomicUsize::new(0));
        let received_clone = received.clone();
        subscriber
            .subscribe("chat", Arc::new(move |_bytes| {
                received_clone.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();

        publisher.publish("chat", b"hello".to_vec()).await.unwrap();
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let transport = MemoryTransport::standalone();
        transport.connect().await.unwrap();

        let received = Arc::new(AtomicUsize::new(0));
        let received_clone = received.clone();
        let sub = transport
            .subscribe("chat", Arc::new(move |_| {
                received_clone.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();

        transport.unsubscribe("chat", sub).await.unwrap();
        transport.publish("chat", b"hi".to_vec()).await.unwrap();
        assert_eq!(received.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn publish_without_connecting_fails() {
        let transport = MemoryTransport::standalone();
        let err = transport.publish("chat", b"hi".to_vec()).await.unwrap_err();
        assert!(err.is_transport_unavailable());
    }

    #[tokio::test]
    async fn key_value_store_round_trips() {
        let transport = MemoryTransport::standalone();
        transport.store("k", b"v".to_vec()).await.unwrap();
        assert_eq!(transport.retrieve("k").await.unwrap(), Some(b"v".to_vec()));
        transport.delete("k").await.unwrap();
        assert_eq!(transport.retrieve("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn ttl_entries_expire() {
        let transport = MemoryTransport::standalone();
        transport.store_with_ttl("k", b"v".to_vec(), Duration::from_millis(20)).await.unwrap();
        assert_eq!(transport.retrieve("k").await.unwrap(), Some(b"v".to_vec()));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(transport.retrieve("k").await.unwrap(), None);
    }
}
