//! Transport contract: the pub/sub + key-value surface a concrete backend
//! (NATS, Kafka, Redis, ...) must provide for [`crate::messaging::MessagingService`]
//! to run on top of it. This crate ships only [`crate::transport`]'s trait and
//! a reference in-memory implementation (`conexus-memory-transport`); no
//! production backend driver is in scope.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ConexusError;
use crate::message::NodeId;

/// Reserved channel every node subscribes to for point-to-point delivery.
pub fn direct_channel(node: &NodeId) -> String {
    format!("direct:{node}")
}

/// Reserved channel `MessagingService::broadcast` publishes to.
pub const BROADCAST_CHANNEL: &str = "broadcast";

/// Invoked with the raw bytes of every message received on a subscribed
/// channel. Handlers run synchronously with respect to the transport's
/// delivery loop; long work should be handed off, not run inline.
pub type MessageHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Opaque handle returned by `subscribe`, passed back to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Backend-agnostic pub/sub + key-value contract.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<(), ConexusError>;
    async fn disconnect(&self) -> Result<(), ConexusError>;
    fn is_connected(&self) -> bool;

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), ConexusError>;
    async fn subscribe(&self, channel: &str, handler: MessageHandler) -> Result<SubscriptionId, ConexusError>;
    async fn unsubscribe(&self, channel: &str, subscription: SubscriptionId) -> Result<(), ConexusError>;

    async fn store(&self, key: &str, value: Vec<u8>) -> Result<(), ConexusError>;
    async fn store_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), ConexusError>;
    async fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, ConexusError>;
    async fn delete(&self, key: &str) -> Result<(), ConexusError>;
    async fn exists(&self, key: &str) -> Result<bool, ConexusError> {
        Ok(self.retrieve(key).await?.is_some())
    }
}

impl fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dyn Transport(connected={})", self.is_connected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_channel_uses_the_reserved_prefix() {
        let node = NodeId::new("node-a").unwrap();
        assert_eq!(direct_channel(&node), "direct:node-a");
    }
}
