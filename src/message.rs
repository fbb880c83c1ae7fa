//! Wire-level message and event types exchanged between nodes.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque, non-empty identifier for a node in the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Returns `None` if `id` is empty or all-whitespace.
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            None
        } else {
            Some(Self(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Relative importance of a broadcast event; higher ranks are not delivered
/// ahead of lower ones, but listeners and metrics can branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Envelope fields common to every message placed on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMeta {
    pub message_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub source_node_id: NodeId,
}

impl MessageMeta {
    pub fn new(source_node_id: NodeId) -> Self {
        Self { message_id: Uuid::new_v4(), timestamp: Utc::now(), source_node_id }
    }
}

/// A plain text message with an application-defined category tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleText {
    pub meta: MessageMeta,
    pub content: String,
    pub category: String,
}

/// A request expecting a correlated [`Response`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub meta: MessageMeta,
    pub type_tag: String,
    pub payload: serde_json::Value,
}

/// A response correlated to a [`Request`] by `request_message_id`, equal to
/// the originating request's `meta.message_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub meta: MessageMeta,
    pub request_message_id: Uuid,
    pub type_tag: String,
    pub payload: serde_json::Value,
}

/// A decoded domain event carried inside a [`NetworkEventMessage`].
///
/// Implementors provide the metadata the cross-server event service needs to
/// route, log, and measure delivery without knowing the concrete event type.
/// `Any` lets the [`crate::event_registry::EventRegistry`] downcast back to
/// the concrete type to re-encode it without every caller matching on type
/// names by hand.
pub trait NetworkEvent: Send + Sync + fmt::Debug + std::any::Any {
    /// Registry key used to encode/decode this event type.
    fn event_type_name(&self) -> &str;

    /// NodeId of the domain originator, distinct from whichever node is
    /// currently relaying or broadcasting the event.
    fn source_node_id(&self) -> &NodeId;

    /// Instant the domain event was created.
    fn timestamp(&self) -> DateTime<Utc>;

    /// Upcast to `&dyn Any` for registry-side downcasting. Implement as
    /// `self`; a default can't be provided generically for trait objects.
    fn as_any(&self) -> &dyn std::any::Any;

    fn metadata(&self) -> HashMap<String, String> {
        HashMap::new()
    }
}

/// Wire envelope wrapping one [`NetworkEvent`] for cross-node broadcast.
///
/// `original_node_id` is taken from the wrapped event's own
/// [`NetworkEvent::source_node_id`] at construction and must never be
/// overwritten by any relaying hop, even though `meta.source_node_id` (the
/// envelope's publisher) changes on every republish. This is what lets
/// [`crate::event_service::CrossServerEventService`] detect and drop a
/// message that looped back to its point of origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkEventMessage {
    pub meta: MessageMeta,
    pub event_type_name: String,
    pub event_payload: serde_json::Value,
    pub priority: Priority,
    pub original_node_id: NodeId,
}

impl NetworkEventMessage {
    /// `publisher_node_id` is whoever is putting this envelope on the wire
    /// right now; `original_node_id` is the domain event's true originator
    /// and may be a different node entirely once an envelope is relayed.
    pub fn new(
        publisher_node_id: NodeId,
        original_node_id: NodeId,
        event_type_name: impl Into<String>,
        event_payload: serde_json::Value,
        priority: Priority,
    ) -> Self {
        Self {
            meta: MessageMeta::new(publisher_node_id),
            event_type_name: event_type_name.into(),
            event_payload,
            priority,
            original_node_id,
        }
    }
}

/// Player-data synchronization update. The persistence service that owns
/// storage policy, TTL, and conflict resolution for this data is an external
/// collaborator; this type only carries the wire envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataUpdate {
    pub meta: MessageMeta,
    pub player_id: String,
    pub data_type: String,
    pub serialized_data: String,
    pub version: u64,
}

/// A concrete built-in event used in examples, demos, and integration tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub source: NodeId,
    pub status: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(source: NodeId, status: impl Into<String>, message: impl Into<String>) -> Self {
        Self { source, status: status.into(), message: message.into(), timestamp: Utc::now() }
    }
}

impl NetworkEvent for StatusEvent {
    fn event_type_name(&self) -> &str {
        "status"
    }

    fn source_node_id(&self) -> &NodeId {
        &self.source
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn metadata(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("source".to_string(), self.source.to_string());
        map.insert("status".to_string(), self.status.clone());
        map
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_rejects_empty_and_whitespace() {
        assert!(NodeId::new("").is_none());
        assert!(NodeId::new("   ").is_none());
        assert!(NodeId::new("node-1").is_some());
    }

    #[test]
    fn priority_orders_low_to_critical() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert!(Priority::High < Priority::Critical);
    }

    #[test]
    fn network_event_message_preserves_original_node_id() {
        let node = NodeId::new("node-a").unwrap();
        let msg = NetworkEventMessage::new(node.clone(), node.clone(), "status", serde_json::json!({}), Priority::Normal);
        assert_eq!(msg.original_node_id, node);
        assert_eq!(msg.meta.source_node_id, node);
    }

    #[test]
    fn network_event_message_original_node_id_can_differ_from_publisher() {
        let origin = NodeId::new("node-a").unwrap();
        let relay = NodeId::new("node-b").unwrap();
        let msg = NetworkEventMessage::new(relay.clone(), origin.clone(), "status", serde_json::json!({}), Priority::Normal);
        assert_eq!(msg.original_node_id, origin);
        assert_eq!(msg.meta.source_node_id, relay);
    }

    #[test]
    fn status_event_reports_its_type_name_and_metadata() {
        let event = StatusEvent::new(NodeId::new("node-a").unwrap(), "healthy", "all good");
        assert_eq!(event.event_type_name(), "status");
        assert_eq!(event.source_node_id().as_str(), "node-a");
        assert_eq!(event.metadata().get("status"), Some(&"healthy".to_string()));
    }
}
