//! Bidirectional wire codec: a self-describing JSON envelope with a type
//! discriminator, so a subscriber on a shared channel can dispatch without
//! knowing which concrete message type is coming.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConexusError;
use crate::message::{DataUpdate, MessageMeta, NetworkEventMessage, NodeId, Request, Response, SimpleText};

/// Type-tag constants, shared between [`WireMessage::type_tag`] and callers
/// of [`crate::messaging::MessagingService::register_handler`] so a type
/// registered for dispatch can't drift from the wire discriminator.
pub const SIMPLE_TEXT_TAG: &str = "simple_text";
pub const REQUEST_TAG: &str = "request";
pub const RESPONSE_TAG: &str = "response";
pub const NETWORK_EVENT_TAG: &str = "network_event";
pub const DATA_UPDATE_TAG: &str = "data_update";

/// Any message type that can travel over a [`crate::transport::Transport`] channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    #[serde(rename = "simple_text")]
    SimpleText(SimpleText),
    #[serde(rename = "request")]
    Request(Request),
    #[serde(rename = "response")]
    Response(Response),
    #[serde(rename = "network_event")]
    NetworkEvent(NetworkEventMessage),
    #[serde(rename = "data_update")]
    DataUpdate(DataUpdate),
}

impl WireMessage {
    pub fn meta(&self) -> &MessageMeta {
        match self {
            WireMessage::SimpleText(m) => &m.meta,
            WireMessage::Request(m) => &m.meta,
            WireMessage::Response(m) => &m.meta,
            WireMessage::NetworkEvent(m) => &m.meta,
            WireMessage::DataUpdate(m) => &m.meta,
        }
    }

    pub fn message_id(&self) -> Uuid {
        self.meta().message_id
    }

    pub fn source_node_id(&self) -> &NodeId {
        &self.meta().source_node_id
    }

    /// Name of the wire variant, used in `ProtocolMismatch` errors and as the
    /// dispatch key for `MessagingService::register_handler`.
    pub fn type_tag(&self) -> &'static str {
        match self {
            WireMessage::SimpleText(_) => SIMPLE_TEXT_TAG,
            WireMessage::Request(_) => REQUEST_TAG,
            WireMessage::Response(_) => RESPONSE_TAG,
            WireMessage::NetworkEvent(_) => NETWORK_EVENT_TAG,
            WireMessage::DataUpdate(_) => DATA_UPDATE_TAG,
        }
    }
}

/// Encode a [`WireMessage`] to its JSON wire representation.
pub fn encode(message: &WireMessage) -> Result<Vec<u8>, ConexusError> {
    serde_json::to_vec(message).map_err(|e| ConexusError::SerializationError(e.to_string()))
}

/// Decode bytes received from a transport channel into a [`WireMessage`].
///
/// Unknown fields in the payload are tolerated (serde's default), but an
/// unrecognized `type` discriminator or malformed JSON is a
/// `DeserializationError`.
pub fn decode(bytes: &[u8]) -> Result<WireMessage, ConexusError> {
    serde_json::from_slice(bytes).map_err(|e| ConexusError::DeserializationError(e.to_string()))
}
