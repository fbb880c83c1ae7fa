//! Error taxonomy for the messaging and event fabric.

use std::time::Duration;

/// Unified error type for transport, messaging, and event-service operations.
#[derive(Debug, thiserror::Error)]
pub enum ConexusError {
    /// The backend is unreachable or a publish/connect attempt failed.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// A message value could not be encoded to the wire format.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Bytes received could not be decoded into a known message variant.
    #[error("deserialization error: {0}")]
    DeserializationError(String),

    /// A received `NetworkEventMessage` named a type with no registry entry.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    /// The circuit breaker is open and graceful degradation is disabled.
    #[error("circuit breaker open ({failure_count} failures, open for {open_duration:?})")]
    CircuitBreakerOpen { failure_count: usize, open_duration: Duration },

    /// A request/response exchange or bounded operation did not complete in time.
    #[error("operation timed out after {elapsed:?} (limit {timeout:?})")]
    Timeout { elapsed: Duration, timeout: Duration },

    /// A response arrived but did not match the type the requester expected.
    #[error("protocol mismatch: expected {expected}, got {actual}")]
    ProtocolMismatch { expected: String, actual: String },

    /// The operation, or an outstanding retry, was cancelled by shutdown or the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// The service has not completed `initialize()`, or has already been shut down.
    #[error("service is not initialized")]
    NotInitialized,

    /// The concurrent-event limit (`maxConcurrentEvents`) was exceeded.
    #[error("overloaded: {in_flight} in flight, max {max}")]
    Overloaded { in_flight: usize, max: usize },

    /// Configuration failed validation at construction time.
    #[error("invalid configuration: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl ConexusError {
    pub fn is_transport_unavailable(&self) -> bool {
        matches!(self, Self::TransportUnavailable(_))
    }

    pub fn is_serialization(&self) -> bool {
        matches!(self, Self::SerializationError(_))
    }

    pub fn is_deserialization(&self) -> bool {
        matches!(self, Self::DeserializationError(_))
    }

    pub fn is_unknown_event_type(&self) -> bool {
        matches!(self, Self::UnknownEventType(_))
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitBreakerOpen { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_protocol_mismatch(&self) -> bool {
        matches!(self, Self::ProtocolMismatch { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_not_initialized(&self) -> bool {
        matches!(self, Self::NotInitialized)
    }

    pub fn is_overloaded(&self) -> bool {
        matches!(self, Self::Overloaded { .. })
    }
}
