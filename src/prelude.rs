//! Convenient re-exports for common Conexus types.
pub use crate::{
    Backoff, Bulkhead, CircuitBreaker, CircuitState, Clock, Config, ConfigBuilder, ConfigError,
    ConexusError, CrossServerEventService, CustomEventDecoder, DataUpdate, EventRegistry,
    HandlerId, ListenerId, ManualClock, MessageMeta, MessagingService, Metrics, MetricsSnapshot,
    MonotonicClock, NetworkEvent, NetworkEventMessage, NodeId, Priority, Request, RetryManager,
    Response, Sleeper, SimpleText, StatusEvent, Transport, WireMessage, ANY_TYPE,
    DATA_UPDATE_TAG, NETWORK_EVENT_TAG, REQUEST_TAG, RESPONSE_TAG, SIMPLE_TEXT_TAG,
};
