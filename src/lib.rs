#![forbid(unsafe_code)]

//! # Conexus
//!
//! Cross-node event and message distribution for a fleet of cooperating game
//! servers: a backend-agnostic transport contract, a typed messaging service
//! with request/response correlation, and a cross-server event service with
//! circuit breaking, bounded retry, loop prevention, and graceful
//! degradation.
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use conexus::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ConexusError> {
//!     let registry = Arc::new(EventRegistry::new());
//!     registry.register::<StatusEvent>("status");
//!
//!     let node_id = NodeId::new("node-a").unwrap();
//!     # return Ok(());
//! }
//! ```

mod backoff;
mod bulkhead;
mod circuit_breaker;
mod clock;
mod codec;
mod config;
mod error;
mod event_registry;
mod event_service;
mod message;
mod messaging;
mod metrics;
mod retry;
mod sleeper;
mod transport;

pub use backoff::Backoff;
pub use bulkhead::{Bulkhead, BulkheadPermit};
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use codec::{
    decode, encode, WireMessage, DATA_UPDATE_TAG, NETWORK_EVENT_TAG, REQUEST_TAG, RESPONSE_TAG,
    SIMPLE_TEXT_TAG,
};
pub use config::{Config, ConfigBuilder, ConfigError};
pub use error::ConexusError;
pub use event_registry::{CustomEventDecoder, EventRegistry};
pub use event_service::{CrossServerEventService, ListenerId};
pub use message::{
    DataUpdate, MessageMeta, NetworkEvent, NetworkEventMessage, NodeId, Priority, Request,
    Response, SimpleText, StatusEvent,
};
pub use messaging::{HandlerId, MessagingService, ANY_TYPE};
pub use metrics::{Metrics, MetricsSnapshot};
pub use retry::{RetryManager, SHUTDOWN_GRACE_PERIOD};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use transport::{direct_channel, MessageHandler, SubscriptionId, Transport, BROADCAST_CHANNEL};

pub mod prelude;
