//! Cross-server event broadcast: local listener fan-out plus a
//! circuit-breaker-and-retry-guarded network hop, with loop prevention and
//! graceful degradation when the network path is unhealthy.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use crate::bulkhead::Bulkhead;
use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::codec::{WireMessage, NETWORK_EVENT_TAG};
use crate::config::Config;
use crate::error::ConexusError;
use crate::event_registry::{CustomEventDecoder, EventRegistry};
use crate::message::{NetworkEvent, NetworkEventMessage, NodeId, Priority};
use crate::messaging::MessagingService;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::retry::RetryManager;

const STATE_CREATED: u8 = 0;
const STATE_INITIALIZED: u8 = 1;
const STATE_SHUTDOWN: u8 = 2;

type Listener = Arc<dyn Fn(Arc<dyn NetworkEvent>) + Send + Sync>;

/// Handle returned by `register_event_listener`, passed back to `unregister_event_listener`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Inner {
    node_id: NodeId,
    config: Config,
    messaging: MessagingService,
    registry: Arc<EventRegistry>,
    breaker: CircuitBreaker,
    retry: RetryManager,
    bulkhead: Bulkhead,
    metrics: Metrics,
    listeners: RwLock<HashMap<String, HashMap<u64, Listener>>>,
    next_listener_id: AtomicU64,
    state: AtomicU8,
}

/// Fleet-wide publish/subscribe for domain events, layered on top of
/// [`MessagingService`]'s broadcast channel.
#[derive(Clone)]
pub struct CrossServerEventService {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CrossServerEventService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossServerEventService")
            .field("node_id", &self.inner.node_id)
            .field("breaker_state", &self.breaker_state())
            .finish()
    }
}

impl CrossServerEventService {
    pub fn new(node_id: NodeId, config: Config, messaging: MessagingService, registry: Arc<EventRegistry>) -> Self {
        let breaker = CircuitBreaker::new(config.circuit_breaker_failure_threshold, config.circuit_breaker_timeout);
        let retry = RetryManager::new(
            config.max_retry_attempts,
            config.retry_delay,
            config.retry_backoff_multiplier,
            config.effective_retry_max_delay(),
        );
        let bulkhead = Bulkhead::new(config.max_concurrent_events);

        Self {
            inner: Arc::new(Inner {
                node_id,
                config,
                messaging,
                registry,
                breaker,
                retry,
                bulkhead,
                metrics: Metrics::new(),
                listeners: RwLock::new(HashMap::new()),
                next_listener_id: AtomicU64::new(1),
                state: AtomicU8::new(STATE_CREATED),
            }),
        }
    }

    /// Register a custom event variant, with an optional decoder consulted
    /// when its wire payload isn't a plain JSON object.
    pub fn register_event_type<T>(&self, type_name: impl Into<String>, decoder: Option<CustomEventDecoder>)
    where
        T: NetworkEvent + serde::Serialize + serde::de::DeserializeOwned + 'static,
    {
        self.inner.registry.register_with_decoder::<T>(type_name, decoder);
    }

    pub fn register_event_listener<F>(&self, type_name: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(Arc<dyn NetworkEvent>) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .write()
            .expect("CrossServerEventService.register_event_listener: lock poisoned")
            .entry(type_name.into())
            .or_default()
            .insert(id, Arc::new(listener));
        ListenerId(id)
    }

    pub fn unregister_event_listener(&self, type_name: &str, id: ListenerId) {
        if let Some(map) = self
            .inner
            .listeners
            .write()
            .expect("CrossServerEventService.unregister_event_listener: lock poisoned")
            .get_mut(type_name)
        {
            map.remove(&id.0);
        }
    }

    pub fn listener_count(&self, type_name: &str) -> usize {
        self.inner
            .listeners
            .read()
            .expect("CrossServerEventService.listener_count: lock poisoned")
            .get(type_name)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    pub fn total_listener_count(&self) -> usize {
        self.inner
            .listeners
            .read()
            .expect("CrossServerEventService.total_listener_count: lock poisoned")
            .values()
            .map(HashMap::len)
            .sum()
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.inner.breaker.state()
    }

    pub fn snapshot_metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot(self.breaker_state())
    }

    pub fn log_metrics(&self) {
        self.inner.metrics.log_current(self.breaker_state());
    }

    /// Connect messaging and start listening for inbound network events.
    /// Idempotent: calling `initialize` again after success is a no-op.
    pub async fn initialize(&self) -> Result<(), ConexusError> {
        if self.inner.state.load(Ordering::Acquire) == STATE_INITIALIZED {
            return Ok(());
        }

        self.inner.messaging.start().await?;

        let inner = self.inner.clone();
        self.inner.messaging.register_handler(NETWORK_EVENT_TAG, move |message| {
            inner.clone().handle_inbound(message);
        });

        self.inner.state.store(STATE_INITIALIZED, Ordering::Release);
        tracing::info!(node_id = %self.inner.node_id, "cross-server event service: initialized");
        Ok(())
    }

    /// Idempotent: shutting down twice, or before `initialize`, is a no-op.
    pub async fn shutdown(&self) -> Result<(), ConexusError> {
        if self.inner.state.swap(STATE_SHUTDOWN, Ordering::AcqRel) == STATE_SHUTDOWN {
            return Ok(());
        }

        self.inner.retry.shutdown().await;
        self.inner.messaging.shutdown().await?;
        tracing::info!(node_id = %self.inner.node_id, "cross-server event service: shut down");
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<(), ConexusError> {
        if self.inner.state.load(Ordering::Acquire) != STATE_INITIALIZED {
            return Err(ConexusError::NotInitialized);
        }
        Ok(())
    }

    /// Fan the event out to local listeners and, if enabled, to the rest of
    /// the fleet. The two phases run concurrently; a network failure only
    /// fails the call when graceful degradation is disabled.
    pub async fn broadcast_event(&self, event: Arc<dyn NetworkEvent>, priority: Priority) -> Result<(), ConexusError> {
        self.ensure_initialized()?;

        let start = Instant::now();
        let type_name = event.event_type_name().to_string();

        let local = {
            let this = self.clone();
            let event = event.clone();
            async move {
                if this.inner.config.enable_local_processing {
                    this.invoke_local_listeners(event).await;
                }
            }
        };

        let (_, network_result) = tokio::join!(local, self.broadcast_network(event, priority));

        self.inner.metrics.record_event_processed(&type_name, start.elapsed().as_nanos() as u64);
        if network_result.is_err() {
            self.inner.metrics.record_event_processing_failed(&type_name);
        }
        network_result
    }

    async fn invoke_local_listeners(&self, event: Arc<dyn NetworkEvent>) {
        let type_name = event.event_type_name().to_string();
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .read()
            .expect("CrossServerEventService.invoke_local_listeners: lock poisoned")
            .get(&type_name)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();

        let mut handles = Vec::with_capacity(listeners.len());
        for listener in listeners {
            let event = event.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                if std::panic::catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                    tracing::warn!("cross-server event service: listener panicked, isolated");
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn broadcast_network(&self, event: Arc<dyn NetworkEvent>, priority: Priority) -> Result<(), ConexusError> {
        if !self.inner.config.enable_cross_node_broadcast {
            return Ok(());
        }

        let payload = match self.inner.registry.encode_event(event.as_ref()) {
            Ok(payload) => payload,
            Err(err) => return self.degrade_or_propagate(err),
        };
        let envelope = NetworkEventMessage::new(
            self.inner.node_id.clone(),
            event.source_node_id().clone(),
            event.event_type_name(),
            payload,
            priority,
        );

        let _permit = match self.inner.bulkhead.try_acquire() {
            Ok(permit) => permit,
            Err(err) => return self.degrade_or_propagate(err),
        };

        if !self.inner.breaker.allow_request() {
            self.inner.metrics.record_circuit_breaker_open();
            let err = ConexusError::CircuitBreakerOpen {
                failure_count: self.inner.breaker.failure_count(),
                open_duration: self.inner.breaker.open_duration(),
            };
            return self.degrade_or_propagate(err);
        }

        let messaging = self.inner.messaging.clone();
        let metrics = &self.inner.metrics;
        let name = event.event_type_name().to_string();
        let result = self
            .inner
            .retry
            .execute_with_retry(&name, move || {
                let messaging = messaging.clone();
                let envelope = envelope.clone();
                metrics.record_retry_attempt();
                async move { messaging.broadcast(WireMessage::NetworkEvent(envelope)).await }
            })
            .await;

        match &result {
            Ok(()) => {
                self.inner.breaker.record_success();
                self.inner.metrics.record_broadcast_success();
            }
            Err(_) => {
                self.inner.breaker.record_failure();
                self.inner.metrics.record_broadcast_failure();
            }
        }

        result.or_else(|err| self.degrade_or_propagate(err))
    }

    fn degrade_or_propagate(&self, err: ConexusError) -> Result<(), ConexusError> {
        if self.inner.config.enable_graceful_degradation {
            tracing::warn!(error = %err, "cross-server event service: degrading to local-only delivery");
            Ok(())
        } else {
            Err(err)
        }
    }
}

impl Inner {
    /// Only ever invoked for `NETWORK_EVENT_TAG`-registered messages; the
    /// other arm is unreachable by construction, not a filter.
    fn handle_inbound(self: Arc<Self>, message: WireMessage) {
        let WireMessage::NetworkEvent(envelope) = message else {
            unreachable!("registered only for NETWORK_EVENT_TAG dispatch")
        };

        if envelope.original_node_id == self.node_id {
            tracing::debug!("cross-server event service: dropping event that looped back to its origin");
            return;
        }

        let registry = self.registry.clone();
        tokio::spawn(async move {
            match registry.decode_event(&envelope.event_type_name, &envelope.event_payload) {
                Ok(event) => {
                    let type_name = envelope.event_type_name.clone();
                    let listeners: Vec<Listener> = self
                        .listeners
                        .read()
                        .expect("CrossServerEventService.handle_inbound: lock poisoned")
                        .get(&type_name)
                        .map(|m| m.values().cloned().collect())
                        .unwrap_or_default();

                    for listener in listeners {
                        let event = event.clone();
                        let result =
                            tokio::task::spawn_blocking(move || std::panic::catch_unwind(AssertUnwindSafe(|| listener(event))))
                                .await;
                        if matches!(result, Ok(Err(_)) | Err(_)) {
                            tracing::warn!("cross-server event service: inbound listener panicked, isolated");
                        }
                    }
                }
                Err(err) => {
                    self.metrics.record_event_processing_failed(&envelope.event_type_name);
                    tracing::warn!(error = %err, type_name = envelope.event_type_name, "cross-server event service: failed to decode inbound event");
                }
            }
        });
    }
}
