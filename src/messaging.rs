//! Typed pub/sub and request/response messaging over a [`Transport`].

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::codec::{decode, encode, WireMessage};
use crate::error::ConexusError;
use crate::event_registry::EventRegistry;
use crate::message::{MessageMeta, NodeId, Request, Response, SimpleText};
use crate::transport::{direct_channel, MessageHandler, SubscriptionId, Transport, BROADCAST_CHANNEL};

/// Handle returned by `register_handler`, passed back to `unregister_handler`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(WireMessage) + Send + Sync>;

/// Wildcard type key: a handler registered under this key stands in for
/// "supertype of every variant" since `WireMessage` variants have no runtime
/// type hierarchy to reflect on. Falls back to this only when no handler is
/// registered for the message's exact `type_tag()`.
pub const ANY_TYPE: &str = "*";

struct Inner {
    transport: Arc<dyn Transport>,
    node_id: NodeId,
    registry: Arc<EventRegistry>,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<Response>>>,
    /// Handlers keyed by the wire variant's `type_tag()`, not by channel:
    /// a handler registered for a type fires on any reserved channel
    /// (direct or broadcast) carrying that type.
    handlers: RwLock<HashMap<String, HashMap<u64, Handler>>>,
    /// Channel name -> (subscription, expected type tag). `None` means the
    /// channel carries any variant (used for the reserved direct/broadcast
    /// channels); `Some(tag)` is a typed pub/sub channel that drops messages
    /// of any other variant.
    channel_subscriptions: Mutex<HashMap<String, (SubscriptionId, Option<String>)>>,
    next_handler_id: AtomicU64,
}

/// Node-to-node messaging: direct delivery, broadcast, arbitrary named
/// channels, and correlated request/response.
#[derive(Clone)]
pub struct MessagingService {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MessagingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingService").field("node_id", &self.inner.node_id).finish()
    }
}

impl MessagingService {
    pub fn new(transport: Arc<dyn Transport>, node_id: NodeId, registry: Arc<EventRegistry>) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                node_id,
                registry,
                pending: Mutex::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                channel_subscriptions: Mutex::new(HashMap::new()),
                next_handler_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.inner.node_id
    }

    pub fn registry(&self) -> &Arc<EventRegistry> {
        &self.inner.registry
    }

    /// Connect the transport and subscribe to this node's direct channel and
    /// the shared broadcast channel.
    pub async fn start(&self) -> Result<(), ConexusError> {
        self.inner.transport.connect().await?;
        self.create_channel(&direct_channel(&self.inner.node_id), None).await?;
        self.create_channel(BROADCAST_CHANNEL, None).await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<(), ConexusError> {
        let channels: Vec<(String, SubscriptionId)> = {
            let mut map = self.inner.channel_subscriptions.lock().expect("MessagingService.shutdown: lock poisoned");
            map.drain().map(|(channel, (sub, _))| (channel, sub)).collect()
        };
        for (channel, sub) in channels {
            self.inner.transport.unsubscribe(&channel, sub).await?;
        }
        self.inner.transport.disconnect().await
    }

    /// Subscribe to `channel`. `expected_type_tag` is `None` for the reserved
    /// direct/broadcast channels (any variant may arrive); `Some(tag)` makes
    /// `channel` a typed pub/sub channel that drops any message whose
    /// `type_tag()` doesn't match. Idempotent: re-creating an
    /// already-subscribed channel is a no-op.
    pub async fn create_channel(&self, channel: &str, expected_type_tag: Option<&str>) -> Result<(), ConexusError> {
        {
            let map = self.inner.channel_subscriptions.lock().expect("MessagingService.create_channel: lock poisoned");
            if map.contains_key(channel) {
                return Ok(());
            }
        }

        let inner = self.inner.clone();
        let channel_name = channel.to_string();
        let handler: MessageHandler = Arc::new(move |bytes| {
            inner.clone().dispatch_incoming(&channel_name, bytes);
        });

        let subscription = self.inner.transport.subscribe(channel, handler).await?;
        self.inner
            .channel_subscriptions
            .lock()
            .expect("MessagingService.create_channel: lock poisoned")
            .insert(channel.to_string(), (subscription, expected_type_tag.map(str::to_string)));
        tracing::debug!(channel, expected_type = expected_type_tag, "messaging service: channel created");
        Ok(())
    }

    /// Register `handler` for every inbound message whose `type_tag()`
    /// equals `type_tag`, across both the direct and broadcast channels.
    /// Pass [`ANY_TYPE`] to register a catch-all consulted only when no
    /// handler is registered for a message's exact type.
    pub fn register_handler<F>(&self, type_tag: &str, handler: F) -> HandlerId
    where
        F: Fn(WireMessage) + Send + Sync + 'static,
    {
        let id = self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .write()
            .expect("MessagingService.register_handler: lock poisoned")
            .entry(type_tag.to_string())
            .or_default()
            .insert(id, Arc::new(handler));
        HandlerId(id)
    }

    pub fn unregister_handler(&self, type_tag: &str, id: HandlerId) {
        if let Some(map) = self.inner.handlers.write().expect("MessagingService.unregister_handler: lock poisoned").get_mut(type_tag) {
            map.remove(&id.0);
        }
    }

    pub async fn send_to_node(&self, target: &NodeId, content: impl Into<String>, category: impl Into<String>) -> Result<(), ConexusError> {
        let message = WireMessage::SimpleText(SimpleText {
            meta: MessageMeta::new(self.inner.node_id.clone()),
            content: content.into(),
            category: category.into(),
        });
        let bytes = encode(&message)?;
        self.inner.transport.publish(&direct_channel(target), bytes).await
    }

    pub async fn broadcast(&self, message: WireMessage) -> Result<(), ConexusError> {
        let bytes = encode(&message)?;
        self.inner.transport.publish(BROADCAST_CHANNEL, bytes).await
    }

    /// Send `payload` to `target` and await a correlated response within
    /// `timeout`. The response's `type_tag` must equal `expected_type_tag`.
    pub async fn send_request(
        &self,
        target: &NodeId,
        type_tag: impl Into<String>,
        payload: serde_json::Value,
        expected_type_tag: &str,
        timeout: Duration,
    ) -> Result<Response, ConexusError> {
        let request = Request { meta: MessageMeta::new(self.inner.node_id.clone()), type_tag: type_tag.into(), payload };
        let request_id = request.meta.message_id;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().expect("MessagingService.send_request: lock poisoned").insert(request_id, tx);

        let bytes = match encode(&WireMessage::Request(request)) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.inner.pending.lock().expect("MessagingService.send_request: lock poisoned").remove(&request_id);
                return Err(err);
            }
        };

        if let Err(err) = self.inner.transport.publish(&direct_channel(target), bytes).await {
            self.inner.pending.lock().expect("MessagingService.send_request: lock poisoned").remove(&request_id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => {
                if response.type_tag != expected_type_tag {
                    return Err(ConexusError::ProtocolMismatch {
                        expected: expected_type_tag.to_string(),
                        actual: response.type_tag,
                    });
                }
                Ok(response)
            }
            Ok(Err(_)) => Err(ConexusError::Cancelled),
            Err(_) => {
                self.inner.pending.lock().expect("MessagingService.send_request: lock poisoned").remove(&request_id);
                Err(ConexusError::Timeout { elapsed: timeout, timeout })
            }
        }
    }

    /// Reply to a request previously received via a handler.
    pub async fn send_response(&self, target: &NodeId, request_message_id: Uuid, type_tag: impl Into<String>, payload: serde_json::Value) -> Result<(), ConexusError> {
        let response = Response {
            meta: MessageMeta::new(self.inner.node_id.clone()),
            request_message_id,
            type_tag: type_tag.into(),
            payload,
        };
        let bytes = encode(&WireMessage::Response(response))?;
        self.inner.transport.publish(&direct_channel(target), bytes).await
    }
}

impl Inner {
    fn dispatch_incoming(self: Arc<Self>, channel: &str, bytes: Vec<u8>) {
        let message = match decode(&bytes) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(channel, error = %err, "messaging service: dropping undecodable message");
                return;
            }
        };

        if message.source_node_id() == &self.node_id {
            tracing::debug!(channel, "messaging service: dropping message looped back to origin");
            return;
        }

        let expected_type = self
            .channel_subscriptions
            .lock()
            .expect("MessagingService.dispatch_incoming: lock poisoned")
            .get(channel)
            .and_then(|(_, expected)| expected.clone());
        if let Some(expected) = &expected_type {
            if message.type_tag() != expected.as_str() {
                tracing::debug!(channel, expected, actual = message.type_tag(), "messaging service: dropping message of unexpected type on typed channel");
                return;
            }
        }

        if let WireMessage::Response(response) = &message {
            let waiter = self.pending.lock().expect("MessagingService.dispatch_incoming: lock poisoned").remove(&response.request_message_id);
            if let Some(tx) = waiter {
                let _ = tx.send(response.clone());
                return;
            }
        }

        let type_tag = message.type_tag();
        let handlers: Vec<Handler> = {
            let table = self.handlers.read().expect("MessagingService.dispatch_incoming: lock poisoned");
            table
                .get(type_tag)
                .or_else(|| table.get(ANY_TYPE))
                .map(|map| map.values().cloned().collect())
                .unwrap_or_default()
        };

        for handler in handlers {
            let message = message.clone();
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| handler(message)));
            if result.is_err() {
                tracing::warn!(channel, "messaging service: handler panicked, isolated");
            }
        }
    }
}
