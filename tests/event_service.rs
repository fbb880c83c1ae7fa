//! End-to-end coverage of `CrossServerEventService` and `MessagingService`
//! over the in-memory reference transport: multi-node broadcast, loop
//! prevention, request/response, and circuit breaker behavior under
//! sustained failures.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use conexus::{
    Config, CrossServerEventService, EventRegistry, MessagingService, NetworkEvent, NodeId,
    Priority, StatusEvent, Transport,
};
use conexus_memory_transport::MemoryBroker;

fn node(id: &str) -> NodeId {
    NodeId::new(id).unwrap()
}

async fn service(broker: &MemoryBroker, id: &str, config: Config) -> CrossServerEventService {
    let registry = Arc::new(EventRegistry::new());
    registry.register::<StatusEvent>("status");
    let node_id = node(id);
    let messaging = MessagingService::new(Arc::new(broker.connect()), node_id.clone(), registry.clone());
    let service = CrossServerEventService::new(node_id, config, messaging, registry);
    service.initialize().await.unwrap();
    service
}

fn status(source: &str) -> Arc<dyn NetworkEvent> {
    Arc::new(StatusEvent::new(node(source), "healthy", "ok"))
}

#[tokio::test]
async fn broadcast_event_reaches_listeners_on_every_other_node() {
    let broker = MemoryBroker::new();
    let a = service(&broker, "node-a", Config::default()).await;
    let b = service(&broker, "node-b", Config::default()).await;
    let c = service(&broker, "node-c", Config::default()).await;

    let b_count = Arc::new(AtomicUsize::new(0));
    let c_count = Arc::new(AtomicUsize::new(0));
    let b_clone = b_count.clone();
    let c_clone = c_count.clone();
    b.register_event_listener("status", move |_event| {
        b_clone.fetch_add(1, Ordering::SeqCst);
    });
    c.register_event_listener("status", move |_event| {
        c_clone.fetch_add(1, Ordering::SeqCst);
    });

    a.broadcast_event(status("node-a"), Priority::Normal).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(b_count.load(Ordering::SeqCst), 1);
    assert_eq!(c_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn originating_node_does_not_receive_its_own_broadcast_back() {
    let broker = MemoryBroker::new();
    let a = service(&broker, "node-a", Config::default()).await;

    let a_count = Arc::new(AtomicUsize::new(0));
    let a_clone = a_count.clone();
    a.register_event_listener("status", move |_event| {
        a_clone.fetch_add(1, Ordering::SeqCst);
    });

    a.broadcast_event(status("node-a"), Priority::Normal).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Loop prevention drops it at the wire level; local fan-out is the only
    // path by which the originator observes its own event.
    assert_eq!(a_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn local_processing_can_be_disabled_independently_of_network_broadcast() {
    let broker = MemoryBroker::new();
    let config = Config::builder().enable_local_processing(false).build().unwrap();
    let a = service(&broker, "node-a", config).await;

    let a_count = Arc::new(AtomicUsize::new(0));
    let a_clone = a_count.clone();
    a.register_event_listener("status", move |_event| {
        a_clone.fetch_add(1, Ordering::SeqCst);
    });

    a.broadcast_event(status("node-a"), Priority::Normal).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(a_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn request_response_round_trips_between_two_nodes() {
    let broker = MemoryBroker::new();

    // Request/response correlation lives on MessagingService; exercise it
    // directly rather than through CrossServerEventService.
    let registry = Arc::new(EventRegistry::new());
    let node_a = node("req-a");
    let node_b = node("req-b");
    let messaging_a = MessagingService::new(Arc::new(broker.connect()), node_a.clone(), registry.clone());
    let messaging_b = MessagingService::new(Arc::new(broker.connect()), node_b.clone(), registry);
    messaging_a.start().await.unwrap();
    messaging_b.start().await.unwrap();

    messaging_b.register_handler(conexus::REQUEST_TAG, {
        let messaging_b = messaging_b.clone();
        move |message| {
            let conexus::WireMessage::Request(request) = message else {
                unreachable!("registered only for REQUEST_TAG dispatch")
            };
            let messaging_b = messaging_b.clone();
            tokio::spawn(async move {
                messaging_b
                    .send_response(&request.meta.source_node_id, request.meta.message_id, "pong", serde_json::json!({"ok": true}))
                    .await
                    .unwrap();
            });
        }
    });

    let response = messaging_a
        .send_request(&node_b, "ping", serde_json::json!({}), "pong", Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(response.payload, serde_json::json!({"ok": true}));
}

#[tokio::test]
async fn request_times_out_when_nobody_answers() {
    let broker = MemoryBroker::new();
    let registry = Arc::new(EventRegistry::new());
    let messaging = MessagingService::new(Arc::new(broker.connect()), node("lonely"), registry);
    messaging.start().await.unwrap();

    let err = messaging
        .send_request(&node("nobody"), "ping", serde_json::json!({}), "pong", Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
}

#[tokio::test]
async fn circuit_breaker_opens_after_repeated_broadcast_failures_and_degrades_gracefully() {
    let registry = Arc::new(EventRegistry::new());
    registry.register::<StatusEvent>("status");
    let node_id = node("flaky");
    let messaging = MessagingService::new(Arc::new(DeadTransport::default()), node_id.clone(), registry.clone());
    let config = Config::builder()
        .circuit_breaker_failure_threshold(2)
        .max_retry_attempts(1)
        .retry_delay(Duration::from_millis(1))
        .enable_graceful_degradation(true)
        .build()
        .unwrap();
    let service = CrossServerEventService::new(node_id, config, messaging, registry);
    service.initialize().await.unwrap();

    for _ in 0..3 {
        service.broadcast_event(status("flaky"), Priority::Normal).await.unwrap();
    }

    assert_eq!(service.breaker_state(), conexus::CircuitState::Open);
    let snapshot = service.snapshot_metrics();
    assert!(snapshot.broadcast_failures >= 2);
}

#[derive(Default)]
struct DeadTransport {
    connected: std::sync::atomic::AtomicBool,
}

#[async_trait::async_trait]
impl Transport for DeadTransport {
    async fn connect(&self) -> Result<(), conexus::ConexusError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }
    async fn disconnect(&self) -> Result<(), conexus::ConexusError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
    async fn publish(&self, _channel: &str, _payload: Vec<u8>) -> Result<(), conexus::ConexusError> {
        Err(conexus::ConexusError::TransportUnavailable("simulated outage".into()))
    }
    async fn subscribe(&self, _channel: &str, _handler: conexus::MessageHandler) -> Result<conexus::SubscriptionId, conexus::ConexusError> {
        Ok(conexus::SubscriptionId(0))
    }
    async fn unsubscribe(&self, _channel: &str, _subscription: conexus::SubscriptionId) -> Result<(), conexus::ConexusError> {
        Ok(())
    }
    async fn store(&self, _key: &str, _value: Vec<u8>) -> Result<(), conexus::ConexusError> {
        Ok(())
    }
    async fn store_with_ttl(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<(), conexus::ConexusError> {
        Ok(())
    }
    async fn retrieve(&self, _key: &str) -> Result<Option<Vec<u8>>, conexus::ConexusError> {
        Ok(None)
    }
    async fn delete(&self, _key: &str) -> Result<(), conexus::ConexusError> {
        Ok(())
    }
}

#[tokio::test]
async fn broadcast_propagates_error_when_graceful_degradation_disabled() {
    let node_id = node("strict");
    let registry = Arc::new(EventRegistry::new());
    registry.register::<StatusEvent>("status");
    let messaging = MessagingService::new(Arc::new(DeadTransport::default()), node_id.clone(), registry.clone());
    let config = Config::builder()
        .enable_graceful_degradation(false)
        .max_retry_attempts(1)
        .retry_delay(Duration::from_millis(1))
        .build()
        .unwrap();
    let service = CrossServerEventService::new(node_id, config, messaging, registry);
    service.initialize().await.unwrap();

    let err = service.broadcast_event(status("strict"), Priority::Normal).await.unwrap_err();
    assert!(err.is_transport_unavailable());
}

#[tokio::test]
async fn shutdown_then_broadcast_is_rejected_as_not_initialized() {
    let broker = MemoryBroker::new();
    let service = service(&broker, "node-a", Config::default()).await;
    service.shutdown().await.unwrap();

    let err = service.broadcast_event(status("node-a"), Priority::Normal).await.unwrap_err();
    assert!(err.is_not_initialized());
}
