use super::*;
use crate::config::BackpressurePolicy;
use crate::connection::MemoryConnector;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(60), future)
        .await
        .expect("timed out waiting for the bus")
}

fn bus_with(connector: &MemoryConnector) -> MessageBus {
    MessageBus::new(BusConfig::for_test(), connector.clone())
}

async fn wait_connected(bus: &MessageBus) {
    let mut states = bus.watch_state();
    within(states.wait_for(|state| *state == ConnectionState::Connected))
        .await
        .unwrap();
}

// ============================================================================
// Publish
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_publish_before_open_is_queued() {
    let connector = MemoryConnector::new();
    let bus = bus_with(&connector);

    assert_eq!(bus.publish("mount/slew", &1).unwrap(), PublishOutcome::Queued);
    assert_eq!(bus.queued_len(), 1);
    assert!(connector.sent_frames().is_empty());

    bus.open().unwrap();
    within(connector.wait_for_sent(1)).await;

    assert_eq!(connector.sent_text(), vec![r#"{"topic":"mount/slew","payload":1}"#]);
    assert_eq!(bus.queued_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_publish_when_live_is_sent() {
    let connector = MemoryConnector::new();
    let bus = bus_with(&connector);
    bus.open().unwrap();
    wait_connected(&bus).await;
    // Let the pump process the connect and go live
    within(async {
        while bus.publish("probe", &Value::Null).unwrap() != PublishOutcome::Sent {
            tokio::task::yield_now().await;
        }
    })
    .await;

    assert_eq!(bus.publish("t", &"x").unwrap(), PublishOutcome::Sent);
    assert_eq!(bus.stats().sent, bus.stats().published);
}

#[tokio::test(start_paused = true)]
async fn test_publish_empty_topic_rejected() {
    let bus = bus_with(&MemoryConnector::new());
    assert!(matches!(
        bus.publish("", &1),
        Err(PublishError::InvalidTopic(_))
    ));
    assert_eq!(bus.queued_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_publish_serialize_error_surfaces() {
    use std::collections::HashMap;

    let bus = bus_with(&MemoryConnector::new());
    let mut bad: HashMap<(u8, u8), u8> = HashMap::new();
    bad.insert((1, 2), 3);

    assert!(matches!(
        bus.publish("t", &bad),
        Err(PublishError::Serialize(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_publish_envelope_keeps_metadata() {
    let connector = MemoryConnector::new();
    let bus = bus_with(&connector);
    let envelope = Envelope::new("camera/exposure", serde_json::json!({"seconds": 30}))
        .unwrap()
        .with_id("exp-1");

    bus.publish_envelope(envelope.clone()).unwrap();
    bus.open().unwrap();
    within(connector.wait_for_sent(1)).await;

    let sent = JsonCodec.decode(&connector.sent_frames()[0]).unwrap();
    assert_eq!(sent, envelope);
}

#[tokio::test(start_paused = true)]
async fn test_zero_capacity_rejects_while_disconnected() {
    let mut config = BusConfig::for_test();
    config.outbound_queue_capacity = 0;
    config.backpressure_policy = BackpressurePolicy::DropOldest;
    let bus = MessageBus::new(config, MemoryConnector::new());

    assert!(matches!(
        bus.publish("t", &1),
        Err(PublishError::QueueFull(QueueFull { capacity: 0 }))
    ));
    assert_eq!(bus.stats().rejected, 1);
}

// ============================================================================
// Outbound middleware
// ============================================================================

struct DropOutboundDebug;

impl Middleware for DropOutboundDebug {
    fn name(&self) -> &str {
        "drop-debug"
    }

    fn applies_to(&self, direction: Direction) -> bool {
        direction == Direction::Outbound
    }

    fn handle(
        &self,
        envelope: Envelope,
        _direction: Direction,
        next: Next<'_>,
    ) -> std::result::Result<Flow, MiddlewareError> {
        if envelope.topic().starts_with("debug/") {
            return Ok(Flow::Halt);
        }
        next.run(envelope)
    }
}

#[tokio::test(start_paused = true)]
async fn test_outbound_middleware_filters_and_rejects() {
    let bus = bus_with(&MemoryConnector::new());
    bus.use_middleware(DropOutboundDebug);
    bus.use_middleware(
        ValidationMiddleware::new()
            .with_validator("focuser/move", RequiredFields::new(["steps"]))
            .validate_outbound(true),
    );

    assert_eq!(
        bus.publish("debug/trace", &1).unwrap(),
        PublishOutcome::Filtered
    );
    assert!(matches!(
        bus.publish("focuser/move", &serde_json::json!({"speed": 2})),
        Err(PublishError::Rejected(MiddlewareError::Validation { .. }))
    ));
    assert_eq!(
        bus.publish("focuser/move", &serde_json::json!({"steps": 200})).unwrap(),
        PublishOutcome::Queued
    );
    assert_eq!(bus.queued_len(), 1);
    assert_eq!(bus.stats().middleware_rejections, 2);
}

// ============================================================================
// Inbound
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_inbound_dispatch_and_typed_subscription() {
    #[derive(serde::Deserialize)]
    struct Focuser {
        position: u32,
    }

    let connector = MemoryConnector::new();
    let bus = bus_with(&connector);
    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe_payload("focuser/status", move |status: Focuser| {
        let _ = tx.send(status.position);
        Ok(())
    })
    .unwrap();

    bus.open().unwrap();
    wait_connected(&bus).await;
    connector.inject(r#"{"topic":"focuser/status","payload":{"position":4100}}"#.as_bytes().to_vec());

    assert_eq!(within(rx.recv()).await, Some(4100));
}

#[tokio::test(start_paused = true)]
async fn test_decode_error_counted_and_connection_kept() {
    let connector = MemoryConnector::new();
    let bus = bus_with(&connector);
    let (_, mut rx) = bus.subscribe_channel("t").unwrap();

    bus.open().unwrap();
    wait_connected(&bus).await;
    connector.inject(b"garbage".to_vec());
    connector.inject(br#"{"topic":"t","payload":"ok"}"#.to_vec());

    let envelope = within(rx.recv()).await.unwrap();
    assert_eq!(envelope.payload(), &Value::from("ok"));
    assert_eq!(bus.stats().decode_errors, 1);
    assert_eq!(bus.state(), ConnectionState::Connected);
    assert_eq!(connector.connect_attempts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_handler_errors_counted() {
    let connector = MemoryConnector::new();
    let bus = bus_with(&connector);
    bus.subscribe("t", |_: &Envelope| Err(HandlerError::failed("nope")))
        .unwrap();
    let (_, mut rx) = bus.subscribe_channel("t").unwrap();

    bus.open().unwrap();
    wait_connected(&bus).await;
    connector.inject(br#"{"topic":"t"}"#.to_vec());

    within(rx.recv()).await.unwrap();
    let stats = bus.stats();
    assert_eq!(stats.handler_errors, 1);
    assert_eq!(stats.delivered, 1);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_open_without_runtime() {
    let bus = bus_with(&MemoryConnector::new());
    assert!(matches!(
        bus.open(),
        Err(BusError::Connection(ConnectionError::NoRuntime))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_close_is_idempotent_and_rejects_further_use() {
    let connector = MemoryConnector::new();
    let bus = bus_with(&connector);
    bus.publish("t", &1).unwrap();

    bus.close();
    bus.close();

    assert_eq!(bus.state(), ConnectionState::Closed);
    assert_eq!(bus.queued_len(), 0);
    assert!(matches!(bus.publish("t", &2), Err(PublishError::BusClosed)));
    assert!(matches!(
        bus.subscribe("t", |_: &Envelope| Ok(())),
        Err(BusError::Closed)
    ));
    assert!(matches!(bus.open(), Err(BusError::Closed)));
    assert!(connector.connect_attempts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_close_from_handler_stops_dispatch() {
    let connector = MemoryConnector::new();
    let bus = bus_with(&connector);
    let (tx, mut rx) = mpsc::unbounded_channel();
    {
        let bus_ref = bus.clone();
        bus.subscribe("t", move |envelope: &Envelope| {
            let _ = tx.send(envelope.payload().clone());
            bus_ref.close();
            Ok(())
        })
        .unwrap();
    }

    bus.open().unwrap();
    wait_connected(&bus).await;
    connector.inject(br#"{"topic":"t","payload":1}"#.to_vec());
    connector.inject(br#"{"topic":"t","payload":2}"#.to_vec());

    assert_eq!(within(rx.recv()).await, Some(Value::from(1)));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(bus.state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_and_clear_topic_through_bus() {
    let bus = bus_with(&MemoryConnector::new());
    let a = bus.subscribe("t", |_: &Envelope| Ok(())).unwrap();
    bus.subscribe("t", |_: &Envelope| Ok(())).unwrap();

    bus.unsubscribe(a);
    bus.unsubscribe(a);
    assert_eq!(bus.subscriber_count("t"), 1);

    bus.clear_topic("t");
    assert_eq!(bus.subscriber_count("t"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_channel_receiver_unsubscribes() {
    let connector = MemoryConnector::new();
    let bus = bus_with(&connector);
    let (_, dropped) = bus.subscribe_channel("t").unwrap();
    let (_, mut kept) = bus.subscribe_channel("t").unwrap();
    drop(dropped);
    assert_eq!(bus.subscriber_count("t"), 2);

    bus.open().unwrap();
    wait_connected(&bus).await;
    connector.inject(br#"{"topic":"t","payload":1}"#.to_vec());

    assert_eq!(within(kept.recv()).await.unwrap().payload(), &Value::from(1));
    assert_eq!(bus.subscriber_count("t"), 1);
    assert_eq!(bus.stats().handler_errors, 0);
}

#[cfg(feature = "websocket")]
#[test]
fn test_websocket_requires_endpoint() {
    let config = BusConfig::default();
    assert!(matches!(
        MessageBus::websocket(config),
        Err(BusError::Config(_))
    ));

    let config = BusConfig {
        endpoint: Some("tcp://nope".to_string()),
        ..BusConfig::default()
    };
    assert!(matches!(
        MessageBus::websocket(config),
        Err(BusError::Connection(ConnectionError::Connect(_)))
    ));
}
