//! Stream Client Integration Tests
//!
//! Drives the client end to end over an in-memory transport: routing,
//! reconnection, unsubscribe semantics and monitor bookkeeping.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use common::{ScriptedTransport, client_with, next_session, wait_until};
use market_stream_client::{
    ClientError, ConnectionState, ConnectionStatus, MonitorRegistry, StreamMessage,
    TransportError, TransportEvent,
};

type Inbox = Arc<Mutex<Vec<StreamMessage>>>;

fn inbox() -> (Inbox, impl Fn(&StreamMessage) + Send + Sync + 'static) {
    let messages: Inbox = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&messages);
    (messages, move |message: &StreamMessage| {
        sink.lock().push(message.clone());
    })
}

fn approx(actual: f64, expected: f64) -> bool {
    (actual - expected).abs() < 1e-6
}

async fn wait_for_status(registry: &MonitorRegistry, stream: &str, status: ConnectionStatus) {
    wait_until(|| registry.get_monitor(stream).get_metrics().connection_status == status).await;
}

// =============================================================================
// Routing
// =============================================================================

#[tokio::test]
async fn test_single_stream_delivers_payload() {
    let (transport, mut sessions) = ScriptedTransport::new();
    let (client, registry) = client_with(transport, 5);
    let (messages, callback) = inbox();

    let _subscription = client.connect_to_stream("btcusdt@trade", callback).unwrap();
    let session = next_session(&mut sessions).await;
    assert_eq!(session.url, "wss://venue.test:9443/ws/btcusdt@trade");

    wait_for_status(&registry, "btcusdt@trade", ConnectionStatus::Connected).await;

    let frame = r#"{"e":"trade","p":"42000.10"}"#;
    session.text(frame);
    wait_until(|| messages.lock().len() == 1).await;

    let received = messages.lock()[0].clone();
    assert_eq!(received.stream, "btcusdt@trade");
    assert_eq!(received.data, json!({"e": "trade", "p": "42000.10"}));

    let metrics = registry.get_monitor("btcusdt@trade").get_metrics();
    assert_eq!(metrics.message_count, 1);
    assert_eq!(metrics.average_message_size, frame.len() as f64);
    assert!(metrics.last_message_received_at.is_some());
    assert!(metrics.last_connected_at.is_some());
}

#[tokio::test]
async fn test_combined_frames_route_by_envelope() {
    let (transport, mut sessions) = ScriptedTransport::new();
    let (client, registry) = client_with(transport, 5);
    let (messages, callback) = inbox();

    let subscription = client
        .connect_to_streams(&["ethusdt@trade", "btcusdt@depth"], callback)
        .unwrap();
    assert_eq!(subscription.streams(), ["ethusdt@trade", "btcusdt@depth"]);

    let session = next_session(&mut sessions).await;
    assert_eq!(
        session.url,
        "wss://venue.test:9443/stream?streams=ethusdt@trade/btcusdt@depth"
    );

    session.text(r#"{"stream":"ethusdt@trade","data":{"p":"3100.5"}}"#);
    session.text(r#"{"stream":"solusdt@trade","data":{"p":"1"}}"#);
    session.text(r#"{"result":null,"id":1}"#);
    session.text(r#"{"stream":"btcusdt@depth","data":{"b":[]}}"#);
    wait_until(|| messages.lock().len() == 2).await;

    let received = messages.lock().clone();
    assert_eq!(received[0].stream, "ethusdt@trade");
    assert_eq!(received[0].data, json!({"p": "3100.5"}));
    assert_eq!(received[1].stream, "btcusdt@depth");

    assert_eq!(registry.get_monitor("ethusdt@trade").get_metrics().message_count, 1);
    assert_eq!(registry.get_monitor("btcusdt@depth").get_metrics().message_count, 1);
    assert!(registry.find_monitor("solusdt@trade").is_none());
}

#[tokio::test]
async fn test_messages_arrive_in_order() {
    let (transport, mut sessions) = ScriptedTransport::new();
    let (client, _registry) = client_with(transport, 5);
    let (messages, callback) = inbox();

    let _subscription = client.connect_to_stream("btcusdt@trade", callback).unwrap();
    let session = next_session(&mut sessions).await;

    for i in 0..50 {
        session.text(&format!(r#"{{"seq":{i}}}"#));
    }
    wait_until(|| messages.lock().len() == 50).await;

    let sequence: Vec<i64> = messages
        .lock()
        .iter()
        .map(|m| m.data["seq"].as_i64().unwrap())
        .collect();
    assert_eq!(sequence, (0..50).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_malformed_frame_counts_error_without_delivery() {
    let (transport, mut sessions) = ScriptedTransport::new();
    let (client, registry) = client_with(transport, 5);
    let (messages, callback) = inbox();

    let _subscription = client.connect_to_stream("btcusdt@trade", callback).unwrap();
    let session = next_session(&mut sessions).await;

    session.text("{not json");
    session.text(r#"{"p":"1"}"#);
    wait_until(|| messages.lock().len() == 1).await;

    let metrics = registry.get_monitor("btcusdt@trade").get_metrics();
    assert_eq!(metrics.message_count, 1);
    assert_eq!(metrics.error_count, 1);
    assert!(metrics.last_error.is_some());
    assert_eq!(metrics.connection_status, ConnectionStatus::Connected);
}

#[tokio::test]
async fn test_pong_records_latency() {
    let (transport, mut sessions) = ScriptedTransport::new();
    let (client, registry) = client_with(transport, 5);
    let (_messages, callback) = inbox();

    let _subscription = client
        .connect_to_streams(&["a@trade", "b@trade"], callback)
        .unwrap();
    let session = next_session(&mut sessions).await;

    session.push(TransportEvent::Pong(Duration::from_millis(20)));
    session.push(TransportEvent::Pong(Duration::from_millis(40)));
    wait_until(|| approx(registry.get_monitor("b@trade").get_metrics().ping_latency, 40.0)).await;

    for stream in ["a@trade", "b@trade"] {
        let metrics = registry.get_monitor(stream).get_metrics();
        assert!(approx(metrics.ping_latency, 40.0));
        assert!(approx(metrics.average_latency, 30.0));
    }
}

// =============================================================================
// Callbacks
// =============================================================================

#[tokio::test]
async fn test_shared_connection_survives_partial_unsubscribe() {
    let (transport, mut sessions) = ScriptedTransport::new();
    let (client, _registry) = client_with(Arc::clone(&transport), 5);
    let (first, first_cb) = inbox();
    let (second, second_cb) = inbox();

    let sub_a = client.connect_to_stream("btcusdt@trade", first_cb).unwrap();
    let sub_b = client.connect_to_stream("btcusdt@trade", second_cb).unwrap();
    assert_eq!(sub_a.connection_id(), sub_b.connection_id());
    assert_eq!(client.connection_count(), 1);

    let session = next_session(&mut sessions).await;
    session.text(r#"{"n":1}"#);
    wait_until(|| first.lock().len() == 1 && second.lock().len() == 1).await;

    sub_a.unsubscribe();
    assert!(!sub_a.is_active());
    assert!(sub_b.is_active());

    session.text(r#"{"n":2}"#);
    wait_until(|| second.lock().len() == 2).await;

    assert_eq!(first.lock().len(), 1);
    assert_eq!(client.connection_count(), 1);
    assert_eq!(transport.connect_count(), 1);
}

#[tokio::test]
async fn test_unsubscribe_closes_idle_connection() {
    let (transport, mut sessions) = ScriptedTransport::new();
    let (client, registry) = client_with(transport, 5);
    let (messages, callback) = inbox();

    let subscription = client.connect_to_stream("btcusdt@trade", callback).unwrap();
    let session = next_session(&mut sessions).await;
    wait_for_status(&registry, "btcusdt@trade", ConnectionStatus::Connected).await;

    subscription.unsubscribe();
    subscription.unsubscribe();
    assert_eq!(client.connection_count(), 0);

    let (code, _) = session.closed().await;
    assert_eq!(code, 1000);
    wait_for_status(&registry, "btcusdt@trade", ConnectionStatus::Disconnected).await;
    assert!(messages.lock().is_empty());
}

#[tokio::test]
async fn test_unsubscribe_from_inside_callback() {
    let (transport, mut sessions) = ScriptedTransport::new();
    let (client, _registry) = client_with(transport, 5);

    let calls = Arc::new(Mutex::new(0_u32));
    let slot: Arc<OnceLock<market_stream_client::Subscription>> = Arc::new(OnceLock::new());

    let subscription = {
        let calls = Arc::clone(&calls);
        let slot = Arc::clone(&slot);
        client
            .connect_to_stream("btcusdt@trade", move |_| {
                *calls.lock() += 1;
                if let Some(subscription) = slot.get() {
                    subscription.unsubscribe();
                }
            })
            .unwrap()
    };
    slot.set(subscription).unwrap();

    let session = next_session(&mut sessions).await;
    session.text(r#"{"n":1}"#);
    session.text(r#"{"n":2}"#);

    let (code, _) = session.closed().await;
    assert_eq!(code, 1000);
    assert_eq!(*calls.lock(), 1);
    assert!(!slot.get().unwrap().is_active());
}

#[tokio::test]
async fn test_panicking_callback_is_isolated() {
    let (transport, mut sessions) = ScriptedTransport::new();
    let (client, registry) = client_with(transport, 5);
    let (messages, callback) = inbox();

    let _faulty = client
        .connect_to_stream("btcusdt@trade", |_| panic!("consumer bug"))
        .unwrap();
    let _healthy = client.connect_to_stream("btcusdt@trade", callback).unwrap();

    let session = next_session(&mut sessions).await;
    session.text(r#"{"n":1}"#);
    session.text(r#"{"n":2}"#);
    wait_until(|| messages.lock().len() == 2).await;

    let metrics = registry.get_monitor("btcusdt@trade").get_metrics();
    assert_eq!(metrics.message_count, 2);
    assert_eq!(metrics.connection_status, ConnectionStatus::Connected);
}

// =============================================================================
// Reconnection
// =============================================================================

#[tokio::test]
async fn test_transport_error_reconnects() {
    let (transport, mut sessions) = ScriptedTransport::new();
    let (client, registry) = client_with(Arc::clone(&transport), 5);
    let (messages, callback) = inbox();

    let _subscription = client.connect_to_stream("btcusdt@trade", callback).unwrap();
    let first = next_session(&mut sessions).await;
    wait_for_status(&registry, "btcusdt@trade", ConnectionStatus::Connected).await;

    first.push(TransportEvent::Error(TransportError::WebSocket(
        "connection reset".to_string(),
    )));
    let (code, _) = first.closed().await;
    assert_eq!(code, 4000);

    let second = next_session(&mut sessions).await;
    wait_for_status(&registry, "btcusdt@trade", ConnectionStatus::Connected).await;

    second.text(r#"{"after":"reconnect"}"#);
    wait_until(|| messages.lock().len() == 1).await;

    let metrics = registry.get_monitor("btcusdt@trade").get_metrics();
    assert_eq!(metrics.error_count, 1);
    assert!(metrics.last_error.unwrap().contains("connection reset"));
    assert_eq!(transport.connect_count(), 2);

    let info = client.connections();
    assert_eq!(info.len(), 1);
    assert_eq!(info[0].state, ConnectionState::Connected);
    assert_eq!(info[0].reconnect_attempts, 0);
}

#[tokio::test]
async fn test_remote_close_reconnects_without_error() {
    let (transport, mut sessions) = ScriptedTransport::new();
    let (client, registry) = client_with(transport, 5);
    let (_messages, callback) = inbox();

    let _subscription = client.connect_to_stream("btcusdt@trade", callback).unwrap();
    let first = next_session(&mut sessions).await;
    wait_for_status(&registry, "btcusdt@trade", ConnectionStatus::Connected).await;

    first.push(TransportEvent::Closed {
        code: Some(1001),
        reason: "going away".to_string(),
    });

    let _second = next_session(&mut sessions).await;
    wait_for_status(&registry, "btcusdt@trade", ConnectionStatus::Connected).await;
    assert_eq!(registry.get_monitor("btcusdt@trade").get_metrics().error_count, 0);
}

#[tokio::test]
async fn test_failed_connects_recover_and_reset_attempts() {
    let (transport, mut sessions) = ScriptedTransport::new();
    transport.fail_next(2);
    let (client, registry) = client_with(Arc::clone(&transport), 5);
    let (_messages, callback) = inbox();

    let _subscription = client.connect_to_stream("btcusdt@trade", callback).unwrap();
    let _session = next_session(&mut sessions).await;
    wait_for_status(&registry, "btcusdt@trade", ConnectionStatus::Connected).await;

    assert_eq!(transport.connect_count(), 3);
    assert_eq!(registry.get_monitor("btcusdt@trade").get_metrics().error_count, 2);
    assert_eq!(client.connections()[0].reconnect_attempts, 0);
}

#[tokio::test]
async fn test_gives_up_after_max_attempts() {
    let (transport, _sessions) = ScriptedTransport::new();
    transport.fail_next(u32::MAX);
    let (client, registry) = client_with(Arc::clone(&transport), 2);
    let (_messages, callback) = inbox();

    let subscription = client.connect_to_stream("btcusdt@trade", callback).unwrap();
    wait_until(|| client.connection_count() == 0).await;

    let metrics = registry.get_monitor("btcusdt@trade").get_metrics();
    assert_eq!(metrics.connection_status, ConnectionStatus::Error);
    assert_eq!(
        metrics.last_error.as_deref(),
        Some("maximum reconnection attempts (2) exceeded")
    );
    assert_eq!(transport.connect_count(), 3);

    // A failed connection no longer counts for reuse.
    subscription.unsubscribe();
    transport.fail_next(0);
    let (_messages, callback) = inbox();
    let retry = client.connect_to_stream("btcusdt@trade", callback).unwrap();
    assert_ne!(retry.connection_id(), subscription.connection_id());
}

// =============================================================================
// Close
// =============================================================================

#[tokio::test]
async fn test_close_disconnects_everything() {
    let (transport, mut sessions) = ScriptedTransport::new();
    let (client, registry) = client_with(transport, 5);
    let (_a, a_cb) = inbox();
    let (_b, b_cb) = inbox();

    let _sub_a = client.connect_to_stream("a@trade", a_cb).unwrap();
    let _sub_b = client.connect_to_stream("b@trade", b_cb).unwrap();
    let first = next_session(&mut sessions).await;
    let second = next_session(&mut sessions).await;
    wait_for_status(&registry, "a@trade", ConnectionStatus::Connected).await;
    wait_for_status(&registry, "b@trade", ConnectionStatus::Connected).await;

    client.close();
    client.close();
    assert!(client.is_closed());
    assert_eq!(client.connection_count(), 0);

    assert_eq!(first.closed().await.0, 1000);
    assert_eq!(second.closed().await.0, 1000);
    for stream in ["a@trade", "b@trade"] {
        assert_eq!(
            registry.get_monitor(stream).get_metrics().connection_status,
            ConnectionStatus::Disconnected
        );
    }

    let (_c, c_cb) = inbox();
    assert!(matches!(
        client.connect_to_stream("c@trade", c_cb),
        Err(ClientError::Closed)
    ));

    tokio::time::timeout(common::WAIT, client.shutdown())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_close_during_backoff_stops_reconnecting() {
    let (transport, _sessions) = ScriptedTransport::new();
    transport.fail_next(u32::MAX);
    let (client, registry) = client_with(Arc::clone(&transport), 0);
    let (_messages, callback) = inbox();

    let _subscription = client.connect_to_stream("btcusdt@trade", callback).unwrap();
    wait_until(|| transport.connect_count() >= 2).await;

    client.shutdown().await;
    let attempts = transport.connect_count();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(transport.connect_count(), attempts);
    assert_eq!(
        registry.get_monitor("btcusdt@trade").get_metrics().connection_status,
        ConnectionStatus::Disconnected
    );
}
