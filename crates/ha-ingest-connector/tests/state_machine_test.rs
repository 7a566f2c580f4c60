//! Connector state machine tests against a scripted in-process server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tokio_util::sync::CancellationToken;

use ha_ingest_connector::{ConnectorStatus, HaConnector};
use ha_ingest_core::config::HaConfig;
use ha_ingest_core::error::{IngestError, IngestResult};
use ha_ingest_core::events::{EventSink, RawEvent};
use ha_ingest_core::metrics::PipelineMetrics;

#[derive(Default)]
struct CollectingSink {
    events: Mutex<Vec<RawEvent>>,
}

#[async_trait]
impl EventSink for CollectingSink {
    async fn deliver(&self, event: RawEvent) -> IngestResult<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

impl CollectingSink {
    fn count(&self, kind: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }

    async fn wait_for(&self, kind: &str, n: usize, deadline: Duration) -> bool {
        let start = tokio::time::Instant::now();
        while start.elapsed() < deadline {
            if self.count(kind) >= n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

fn config(addr: std::net::SocketAddr) -> HaConfig {
    HaConfig {
        url: format!("ws://{}", addr),
        token: "good-token".to_string(),
        reconnect_delay: Duration::from_millis(20),
        connection_timeout: Duration::from_secs(5),
        heartbeat_timeout: Duration::from_secs(30),
    }
}

struct Harness {
    connector: tokio::task::JoinHandle<IngestResult<()>>,
    sink: Arc<CollectingSink>,
    metrics: Arc<PipelineMetrics>,
    status: Arc<ConnectorStatus>,
    shutdown: CancellationToken,
}

fn start_connector(addr: std::net::SocketAddr) -> Harness {
    let sink = Arc::new(CollectingSink::default());
    let metrics = Arc::new(PipelineMetrics::new().unwrap());
    let status = Arc::new(ConnectorStatus::new());
    let shutdown = CancellationToken::new();
    let connector = HaConnector::new(
        config(addr),
        Arc::clone(&sink) as Arc<dyn EventSink>,
        Arc::clone(&metrics),
        Arc::clone(&status),
        shutdown.clone(),
    );
    Harness {
        connector: tokio::spawn(connector.run()),
        sink,
        metrics,
        status,
        shutdown,
    }
}

type ServerWs = WebSocketStream<TcpStream>;

async fn accept_session(listener: &TcpListener) -> ServerWs {
    let (stream, _) = listener.accept().await.expect("accept");
    accept_async(stream).await.expect("websocket handshake")
}

async fn send_json(ws: &mut ServerWs, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string())).await.expect("send");
}

async fn read_json(ws: &mut ServerWs) -> serde_json::Value {
    loop {
        match ws.next().await.expect("frame").expect("frame ok") {
            Message::Text(text) => return serde_json::from_str(&text).expect("json"),
            Message::Ping(payload) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            _ => continue,
        }
    }
}

/// Walk a client through auth and subscription, answering its registry
/// snapshot requests with empty lists.
async fn handshake(ws: &mut ServerWs) {
    send_json(ws, json!({"type": "auth_required", "ha_version": "2024.1"})).await;

    let auth = read_json(ws).await;
    assert_eq!(auth["type"], "auth");
    assert_eq!(auth["access_token"], "good-token");
    send_json(ws, json!({"type": "auth_ok", "ha_version": "2024.1"})).await;

    let subscribe = read_json(ws).await;
    assert_eq!(subscribe["type"], "subscribe_events");
    assert_eq!(subscribe["event_type"], "state_changed");
    let sub_id = subscribe["id"].as_u64().unwrap();
    send_json(ws, json!({"id": sub_id, "type": "result", "success": true, "result": null})).await;

    for _ in 0..2 {
        let request = read_json(ws).await;
        let id = request["id"].as_u64().unwrap();
        send_json(ws, json!({"id": id, "type": "result", "success": true, "result": []})).await;
    }
}

fn state_changed(id: u64, entity_id: &str, state: &str) -> serde_json::Value {
    json!({
        "id": id,
        "type": "event",
        "event": {
            "event_type": "state_changed",
            "data": {
                "entity_id": entity_id,
                "old_state": {"state": "off"},
                "new_state": {"state": state}
            },
            "origin": "LOCAL",
            "time_fired": "2025-06-01T12:00:00+00:00"
        }
    })
}

#[tokio::test]
async fn authenticates_subscribes_and_streams_in_order() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let harness = start_connector(addr);

    let mut ws = accept_session(&listener).await;
    handshake(&mut ws).await;

    for n in 0..5 {
        send_json(&mut ws, state_changed(1, &format!("light.l{}", n), "on")).await;
    }

    assert!(harness.sink.wait_for("state_changed", 5, Duration::from_secs(5)).await);
    assert!(harness.status.is_streaming());
    // Registry snapshots were delivered too, once each.
    assert_eq!(harness.sink.count("device_registry_snapshot"), 1);
    assert_eq!(harness.sink.count("entity_registry_snapshot"), 1);

    // Events arrived in the order sent.
    let state_events: Vec<RawEvent> = harness
        .sink
        .events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.kind == "state_changed")
        .cloned()
        .collect();
    for (n, event) in state_events.iter().enumerate() {
        assert_eq!(
            event.payload["data"]["entity_id"],
            format!("light.l{}", n)
        );
    }

    harness.shutdown.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), harness.connector)
        .await
        .expect("connector stopped")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn reconnects_after_link_loss_and_redelivers() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let harness = start_connector(addr);

    let mut ws = accept_session(&listener).await;
    handshake(&mut ws).await;
    send_json(&mut ws, state_changed(1, "light.kitchen", "on")).await;
    assert!(harness.sink.wait_for("state_changed", 1, Duration::from_secs(5)).await);

    // Kill the link mid-stream; the connector must come back on its own.
    drop(ws);
    let mut ws = accept_session(&listener).await;
    handshake(&mut ws).await;
    // At-least-once across the boundary: the same event replays.
    send_json(&mut ws, state_changed(1, "light.kitchen", "on")).await;

    assert!(harness.sink.wait_for("state_changed", 2, Duration::from_secs(5)).await);
    assert!(harness.metrics.connector.reconnects.get() >= 1);
    assert!(harness.status.reconnects() >= 1);

    harness.shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), harness.connector).await;
}

#[tokio::test]
async fn two_consecutive_credential_rejections_are_fatal() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let harness = start_connector(addr);

    for _ in 0..2 {
        let mut ws = accept_session(&listener).await;
        send_json(&mut ws, json!({"type": "auth_required"})).await;
        let auth = read_json(&mut ws).await;
        assert_eq!(auth["type"], "auth");
        send_json(&mut ws, json!({"type": "auth_invalid", "message": "bad token"})).await;
    }

    let result = tokio::time::timeout(Duration::from_secs(10), harness.connector)
        .await
        .expect("connector gave up")
        .unwrap();
    assert!(matches!(result, Err(IngestError::Authentication { .. })));
}

#[tokio::test]
async fn malformed_frames_are_counted_and_skipped() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let harness = start_connector(addr);

    let mut ws = accept_session(&listener).await;
    handshake(&mut ws).await;

    send_json(&mut ws, json!({"type": "mystery_frame"})).await;
    ws.send(Message::Text("not json at all".to_string())).await.unwrap();
    send_json(&mut ws, state_changed(1, "light.kitchen", "on")).await;

    assert!(harness.sink.wait_for("state_changed", 1, Duration::from_secs(5)).await);
    assert!(harness.metrics.connector.protocol_errors.get() >= 2);

    harness.shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), harness.connector).await;
}

#[tokio::test]
async fn missed_heartbeat_triggers_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let sink = Arc::new(CollectingSink::default());
    let metrics = Arc::new(PipelineMetrics::new().unwrap());
    let status = Arc::new(ConnectorStatus::new());
    let shutdown = CancellationToken::new();
    let mut ha = config(addr);
    ha.heartbeat_timeout = Duration::from_millis(300);
    let connector = HaConnector::new(
        ha,
        Arc::clone(&sink) as Arc<dyn EventSink>,
        Arc::clone(&metrics),
        Arc::clone(&status),
        shutdown.clone(),
    );
    let task = tokio::spawn(connector.run());

    // First session: handshake, then deliberately answer nothing (not
    // even the connector's pings) until the watchdog fires.
    let (stream, _) = listener.accept().await.unwrap();
    let mut ws = accept_async(stream).await.unwrap();
    send_json(&mut ws, json!({"type": "auth_required"})).await;
    let auth = read_json(&mut ws).await;
    assert_eq!(auth["type"], "auth");
    send_json(&mut ws, json!({"type": "auth_ok"})).await;
    let subscribe = read_json(&mut ws).await;
    let sub_id = subscribe["id"].as_u64().unwrap();
    send_json(&mut ws, json!({"id": sub_id, "type": "result", "success": true})).await;

    // The reconnect shows up as a fresh TCP connection.
    let second = tokio::time::timeout(Duration::from_secs(10), listener.accept()).await;
    assert!(second.is_ok(), "connector did not reconnect after heartbeat loss");

    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
}
