//! The source connector: owns exactly one logical subscription to the Home
//! Assistant event stream and surfaces it as an ordered sequence of
//! [`RawEvent`]s.
//!
//! Connection lifecycle is a loop over sessions. Each session walks
//! Disconnected → Authenticating → Subscribing → Streaming; any transport
//! error, heartbeat miss or protocol-level close drops the session into
//! Backoff and a fresh session starts after a jittered exponential delay.
//! Only credential rejection (twice consecutively) is fatal; every other
//! failure is retried indefinitely.
//!
//! Ordering contract: frames are delivered to the sink in the order received
//! and are never reordered. Duplicates are possible across reconnect
//! boundaries; downstream dedups on the correlation id where that matters.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ha_ingest_core::config::HaConfig;
use ha_ingest_core::error::{IngestError, IngestResult, RetryPolicy};
use ha_ingest_core::events::{EventSink, RawEvent};
use ha_ingest_core::metrics::PipelineMetrics;

use crate::protocol::{ClientFrame, ServerFrame};
use crate::status::{ConnectionState, ConnectorStatus};

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// How a streaming session ended.
#[derive(Debug)]
enum SessionEnd {
    /// Shutdown was requested; the run loop exits cleanly.
    Shutdown,
    /// The link broke after streaming had begun; reconnect with backoff.
    LinkLost(String),
}

/// Message ids and subscription state for one session.
struct Session {
    next_id: u64,
    subscription_id: u64,
    device_registry_id: u64,
    entity_registry_id: u64,
}

impl Session {
    fn new() -> Self {
        Session {
            next_id: 0,
            subscription_id: 0,
            device_registry_id: 0,
            entity_registry_id: 0,
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Long-lived Home Assistant source connector.
pub struct HaConnector {
    config: HaConfig,
    sink: Arc<dyn EventSink>,
    metrics: Arc<PipelineMetrics>,
    status: Arc<ConnectorStatus>,
    shutdown: CancellationToken,
}

impl HaConnector {
    /// `status` is owned by the caller so it stays stable across connector
    /// restarts.
    pub fn new(
        config: HaConfig,
        sink: Arc<dyn EventSink>,
        metrics: Arc<PipelineMetrics>,
        status: Arc<ConnectorStatus>,
        shutdown: CancellationToken,
    ) -> Self {
        HaConnector {
            config,
            sink,
            metrics,
            status,
            shutdown,
        }
    }

    /// Shared status handle for the health probe.
    pub fn status(&self) -> Arc<ConnectorStatus> {
        Arc::clone(&self.status)
    }

    fn set_state(&self, state: ConnectionState) {
        self.status.set_state(state);
        self.metrics.connector.state.set(state as i64);
    }

    /// Run until shutdown. Returns an error only for unrecoverable
    /// credential problems.
    pub async fn run(self) -> IngestResult<()> {
        let endpoint = ws_endpoint(&self.config.url);
        let policy = RetryPolicy {
            base_delay: self.config.reconnect_delay,
            ..RetryPolicy::connector()
        };
        let mut backoff = policy.backoff();
        let mut consecutive_auth_failures = 0u32;
        let mut had_streamed = false;

        info!(endpoint = %endpoint, "starting source connector");

        loop {
            if self.shutdown.is_cancelled() {
                self.set_state(ConnectionState::Stopping);
                return Ok(());
            }

            self.set_state(ConnectionState::Disconnected);
            self.metrics.connector.connect_attempts.inc();
            if had_streamed {
                self.status.mark_reconnect();
                self.metrics.connector.reconnects.inc();
            }

            match self.run_session(&endpoint).await {
                Ok(SessionEnd::Shutdown) => {
                    self.set_state(ConnectionState::Stopping);
                    info!("source connector stopped");
                    return Ok(());
                }
                Ok(SessionEnd::LinkLost(reason)) => {
                    // Streaming had begun, so the credential is known good.
                    consecutive_auth_failures = 0;
                    had_streamed = true;
                    backoff.reset();
                    warn!(reason = %reason, "source link lost");
                }
                Err(IngestError::Authentication { endpoint, message }) => {
                    consecutive_auth_failures += 1;
                    if consecutive_auth_failures >= 2 {
                        self.set_state(ConnectionState::Stopping);
                        error!(%endpoint, %message, "credential rejected twice, giving up");
                        return Err(IngestError::Authentication { endpoint, message });
                    }
                    warn!(%endpoint, %message, "credential rejected, retrying once");
                }
                Err(e) => {
                    debug!(error = %e, "session setup failed");
                }
            }

            self.set_state(ConnectionState::Backoff);
            let delay = backoff.next_delay();
            debug!(delay_ms = delay.as_millis() as u64, "backing off before reconnect");
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.set_state(ConnectionState::Stopping);
                    return Ok(());
                }
                _ = sleep(delay) => {}
            }
        }
    }

    /// Connect, authenticate, subscribe, then stream until the link breaks
    /// or shutdown is requested.
    async fn run_session(&self, endpoint: &str) -> IngestResult<SessionEnd> {
        let connect = timeout(self.config.connection_timeout, connect_async(endpoint));
        let (ws, _response) = match connect.await {
            Ok(Ok(ok)) => ok,
            Ok(Err(e)) => {
                return Err(IngestError::transient_network(
                    endpoint,
                    format!("connect failed: {}", e),
                ))
            }
            Err(_) => {
                return Err(IngestError::transient_network(endpoint, "connect timed out"))
            }
        };
        let (mut write, mut read) = ws.split();
        let mut session = Session::new();

        self.handshake(endpoint, &mut write, &mut read, &mut session)
            .await?;
        self.stream(endpoint, &mut write, &mut read, &mut session)
            .await
    }

    /// Authenticate and register the subscription plus the registry
    /// snapshot requests.
    async fn handshake(
        &self,
        endpoint: &str,
        write: &mut WsWriter,
        read: &mut WsReader,
        session: &mut Session,
    ) -> IngestResult<()> {
        self.set_state(ConnectionState::Authenticating);

        loop {
            let frame = self.read_frame(endpoint, read, self.config.connection_timeout).await?;
            match frame {
                ServerFrame::AuthRequired { ha_version } => {
                    debug!(ha_version = ?ha_version, "authenticating");
                    self.send(
                        endpoint,
                        write,
                        &ClientFrame::Auth {
                            access_token: self.config.token.clone(),
                        },
                    )
                    .await?;
                }
                ServerFrame::AuthOk { ha_version } => {
                    info!(ha_version = ?ha_version, "authenticated");
                    break;
                }
                ServerFrame::AuthInvalid { message } => {
                    return Err(IngestError::authentication(
                        endpoint,
                        message.unwrap_or_else(|| "auth_invalid".to_string()),
                    ));
                }
                ServerFrame::Ping { id } => {
                    self.send(endpoint, write, &ClientFrame::Pong { id: id.unwrap_or(0) })
                        .await?;
                }
                other => {
                    self.metrics.connector.protocol_errors.inc();
                    debug!(frame = ?other, "unexpected frame during auth");
                }
            }
        }

        self.set_state(ConnectionState::Subscribing);
        session.subscription_id = session.next_id();
        self.send(
            endpoint,
            write,
            &ClientFrame::SubscribeEvents {
                id: session.subscription_id,
                event_type: "state_changed".to_string(),
            },
        )
        .await?;

        loop {
            let frame = self.read_frame(endpoint, read, self.config.connection_timeout).await?;
            match frame {
                ServerFrame::Result { id, success, error, .. }
                    if id == session.subscription_id =>
                {
                    if !success {
                        let detail = error
                            .map(|e| format!("{}: {}", e.code, e.message))
                            .unwrap_or_else(|| "unknown".to_string());
                        return Err(IngestError::protocol(format!(
                            "subscription rejected: {}",
                            detail
                        )));
                    }
                    break;
                }
                ServerFrame::Ping { id } => {
                    self.send(endpoint, write, &ClientFrame::Pong { id: id.unwrap_or(0) })
                        .await?;
                }
                other => {
                    self.metrics.connector.protocol_errors.inc();
                    debug!(frame = ?other, "unexpected frame during subscribe");
                }
            }
        }

        // Registry snapshots feed the metadata store; results arrive during
        // streaming and are matched by id.
        session.device_registry_id = session.next_id();
        self.send(
            endpoint,
            write,
            &ClientFrame::DeviceRegistryList {
                id: session.device_registry_id,
            },
        )
        .await?;
        session.entity_registry_id = session.next_id();
        self.send(
            endpoint,
            write,
            &ClientFrame::EntityRegistryList {
                id: session.entity_registry_id,
            },
        )
        .await?;

        self.set_state(ConnectionState::Streaming);
        info!("subscribed to state_changed events");
        Ok(())
    }

    /// Streaming loop: emit events, answer pings, watch the heartbeat.
    async fn stream(
        &self,
        endpoint: &str,
        write: &mut WsWriter,
        read: &mut WsReader,
        session: &mut Session,
    ) -> IngestResult<SessionEnd> {
        let heartbeat = self.config.heartbeat_timeout;
        let mut last_frame = Instant::now();
        let mut ping_timer = tokio::time::interval(ping_cadence(heartbeat));
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping_timer.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Shutdown);
                }
                _ = sleep_until(last_frame + heartbeat) => {
                    return Ok(SessionEnd::LinkLost(format!(
                        "no frame for {}s", heartbeat.as_secs()
                    )));
                }
                _ = ping_timer.tick() => {
                    let id = session.next_id();
                    if let Err(e) = self.send(endpoint, write, &ClientFrame::Ping { id }).await {
                        return Ok(SessionEnd::LinkLost(format!("ping failed: {}", e)));
                    }
                }
                message = read.next() => {
                    let message = match message {
                        None => return Ok(SessionEnd::LinkLost("stream closed".to_string())),
                        Some(Err(e)) => {
                            return Ok(SessionEnd::LinkLost(format!("transport error: {}", e)))
                        }
                        Some(Ok(message)) => message,
                    };
                    last_frame = Instant::now();

                    match message {
                        Message::Text(text) => {
                            self.note_frame();
                            if let Some(end) = self.on_text_frame(write, session, &text).await? {
                                return Ok(end);
                            }
                        }
                        Message::Ping(payload) => {
                            self.note_frame();
                            if write.send(Message::Pong(payload)).await.is_err() {
                                return Ok(SessionEnd::LinkLost("pong failed".to_string()));
                            }
                        }
                        Message::Pong(_) => self.note_frame(),
                        Message::Close(_) => {
                            return Ok(SessionEnd::LinkLost("server closed".to_string()))
                        }
                        _ => {
                            self.metrics.connector.protocol_errors.inc();
                        }
                    }
                }
            }
        }
    }

    /// Handle one decoded text frame; `Some(end)` terminates the session.
    async fn on_text_frame(
        &self,
        write: &mut WsWriter,
        session: &mut Session,
        text: &str,
    ) -> IngestResult<Option<SessionEnd>> {
        let frame = match ServerFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                self.metrics.connector.protocol_errors.inc();
                debug!(error = %e, "discarding undecodable frame");
                return Ok(None);
            }
        };

        match frame {
            ServerFrame::Event { event, .. } => {
                if event.event_type != "state_changed" {
                    debug!(event_type = %event.event_type, "ignoring unsubscribed event type");
                    return Ok(None);
                }
                let kind = event.event_type.clone();
                let raw = RawEvent::new(kind, event.into_payload());
                match self.sink.deliver(raw).await {
                    Ok(()) => {}
                    Err(IngestError::Shutdown) => return Ok(Some(SessionEnd::Shutdown)),
                    Err(e) => return Err(e),
                }
            }
            ServerFrame::Result { id, success, result, error } => {
                if !success {
                    self.metrics.connector.protocol_errors.inc();
                    warn!(id, error = ?error, "command rejected by source");
                } else if id == session.device_registry_id {
                    let raw = RawEvent::new("device_registry_snapshot", result);
                    if let Err(IngestError::Shutdown) = self.sink.deliver(raw).await {
                        return Ok(Some(SessionEnd::Shutdown));
                    }
                } else if id == session.entity_registry_id {
                    let raw = RawEvent::new("entity_registry_snapshot", result);
                    if let Err(IngestError::Shutdown) = self.sink.deliver(raw).await {
                        return Ok(Some(SessionEnd::Shutdown));
                    }
                }
            }
            ServerFrame::Ping { id } => {
                let endpoint = self.config.url.clone();
                if self
                    .send(&endpoint, write, &ClientFrame::Pong { id: id.unwrap_or(0) })
                    .await
                    .is_err()
                {
                    return Ok(Some(SessionEnd::LinkLost("pong failed".to_string())));
                }
            }
            ServerFrame::Pong { .. } => {}
            other => {
                // Auth frames after streaming began mean the server lost our
                // session state.
                self.metrics.connector.protocol_errors.inc();
                debug!(frame = ?other, "unexpected frame while streaming");
            }
        }
        Ok(None)
    }

    fn note_frame(&self) {
        let now = chrono::Utc::now();
        self.status.mark_frame(now);
        self.metrics.connector.frames_received.inc();
        self.metrics
            .connector
            .last_frame_timestamp
            .set(now.timestamp_millis() as f64 / 1000.0);
    }

    async fn send(
        &self,
        endpoint: &str,
        write: &mut WsWriter,
        frame: &ClientFrame,
    ) -> IngestResult<()> {
        let text = frame.to_json()?;
        write.send(Message::Text(text)).await.map_err(|e| {
            IngestError::transient_network(endpoint, format!("send failed: {}", e))
        })
    }

    async fn read_frame(
        &self,
        endpoint: &str,
        read: &mut WsReader,
        deadline: Duration,
    ) -> IngestResult<ServerFrame> {
        loop {
            let message = timeout(deadline, read.next()).await.map_err(|_| {
                IngestError::transient_network(endpoint, "handshake read timed out")
            })?;
            let message = match message {
                None => {
                    return Err(IngestError::transient_network(endpoint, "stream closed"))
                }
                Some(Err(e)) => {
                    return Err(IngestError::transient_network(
                        endpoint,
                        format!("transport error: {}", e),
                    ))
                }
                Some(Ok(message)) => message,
            };
            match message {
                Message::Text(text) => {
                    self.note_frame();
                    match ServerFrame::parse(&text) {
                        Ok(frame) => return Ok(frame),
                        Err(_) => {
                            self.metrics.connector.protocol_errors.inc();
                            continue;
                        }
                    }
                }
                Message::Close(_) => {
                    return Err(IngestError::transient_network(endpoint, "server closed"))
                }
                // Control frames during the handshake are fine; keep reading.
                _ => continue,
            }
        }
    }
}

/// Normalize the configured base URL into the websocket API endpoint.
fn ws_endpoint(url: &str) -> String {
    let mut endpoint = url.trim_end_matches('/').to_string();
    if let Some(rest) = endpoint.strip_prefix("http://") {
        endpoint = format!("ws://{}", rest);
    } else if let Some(rest) = endpoint.strip_prefix("https://") {
        endpoint = format!("wss://{}", rest);
    }
    if !endpoint.ends_with("/api/websocket") {
        endpoint.push_str("/api/websocket");
    }
    endpoint
}

/// Ping at half the heartbeat timeout so a healthy-but-quiet link never
/// trips the watchdog, floored at one second.
fn ping_cadence(heartbeat: Duration) -> Duration {
    (heartbeat / 2).max(Duration::from_secs(1))
}
