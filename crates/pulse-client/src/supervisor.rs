//! Connection supervisor for the realtime channel.
//!
//! This module provides the `ConnectionSupervisor` which handles:
//! - Opening the WebSocket with the current credential in the query string
//! - Heartbeating while a physical connection is open
//! - Routing inbound frames and outbound commands
//! - Reconnecting with exponential backoff, or stopping for good on
//!   teardown, intentional close or credential rejection
//!
//! One supervisor runs per open channel, as a single task. Physical
//! connections are strictly sequential: the next one is opened only after
//! the previous one has ended.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use pulse_core::CredentialSource;
use pulse_protocol::{CloseCode, CloseKind, Command, Frame};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message, Utf8Bytes};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::ChannelConfig;
use crate::gateway::OutboundGateway;
use crate::router::MessageRouter;
use crate::status::{ChannelStatus, ConnectionState, PARSE_ERROR_MESSAGE, RECONNECTING_MESSAGE};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Reason sent with the client's close frame on teardown.
const CLIENT_CLOSE_REASON: &str = "Client disconnecting";

// ============================================================================
// Disconnect Outcomes
// ============================================================================

/// Why a physical connection (or an attempt at one) ended.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Disconnect {
    /// The channel was torn down by the client.
    Teardown,

    /// The server sent a close frame.
    Closed {
        code: Option<CloseCode>,
        reason: String,
    },

    /// The server refused the WebSocket upgrade with this HTTP status.
    UpgradeRejected { status: u16 },

    /// Connect failure, I/O error or connection lost without a close frame.
    Transport(String),
}

/// What the supervisor does after a disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NextStep {
    Reconnect,
    Stop,
}

// ============================================================================
// Connection Supervisor
// ============================================================================

/// Owns the lifecycle of one realtime channel.
///
/// # Connection Lifecycle
///
/// 1. Read the access token; without one the supervisor stops (idle)
/// 2. Connect to `<url>?token=<credential>`
/// 3. On open, send a heartbeat, attach the outbound gateway, reset the
///    attempt counter and report `Connected`
/// 4. Dispatch inbound frames, forward outbound commands, heartbeat
/// 5. On close or error, detach the gateway and either stop or wait
///    `backoff_delay(attempt)` and go back to 1
pub(crate) struct ConnectionSupervisor {
    config: ChannelConfig,
    credentials: Arc<dyn CredentialSource>,
    router: MessageRouter,
    gateway: OutboundGateway,
    status: Arc<watch::Sender<ChannelStatus>>,
    cancel_token: CancellationToken,
}

impl ConnectionSupervisor {
    pub(crate) fn new(
        config: ChannelConfig,
        credentials: Arc<dyn CredentialSource>,
        router: MessageRouter,
        gateway: OutboundGateway,
        status: Arc<watch::Sender<ChannelStatus>>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            config,
            credentials,
            router,
            gateway,
            status,
            cancel_token,
        }
    }

    /// Main loop that maintains the channel until it stops.
    ///
    /// Returns on teardown (cancellation), a terminal close, a missing
    /// credential or an exhausted attempt ceiling. The status is `Idle`
    /// when this returns.
    pub(crate) async fn run(self) {
        info!(url = %self.config.url, "Realtime channel starting");

        let mut attempt: u32 = 0;

        loop {
            if self.cancel_token.is_cancelled() {
                self.stop_idle(None);
                info!("Realtime channel shutting down (cancelled)");
                return;
            }

            // Re-read on every attempt so a rotated token is picked up
            let Some(token) = self.credentials.access_token() else {
                warn!("No access token available for WebSocket connection");
                self.publish(|s| {
                    s.transition(ConnectionState::Idle);
                    s.reconnecting = false;
                    s.credential_missing = true;
                });
                return;
            };

            let url = match self.config.connection_url(&token) {
                Ok(url) => url,
                Err(e) => {
                    error!(error = %e, "Cannot build connection URL");
                    self.stop_idle(Some(e.to_string()));
                    return;
                }
            };

            self.publish(|s| {
                s.transition(ConnectionState::Connecting);
                s.credential_missing = false;
                s.attempt = attempt;
            });
            debug!(attempt, "Attempting to connect");

            let outcome = match self.connect(&url).await {
                Ok(ws) => {
                    attempt = 0;
                    self.run_connection(ws).await
                }
                Err(outcome) => outcome,
            };

            if self.next_step(&outcome) == NextStep::Stop {
                return;
            }

            if let Some(max) = self.config.max_reconnect_attempts {
                if attempt >= max {
                    warn!(attempt, max, "Max reconnection attempts reached");
                    self.stop_idle(Some(format!(
                        "Gave up reconnecting after {attempt} attempts"
                    )));
                    return;
                }
            }

            let delay = self.config.backoff_delay(attempt);
            info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Scheduling reconnect"
            );

            tokio::select! {
                _ = sleep(delay) => {
                    attempt = attempt.saturating_add(1);
                }
                _ = self.cancel_token.cancelled() => {
                    info!("Reconnect cancelled");
                    self.stop_idle(None);
                    return;
                }
            }
        }
    }

    /// Opens one physical connection.
    async fn connect(&self, url: &Url) -> Result<WsStream, Disconnect> {
        let connecting = timeout(self.config.connect_timeout, connect_async(url.as_str()));

        tokio::select! {
            result = connecting => match result {
                Ok(Ok((ws, _response))) => {
                    debug!("Transport open");
                    Ok(ws)
                }
                Ok(Err(WsError::Http(response))) => {
                    let status = response.status().as_u16();
                    warn!(status, "WebSocket upgrade rejected");
                    Err(Disconnect::UpgradeRejected { status })
                }
                Ok(Err(e)) => {
                    debug!(error = %e, "Connection attempt failed");
                    Err(Disconnect::Transport(e.to_string()))
                }
                Err(_) => {
                    debug!("Connection attempt timed out");
                    Err(Disconnect::Transport("connect timed out".to_string()))
                }
            },
            _ = self.cancel_token.cancelled() => Err(Disconnect::Teardown),
        }
    }

    /// Runs an open connection until it ends.
    async fn run_connection(&self, ws: WsStream) -> Disconnect {
        let (mut sink, mut stream) = ws.split();

        if let Err(e) = send_command(&mut sink, &Command::heartbeat()).await {
            return Disconnect::Transport(e.to_string());
        }

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        self.gateway.attach(outbound_tx.clone());
        self.publish(|s| {
            s.transition(ConnectionState::Connected);
            s.reconnecting = false;
            s.attempt = 0;
            s.last_error = None;
            s.last_close = None;
        });
        info!("WebSocket connected");

        let outcome = self
            .message_loop(&mut sink, &mut stream, &mut outbound_rx)
            .await;

        self.gateway.release(&outbound_tx);

        if outcome == Disconnect::Teardown {
            close_gracefully(&mut sink, &mut stream, self.config.close_timeout).await;
        }
        outcome
    }

    /// Main message loop of one physical connection.
    ///
    /// The heartbeat timer lives here, so it exists only while this
    /// connection is open.
    async fn message_loop<W, R>(
        &self,
        sink: &mut W,
        stream: &mut R,
        outbound_rx: &mut mpsc::UnboundedReceiver<String>,
    ) -> Disconnect
    where
        W: Sink<Message, Error = WsError> + Unpin,
        R: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        // A zero period would panic in the interval
        let period = self.config.heartbeat_interval.max(Duration::from_millis(1));
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    debug!("Message loop cancelled");
                    return Disconnect::Teardown;
                }

                Some(text) = outbound_rx.recv() => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        warn!(error = %e, "Failed to send command");
                        return Disconnect::Transport(e.to_string());
                    }
                }

                _ = heartbeat.tick() => {
                    if let Err(e) = send_command(sink, &Command::heartbeat()).await {
                        warn!(error = %e, "Failed to send heartbeat");
                        return Disconnect::Transport(e.to_string());
                    }
                    debug!("Heartbeat sent");
                }

                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text),
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = match frame {
                            Some(frame) => (
                                Some(CloseCode(u16::from(frame.code))),
                                frame.reason.as_str().to_owned(),
                            ),
                            None => (None, String::new()),
                        };
                        info!(code = ?code, reason = %reason, "WebSocket closed");
                        return Disconnect::Closed { code, reason };
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        debug!(len = bytes.len(), "Ignoring binary frame");
                    }
                    Some(Ok(_)) => {
                        // Ping/pong are answered by the transport
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        return Disconnect::Transport(e.to_string());
                    }
                    None => {
                        info!("Connection lost without close frame");
                        return Disconnect::Transport("connection lost".to_string());
                    }
                },
            }
        }
    }

    /// Parses and dispatches one text frame.
    ///
    /// Malformed frames are logged and recorded; the connection stays open.
    pub(crate) fn handle_text(&self, text: &str) {
        match Frame::parse(text) {
            Ok(frame) => {
                if let Some(message) = frame.error_message() {
                    warn!(error_message = %message, "Server reported an error");
                }
                let delivered = self.router.dispatch(&frame);
                debug!(
                    frame_type = frame.kind().unwrap_or("<untyped>"),
                    delivered,
                    "Dispatched frame"
                );
            }
            Err(e) => {
                warn!(error = %e, "Error parsing WebSocket message");
                self.publish(|s| s.last_error = Some(PARSE_ERROR_MESSAGE.to_string()));
            }
        }
    }

    /// Decides between reconnecting and stopping, and publishes the result.
    pub(crate) fn next_step(&self, outcome: &Disconnect) -> NextStep {
        match outcome {
            Disconnect::Teardown => {
                info!("Realtime channel torn down");
                self.stop_idle(None);
                NextStep::Stop
            }
            Disconnect::Closed { code, reason } => {
                let kind = code.map(CloseCode::kind).unwrap_or(CloseKind::Abnormal);
                match kind {
                    CloseKind::Intentional => {
                        info!("Server closed the channel intentionally");
                        self.publish(|s| s.last_close = *code);
                        self.stop_idle(None);
                        NextStep::Stop
                    }
                    CloseKind::AuthFailure(failure) if !self.config.retry_on_auth_failure => {
                        error!(%failure, "Authentication failed");
                        self.publish(|s| s.last_close = *code);
                        self.stop_idle(Some(format!("Authentication failed: {failure}")));
                        NextStep::Stop
                    }
                    CloseKind::ServerError => {
                        error!(reason = %reason, "Server error");
                        self.mark_reconnecting(*code);
                        NextStep::Reconnect
                    }
                    CloseKind::AuthFailure(_) | CloseKind::Abnormal => {
                        self.mark_reconnecting(*code);
                        NextStep::Reconnect
                    }
                }
            }
            Disconnect::UpgradeRejected { status }
                if matches!(status, 401 | 403) && !self.config.retry_on_auth_failure =>
            {
                error!(status, "Authentication failed during upgrade");
                self.stop_idle(Some(format!(
                    "Authentication failed: upgrade rejected with HTTP {status}"
                )));
                NextStep::Stop
            }
            Disconnect::UpgradeRejected { .. } | Disconnect::Transport(_) => {
                self.mark_reconnecting(None);
                NextStep::Reconnect
            }
        }
    }

    fn mark_reconnecting(&self, code: Option<CloseCode>) {
        self.publish(|s| {
            s.transition(ConnectionState::Disconnected);
            s.reconnecting = true;
            s.last_error = Some(RECONNECTING_MESSAGE.to_string());
            s.last_close = code;
        });
    }

    /// Moves to `Idle` for good, optionally recording why.
    fn stop_idle(&self, error: Option<String>) {
        self.publish(|s| {
            s.transition(ConnectionState::Idle);
            s.reconnecting = false;
            if error.is_some() {
                s.last_error = error;
            }
        });
    }

    fn publish(&self, update: impl FnOnce(&mut ChannelStatus)) {
        self.status.send_modify(update);
    }
}

/// Serializes and sends one command.
async fn send_command<W>(sink: &mut W, command: &Command) -> Result<(), WsError>
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    // Command serialization cannot fail: every variant is plain strings
    let text = serde_json::to_string(command).unwrap_or_default();
    sink.send(Message::Text(text.into())).await
}

/// Sends a normal (1000) close frame and waits briefly for the reply.
async fn close_gracefully<W, R>(sink: &mut W, stream: &mut R, wait: Duration)
where
    W: Sink<Message, Error = WsError> + Unpin,
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let frame = CloseFrame {
        code: WsCloseCode::Normal,
        reason: Utf8Bytes::from_static(CLIENT_CLOSE_REASON),
    };
    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "Close frame not sent");
        return;
    }

    let drain = async {
        while let Some(message) = stream.next().await {
            if matches!(message, Ok(Message::Close(_)) | Err(_)) {
                break;
            }
        }
    };
    if timeout(wait, drain).await.is_err() {
        debug!("Close handshake timed out");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pulse_core::StaticCredential;

    fn create_test_supervisor(
        config: ChannelConfig,
    ) -> (ConnectionSupervisor, MessageRouter, watch::Receiver<ChannelStatus>) {
        let (status_tx, status_rx) = watch::channel(ChannelStatus::default());
        let status = Arc::new(status_tx);
        let router = MessageRouter::new();
        let supervisor = ConnectionSupervisor::new(
            config,
            Arc::new(StaticCredential::new("token")),
            router.clone(),
            OutboundGateway::new(Arc::clone(&status)),
            status,
            CancellationToken::new(),
        );
        (supervisor, router, status_rx)
    }

    fn closed(code: u16) -> Disconnect {
        Disconnect::Closed {
            code: Some(CloseCode(code)),
            reason: String::new(),
        }
    }

    // ------------------------------------------------------------------------
    // Frame Handling Tests
    // ------------------------------------------------------------------------

    #[test]
    fn test_handle_text_dispatches_frames() {
        let (supervisor, router, _status) = create_test_supervisor(ChannelConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        router.subscribe("welcome", move |frame: &Frame| {
            sink.lock().push(frame.get("message").cloned());
        });

        supervisor.handle_text(r#"{"type":"welcome","message":"Welcome alice!"}"#);

        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_handle_text_malformed_is_not_fatal() {
        let (supervisor, router, status) = create_test_supervisor(ChannelConfig::default());
        let count = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&count);
        router.subscribe("*", move |_: &Frame| *counter.lock() += 1);

        supervisor.handle_text("not valid json");
        assert_eq!(status.borrow().last_error.as_deref(), Some(PARSE_ERROR_MESSAGE));

        supervisor.handle_text(r#"{"type":"heartbeat_ack"}"#);
        assert_eq!(*count.lock(), 1);
    }

    // ------------------------------------------------------------------------
    // Close Policy Tests
    // ------------------------------------------------------------------------

    #[test]
    fn test_abnormal_close_reconnects() {
        let (supervisor, _router, status) = create_test_supervisor(ChannelConfig::default());

        assert_eq!(supervisor.next_step(&closed(1006)), NextStep::Reconnect);

        let status = status.borrow();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(status.reconnecting);
        assert_eq!(status.last_error.as_deref(), Some(RECONNECTING_MESSAGE));
        assert_eq!(status.last_close, Some(CloseCode(1006)));
    }

    #[test]
    fn test_transport_error_reconnects() {
        let (supervisor, _router, _status) = create_test_supervisor(ChannelConfig::default());
        let outcome = Disconnect::Transport("connection reset".to_string());
        assert_eq!(supervisor.next_step(&outcome), NextStep::Reconnect);
    }

    #[test]
    fn test_server_error_reconnects() {
        let (supervisor, _router, _status) = create_test_supervisor(ChannelConfig::default());
        assert_eq!(supervisor.next_step(&closed(1011)), NextStep::Reconnect);
    }

    #[test]
    fn test_close_without_code_reconnects() {
        let (supervisor, _router, _status) = create_test_supervisor(ChannelConfig::default());
        let outcome = Disconnect::Closed {
            code: None,
            reason: String::new(),
        };
        assert_eq!(supervisor.next_step(&outcome), NextStep::Reconnect);
    }

    #[test]
    fn test_intentional_close_stops() {
        let (supervisor, _router, status) = create_test_supervisor(ChannelConfig::default());

        assert_eq!(supervisor.next_step(&closed(1000)), NextStep::Stop);
        assert_eq!(status.borrow().state, ConnectionState::Idle);
        assert!(!status.borrow().reconnecting);
    }

    #[test]
    fn test_auth_failure_is_terminal_by_default() {
        for code in [4001, 4002, 4003] {
            let (supervisor, _router, status) = create_test_supervisor(ChannelConfig::default());

            assert_eq!(supervisor.next_step(&closed(code)), NextStep::Stop);

            let status = status.borrow();
            assert_eq!(status.state, ConnectionState::Idle);
            assert!(!status.reconnecting);
            assert!(status
                .last_error
                .as_deref()
                .is_some_and(|e| e.starts_with("Authentication failed")));
        }
    }

    #[test]
    fn test_auth_failure_retried_when_configured() {
        let config = ChannelConfig {
            retry_on_auth_failure: true,
            ..Default::default()
        };
        let (supervisor, _router, _status) = create_test_supervisor(config);

        assert_eq!(supervisor.next_step(&closed(4002)), NextStep::Reconnect);
        let rejected = Disconnect::UpgradeRejected { status: 401 };
        assert_eq!(supervisor.next_step(&rejected), NextStep::Reconnect);
    }

    #[test]
    fn test_upgrade_rejection_policy() {
        let (supervisor, _router, _status) = create_test_supervisor(ChannelConfig::default());

        let unauthorized = Disconnect::UpgradeRejected { status: 403 };
        assert_eq!(supervisor.next_step(&unauthorized), NextStep::Stop);

        let unavailable = Disconnect::UpgradeRejected { status: 503 };
        assert_eq!(supervisor.next_step(&unavailable), NextStep::Reconnect);
    }

    #[test]
    fn test_teardown_stops_without_error() {
        let (supervisor, _router, status) = create_test_supervisor(ChannelConfig::default());

        assert_eq!(supervisor.next_step(&Disconnect::Teardown), NextStep::Stop);
        assert_eq!(status.borrow().state, ConnectionState::Idle);
        assert_eq!(status.borrow().last_error, None);
    }

    // ------------------------------------------------------------------------
    // Run Loop Tests
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_run_without_credential_stays_idle() {
        let (status_tx, status_rx) = watch::channel(ChannelStatus::default());
        let status = Arc::new(status_tx);
        let supervisor = ConnectionSupervisor::new(
            ChannelConfig::default(),
            Arc::new(StaticCredential::none()),
            MessageRouter::new(),
            OutboundGateway::new(Arc::clone(&status)),
            status,
            CancellationToken::new(),
        );

        supervisor.run().await;

        let status = status_rx.borrow();
        assert_eq!(status.state, ConnectionState::Idle);
        assert!(status.credential_missing);
    }

    #[tokio::test]
    async fn test_run_respects_cancellation() {
        let (supervisor, _router, status) = create_test_supervisor(ChannelConfig::new(
            "ws://127.0.0.1:9/ws/",
        ));
        supervisor.cancel_token.cancel();

        let start = std::time::Instant::now();
        supervisor.run().await;

        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(status.borrow().state, ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_run_gives_up_after_max_attempts() {
        // Bind then drop to get a port nothing listens on
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let config = ChannelConfig {
            url: format!("ws://127.0.0.1:{port}/ws/"),
            retry_initial_delay: Duration::from_millis(5),
            max_reconnect_attempts: Some(2),
            ..Default::default()
        };
        let (supervisor, _router, status) = create_test_supervisor(config);

        tokio::time::timeout(Duration::from_secs(5), supervisor.run())
            .await
            .unwrap();

        let status = status.borrow();
        assert_eq!(status.state, ConnectionState::Idle);
        assert!(!status.reconnecting);
        assert_eq!(status.attempt, 2);
        assert!(status
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("Gave up")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_waits_between_attempts() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let config = ChannelConfig {
            url: format!("ws://127.0.0.1:{port}/ws/"),
            max_reconnect_attempts: Some(3),
            ..Default::default()
        };
        let (supervisor, _router, _status) = create_test_supervisor(config);

        let start = Instant::now();
        supervisor.run().await;

        // 1s + 2s + 4s of default backoff before giving up
        assert!(start.elapsed() >= Duration::from_secs(7));
    }
}
