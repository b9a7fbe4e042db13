//! Consumer-facing handle for the realtime channel.
//!
//! `RealtimeChannel` ties the pieces together: it owns the message router,
//! the outbound gateway and the status channel, and starts or stops the
//! connection supervisor task. It is cheap to clone and can be shared
//! across tasks; clones control the same channel.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::sync::Arc;

use parking_lot::Mutex;
use pulse_core::CredentialSource;
use pulse_protocol::{Command, Frame};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ChannelConfig;
use crate::error::{ChannelError, Result};
use crate::gateway::OutboundGateway;
use crate::router::{MessageRouter, SubscriptionId, Topic};
use crate::status::{ChannelStatus, ConnectionState};
use crate::supervisor::ConnectionSupervisor;

// ============================================================================
// Realtime Channel
// ============================================================================

/// Handle to one logical realtime channel.
///
/// # Usage
///
/// ```ignore
/// let store = Arc::new(SessionStore::load(&session_path)?);
/// let channel = RealtimeChannel::new(ChannelConfig::default(), store);
///
/// channel.subscribe("series_data", |frame| {
///     if let Ok(series) = frame.series_data() {
///         println!("{} points", series.points().len());
///     }
/// });
///
/// channel.open();
/// channel.get_series("UNRATE")?;
/// // ...
/// channel.teardown().await;
/// ```
#[derive(Clone)]
pub struct RealtimeChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    config: ChannelConfig,
    credentials: Arc<dyn CredentialSource>,
    router: MessageRouter,
    gateway: OutboundGateway,
    status: Arc<watch::Sender<ChannelStatus>>,

    /// Parent of every supervisor's token; cancelling it stops the channel.
    parent_token: CancellationToken,

    /// Supervisor slot; `open` only starts a supervisor when it is empty.
    task: Mutex<TaskSlot>,

    /// Serializes `teardown` calls.
    teardown_lock: tokio::sync::Mutex<()>,
}

struct SupervisorTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

enum TaskSlot {
    Empty,
    Running(SupervisorTask),

    /// A teardown is waiting for the previous supervisor to exit. The
    /// channel counts as busy until it has.
    Stopping,
}

impl RealtimeChannel {
    /// Creates an idle channel.
    ///
    /// # Arguments
    ///
    /// * `config` - Endpoint, backoff and heartbeat settings
    /// * `credentials` - Queried for the access token on every connection attempt
    #[must_use]
    pub fn new(config: ChannelConfig, credentials: Arc<dyn CredentialSource>) -> Self {
        Self::with_cancel_token(config, credentials, CancellationToken::new())
    }

    /// Creates an idle channel that also stops when `cancel_token` is cancelled.
    #[must_use]
    pub fn with_cancel_token(
        config: ChannelConfig,
        credentials: Arc<dyn CredentialSource>,
        cancel_token: CancellationToken,
    ) -> Self {
        let (status_tx, _) = watch::channel(ChannelStatus::default());
        let status = Arc::new(status_tx);
        let gateway = OutboundGateway::new(Arc::clone(&status));

        Self {
            inner: Arc::new(ChannelInner {
                config,
                credentials,
                router: MessageRouter::new(),
                gateway,
                status,
                parent_token: cancel_token,
                task: Mutex::new(TaskSlot::Empty),
                teardown_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Starts the connection supervisor.
    ///
    /// Does nothing if the channel is already running or a teardown is
    /// still in flight, so repeated calls never produce a second
    /// connection. Without an access token the channel stays idle and
    /// reports `credential_missing`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Returns
    ///
    /// `true` if a supervisor was started by this call.
    pub fn open(&self) -> bool {
        let mut slot = self.inner.task.lock();

        match &*slot {
            TaskSlot::Running(task) if !task.handle.is_finished() => {
                debug!("Channel already open");
                return false;
            }
            TaskSlot::Stopping => {
                debug!("Channel teardown in progress");
                return false;
            }
            _ => {}
        }

        if self.inner.credentials.access_token().is_none() {
            warn!("No access token available for WebSocket connection");
            self.inner.status.send_modify(|s| {
                s.transition(ConnectionState::Idle);
                s.reconnecting = false;
                s.credential_missing = true;
            });
            return false;
        }

        self.inner.status.send_modify(|s| {
            s.transition(ConnectionState::Connecting);
            s.reconnecting = false;
            s.attempt = 0;
            s.last_error = None;
            s.credential_missing = false;
        });

        let cancel = self.inner.parent_token.child_token();
        let supervisor = ConnectionSupervisor::new(
            self.inner.config.clone(),
            Arc::clone(&self.inner.credentials),
            self.inner.router.clone(),
            self.inner.gateway.clone(),
            Arc::clone(&self.inner.status),
            cancel.clone(),
        );
        let handle = tokio::spawn(supervisor.run());
        *slot = TaskSlot::Running(SupervisorTask { cancel, handle });

        info!("Channel opened");
        true
    }

    /// Stops the channel.
    ///
    /// Cancels any pending reconnect, closes an open connection with code
    /// 1000 and waits for the supervisor to finish. Subscriptions are kept,
    /// so a later [`open`](Self::open) resumes delivery. Calling this on an
    /// idle channel is a no-op.
    pub async fn teardown(&self) {
        let _serial = self.inner.teardown_lock.lock().await;

        let previous = std::mem::replace(&mut *self.inner.task.lock(), TaskSlot::Stopping);
        let _release = SlotRelease(&self.inner);

        if let TaskSlot::Running(task) = previous {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                warn!(error = %e, "Supervisor task ended abnormally");
            }
            info!("Channel torn down");
        }
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    /// Sends any JSON-serializable command on the open connection.
    ///
    /// # Errors
    ///
    /// - `ChannelError::NotConnected` if no connection is open (the command
    ///   is dropped, not queued)
    /// - `ChannelError::Serialize` if `command` cannot be serialized
    pub fn send<T: Serialize + ?Sized>(&self, command: &T) -> Result<()> {
        self.inner.gateway.send(command)
    }

    /// Requests a series search.
    ///
    /// # Errors
    ///
    /// - `ChannelError::InvalidCommand` if `term` is blank
    /// - Any error from [`send`](Self::send)
    pub fn search_series(&self, term: &str) -> Result<()> {
        let term = term.trim();
        if term.is_empty() {
            return Err(ChannelError::InvalidCommand(
                "search term must not be empty".to_string(),
            ));
        }
        self.send_command(&Command::search_series(term))
    }

    /// Requests the observations of one series.
    ///
    /// # Errors
    ///
    /// - `ChannelError::InvalidCommand` if `series_id` is blank
    /// - Any error from [`send`](Self::send)
    pub fn get_series(&self, series_id: &str) -> Result<()> {
        let series_id = series_id.trim();
        if series_id.is_empty() {
            return Err(ChannelError::InvalidCommand(
                "series id must not be empty".to_string(),
            ));
        }
        self.send_command(&Command::get_series(series_id))
    }

    fn send_command(&self, command: &Command) -> Result<()> {
        debug!(command = command.kind(), "Sending command");
        self.send(command)
    }

    // ------------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------------

    /// Registers a callback for a frame type, or `"*"` for every frame.
    pub fn subscribe<F>(&self, topic: impl Into<Topic>, callback: F) -> SubscriptionId
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        self.inner.router.subscribe(topic, callback)
    }

    /// Registers a subscription that forwards frames into a channel.
    pub fn subscribe_channel(&self, topic: impl Into<Topic>) -> mpsc::UnboundedReceiver<Frame> {
        self.inner.router.subscribe_channel(topic)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.router.unsubscribe(id)
    }

    pub fn router(&self) -> &MessageRouter {
        &self.inner.router
    }

    // ------------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------------

    /// Current status snapshot.
    pub fn status(&self) -> ChannelStatus {
        self.inner.status.borrow().clone()
    }

    /// Receiver notified on every status change.
    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.inner.status.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.gateway.is_open()
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }
}

/// Ends a teardown: detaches the gateway, publishes `Idle` and empties the
/// slot. Runs on drop so a cancelled `teardown` future does not leave the
/// channel stuck in `Stopping`.
struct SlotRelease<'a>(&'a ChannelInner);

impl Drop for SlotRelease<'_> {
    fn drop(&mut self) {
        let inner = self.0;
        let mut slot = inner.task.lock();

        // open() refuses to start a supervisor while the slot is Stopping,
        // so nothing newer owns the gateway yet.
        inner.gateway.detach();
        inner.status.send_modify(|s| {
            s.transition(ConnectionState::Idle);
            s.reconnecting = false;
        });
        *slot = TaskSlot::Empty;
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        if let TaskSlot::Running(task) = self.task.get_mut() {
            task.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for RealtimeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeChannel")
            .field("url", &self.inner.config.url)
            .field("state", &self.inner.status.borrow().state)
            .field("router", &self.inner.router)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
