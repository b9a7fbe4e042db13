//! Observable state of the realtime channel.
//!
//! The supervisor publishes a [`ChannelStatus`] on a `tokio::sync::watch`
//! channel; consumers render it (connected indicator, reconnecting banner,
//! last error) instead of receiving errors.

use chrono::{DateTime, Utc};
use pulse_protocol::CloseCode;

/// Message shown while waiting to reconnect.
pub const RECONNECTING_MESSAGE: &str = "WebSocket disconnected. Attempting to reconnect...";

/// Message recorded when an inbound frame is not valid JSON.
pub const PARSE_ERROR_MESSAGE: &str = "Error parsing WebSocket message";

/// Lifecycle state of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not running: never opened, torn down, or stopped for good.
    #[default]
    Idle,

    /// Opening a physical connection.
    Connecting,

    /// Physical connection open; commands can be sent.
    Connected,

    /// Physical connection lost; a reconnect may be pending.
    Disconnected,
}

/// Snapshot of the channel for display.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStatus {
    pub state: ConnectionState,

    /// A reconnect is scheduled or in progress.
    pub reconnecting: bool,

    /// Reconnect attempts since the last successful open.
    pub attempt: u32,

    /// Most recent error, cleared on successful open.
    pub last_error: Option<String>,

    /// The last open found no credential in the session store.
    pub credential_missing: bool,

    /// Close code of the previous physical connection, if one was received.
    pub last_close: Option<CloseCode>,

    /// When `state` last changed.
    pub since: DateTime<Utc>,
}

impl Default for ChannelStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            reconnecting: false,
            attempt: 0,
            last_error: None,
            credential_missing: false,
            last_close: None,
            since: Utc::now(),
        }
    }
}

impl ChannelStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Moves to `state`, stamping the transition time when it changes.
    pub(crate) fn transition(&mut self, state: ConnectionState) {
        if self.state != state {
            self.state = state;
            self.since = Utc::now();
        }
    }
}
