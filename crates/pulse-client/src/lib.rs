//! Pulse client - realtime channel for macroeconomic data
//!
//! This library maintains one logical, authenticated WebSocket channel to
//! the economic data backend and fans its frames out to subscribers.
//!
//! # Architecture
//!
//! The channel is split into three cooperating parts:
//!
//! 1. **Connection Supervisor**: Opens the socket with the current access
//!    token, heartbeats, and reconnects with exponential backoff
//! 2. **Message Router**: Delivers each inbound frame to wildcard
//!    subscribers, then to subscribers of its `type`
//! 3. **Outbound Gateway**: Sends commands on the open connection, and
//!    drops them (with an error) while disconnected
//!
//! [`RealtimeChannel`] is the handle consumers hold. Connection trouble is
//! never returned as an error; it is published as [`ChannelStatus`] on a
//! `watch` channel. All tasks respect a shared `CancellationToken` for
//! graceful shutdown.

pub mod channel;
pub mod config;
pub mod error;
pub mod gateway;
pub mod router;
pub mod status;
mod supervisor;

// Re-export commonly used types
pub use channel::RealtimeChannel;
pub use config::{ChannelConfig, DEFAULT_URL, TOKEN_QUERY_PARAM};
pub use error::{ChannelError, Result};
pub use gateway::OutboundGateway;
pub use router::{Callback, MessageRouter, SubscriptionId, Topic, WILDCARD};
pub use status::{ChannelStatus, ConnectionState, PARSE_ERROR_MESSAGE, RECONNECTING_MESSAGE};
