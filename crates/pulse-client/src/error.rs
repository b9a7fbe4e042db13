//! Error types for the realtime channel client.
//!
//! Nothing in this crate is fatal to the process: connection failures are
//! handled by the supervisor and surface as [`crate::ChannelStatus`]. The
//! errors below are returned to consumers that call into the channel.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use thiserror::Error;

// ============================================================================
// Channel Error Type
// ============================================================================

/// Realtime channel errors.
///
/// # Example
///
/// ```rust,ignore
/// use pulse_client::error::{ChannelError, Result};
///
/// fn request(channel: &RealtimeChannel) -> Result<()> {
///     channel.get_series("UNRATE")?;
///     Ok(())
/// }
/// ```
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The physical connection is not open; the command was dropped.
    ///
    /// Commands are never queued for a later connection. Reissue the
    /// command once the channel reports `Connected` again.
    #[error("WebSocket is not connected")]
    NotConnected,

    /// The configured endpoint cannot be used.
    #[error("Invalid channel URL {url}: {reason}")]
    InvalidUrl {
        /// The configured endpoint.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A command was refused before being sent.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// The command could not be serialized to JSON.
    #[error("Failed to serialize command: {0}")]
    Serialize(#[from] serde_json::Error),
}

// ============================================================================
// Result Type Alias
// ============================================================================

/// Convenience Result type alias for channel operations.
pub type Result<T> = std::result::Result<T, ChannelError>;

// ============================================================================
// Tests
// ============================================================================
