//! Protocol message types for the realtime channel.
//!
//! Outbound traffic is a small closed set of [`Command`]s. Inbound traffic
//! is deliberately loose: a [`Frame`] is any JSON value, routed by its
//! optional `type` string, with a payload whose shape depends on that type.

use pulse_core::{SearchResults, SeriesData};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};

/// Frame `type` values sent by the server.
pub mod frame_types {
    /// Series observations, payload in `data`.
    pub const SERIES_DATA: &str = "series_data";
    /// Search matches, payload in `results`.
    pub const SEARCH_RESULTS: &str = "search_results";
    /// Greeting sent after the server accepts the connection.
    pub const WELCOME: &str = "welcome";
    /// Greeting sent by the economic data stream.
    pub const INITIAL_DATA: &str = "initial_data";
    /// Server-initiated keepalive.
    pub const HEARTBEAT: &str = "heartbeat";
    /// Reply to a client heartbeat.
    pub const HEARTBEAT_ACK: &str = "heartbeat_ack";
    /// Echo of an unrecognised command.
    pub const ECHO: &str = "echo";
    /// Server-side error report, text in `message`.
    pub const ERROR: &str = "error";
}

// ============================================================================
// Outbound Commands
// ============================================================================

/// Commands sent from the client to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Keepalive, sent on open and periodically while connected
    Heartbeat,

    /// Full-text search over available series
    SearchSeries {
        /// Text to search for
        search_term: String,
    },

    /// Request observations for one series
    GetSeries {
        /// Series identifier (e.g. "GDP", "UNRATE")
        series_id: String,
    },
}

impl Command {
    /// Creates a heartbeat command.
    pub fn heartbeat() -> Self {
        Self::Heartbeat
    }

    /// Creates a search command.
    pub fn search_series(search_term: impl Into<String>) -> Self {
        Self::SearchSeries {
            search_term: search_term.into(),
        }
    }

    /// Creates a series request.
    pub fn get_series(series_id: impl Into<String>) -> Self {
        Self::GetSeries {
            series_id: series_id.into(),
        }
    }

    /// The wire `type` of this command.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Heartbeat => "heartbeat",
            Self::SearchSeries { .. } => "search_series",
            Self::GetSeries { .. } => "get_series",
        }
    }
}

// ============================================================================
// Inbound Frames
// ============================================================================

/// One inbound message from the server.
///
/// No schema is enforced beyond being valid JSON; a frame without a string
/// `type` is still a frame, it just has no [`Frame::kind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Frame(serde_json::Value);

impl Frame {
    /// Wraps an already-parsed JSON value.
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// Parses a text frame.
    pub fn parse(text: &str) -> ProtocolResult<Self> {
        Ok(Self(serde_json::from_str(text)?))
    }

    /// The routing discriminator, when present and a string.
    pub fn kind(&self) -> Option<&str> {
        self.0.get("type").and_then(serde_json::Value::as_str)
    }

    /// A top-level attribute of the frame.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_value(self) -> serde_json::Value {
        self.0
    }

    /// Decodes the attribute `field` as `T`.
    pub fn decode_field<T: DeserializeOwned>(&self, field: &'static str) -> ProtocolResult<T> {
        let value = self.get(field).ok_or(ProtocolError::MissingField { field })?;
        T::deserialize(value).map_err(|source| ProtocolError::InvalidPayload { field, source })
    }

    /// Decodes the `data` payload of a `series_data` frame.
    pub fn series_data(&self) -> ProtocolResult<SeriesData> {
        self.expect_kind(frame_types::SERIES_DATA)?;
        self.decode_field("data")
    }

    /// Decodes the `results` payload of a `search_results` frame.
    pub fn search_results(&self) -> ProtocolResult<SearchResults> {
        self.expect_kind(frame_types::SEARCH_RESULTS)?;
        self.decode_field("results")
    }

    /// The `message` text of an `error` frame.
    pub fn error_message(&self) -> Option<&str> {
        if self.kind() != Some(frame_types::ERROR) {
            return None;
        }
        self.get("message").and_then(serde_json::Value::as_str)
    }

    fn expect_kind(&self, expected: &'static str) -> ProtocolResult<()> {
        match self.kind() {
            Some(kind) if kind == expected => Ok(()),
            other => Err(ProtocolError::UnexpectedType {
                expected,
                actual: other.map(str::to_string),
            }),
        }
    }
}

impl From<serde_json::Value> for Frame {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}
