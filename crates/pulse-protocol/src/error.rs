//! Protocol decoding errors.

use thiserror::Error;

/// Errors raised while decoding inbound frames.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Frame text is not valid JSON
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Frame carries a different `type` than the decoder expects
    #[error("Expected a {expected} frame, got {actual:?}")]
    UnexpectedType {
        expected: &'static str,
        actual: Option<String>,
    },

    /// Payload attribute absent from the frame
    #[error("Frame has no `{field}` attribute")]
    MissingField { field: &'static str },

    /// Payload attribute present but of the wrong shape
    #[error("Invalid `{field}` payload: {source}")]
    InvalidPayload {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Result type for protocol decoding.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
