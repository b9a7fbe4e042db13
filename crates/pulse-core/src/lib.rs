//! Pulse Core - Shared domain types for Macro Pulse
//!
//! This crate provides the types shared between the wire protocol,
//! the realtime channel client and the command-line consumer:
//! session credentials and economic series payloads.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod series;
pub mod session;

// Re-exports for convenience
pub use error::{DomainError, DomainResult};
pub use series::{
    moving_average, within_days, Observation, SearchResults, SeriesData, SeriesPoint,
    SeriesSummary, DEFAULT_MOVING_AVERAGE_WINDOW,
};
pub use session::{CredentialSource, SessionStore, SessionTokens, StaticCredential};
