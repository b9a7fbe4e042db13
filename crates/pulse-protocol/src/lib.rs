//! Pulse Protocol - Wire protocol for the realtime channel
//!
//! This crate provides the outbound command types, the loosely typed
//! inbound frame, typed payload decoding for the frames consumers care
//! about, and the endpoint's close-code convention.

pub mod close;
pub mod error;
pub mod message;

pub use close::{AuthFailure, CloseCode, CloseKind};
pub use error::{ProtocolError, ProtocolResult};
pub use message::{frame_types, Command, Frame};
