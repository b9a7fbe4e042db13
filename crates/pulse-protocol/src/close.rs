//! Close-code convention of the realtime endpoint.
//!
//! | Code        | Meaning                                  |
//! |-------------|------------------------------------------|
//! | 1000        | Intentional close                        |
//! | 4001        | Authentication failed: no token          |
//! | 4002        | Authentication failed: invalid/expired   |
//! | 4003        | Authentication failed: generic           |
//! | 1011        | Server error                             |
//! | anything else | Abnormal                               |

use std::fmt;

use serde::{Deserialize, Serialize};

/// A WebSocket close status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CloseCode(pub u16);

impl CloseCode {
    pub const NORMAL: CloseCode = CloseCode(1000);
    pub const GOING_AWAY: CloseCode = CloseCode(1001);
    /// Reserved code for a connection lost without a close frame.
    pub const ABNORMAL: CloseCode = CloseCode(1006);
    pub const SERVER_ERROR: CloseCode = CloseCode(1011);
    pub const AUTH_NO_TOKEN: CloseCode = CloseCode(4001);
    pub const AUTH_INVALID_TOKEN: CloseCode = CloseCode(4002);
    pub const AUTH_FAILED: CloseCode = CloseCode(4003);

    /// Classifies the code per the endpoint's convention.
    pub fn kind(self) -> CloseKind {
        match self.0 {
            1000 => CloseKind::Intentional,
            4001 => CloseKind::AuthFailure(AuthFailure::NoToken),
            4002 => CloseKind::AuthFailure(AuthFailure::InvalidToken),
            4003 => CloseKind::AuthFailure(AuthFailure::Rejected),
            1011 => CloseKind::ServerError,
            _ => CloseKind::Abnormal,
        }
    }

    pub fn is_auth_failure(self) -> bool {
        matches!(self.kind(), CloseKind::AuthFailure(_))
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        Self(code)
    }
}

/// What a close code means for the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    Intentional,
    AuthFailure(AuthFailure),
    ServerError,
    Abnormal,
}

/// The authentication failures distinguished by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    NoToken,
    InvalidToken,
    Rejected,
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NoToken => "no token provided",
            Self::InvalidToken => "invalid or expired token",
            Self::Rejected => "authentication error",
        };
        f.write_str(text)
    }
}
