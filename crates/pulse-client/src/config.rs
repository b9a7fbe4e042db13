//! Configuration for the realtime channel.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::time::Duration;

use url::Url;

use crate::error::{ChannelError, Result};

/// Default endpoint of the economic data stream.
pub const DEFAULT_URL: &str = "ws://127.0.0.1:8000/ws/economic_data/";

/// Query parameter carrying the bearer credential.
pub const TOKEN_QUERY_PARAM: &str = "token";

/// Upper bound on the exponent used by [`ChannelConfig::backoff_delay`].
const MAX_BACKOFF_EXPONENT: u32 = 64;

/// Configuration for the realtime channel.
///
/// Controls the endpoint, reconnect backoff, heartbeat period and the
/// policy applied when the server rejects the credential.
///
/// # Example
///
/// ```rust
/// use pulse_client::config::ChannelConfig;
/// use std::time::Duration;
///
/// let config = ChannelConfig {
///     url: "ws://localhost:8000/ws/indicators/".to_string(),
///     retry_initial_delay: Duration::from_millis(500),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// WebSocket endpoint, without the token parameter.
    pub url: String,

    /// Delay before the first reconnect after a failure.
    pub retry_initial_delay: Duration,

    /// Maximum delay between reconnect attempts.
    pub retry_max_delay: Duration,

    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each retry).
    pub retry_multiplier: f64,

    /// Period of the keepalive heartbeat while connected.
    pub heartbeat_interval: Duration,

    /// Give up after this many consecutive reconnect attempts.
    ///
    /// `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,

    /// Keep retrying after the server rejects the credential.
    pub retry_on_auth_failure: bool,

    /// Time allowed for the TCP connect and WebSocket upgrade.
    pub connect_timeout: Duration,

    /// Time allowed for the server to answer a client close frame.
    pub close_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            retry_initial_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            retry_multiplier: 2.0,
            heartbeat_interval: Duration::from_secs(30),
            max_reconnect_attempts: None,
            retry_on_auth_failure: false,
            connect_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(1),
        }
    }
}

impl ChannelConfig {
    /// Creates a configuration for `url` with default timings.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Delay before the reconnect that follows `attempt` earlier attempts.
    ///
    /// `min(initial * multiplier^attempt, max)`; with the defaults this is
    /// 1s, 2s, 4s, 8s, 16s, then 30s forever.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(MAX_BACKOFF_EXPONENT) as i32;
        let initial_ms = self.retry_initial_delay.as_millis() as f64;
        let max_ms = self.retry_max_delay.as_millis() as f64;
        let delay_ms = initial_ms * self.retry_multiplier.powi(exponent);

        if !delay_ms.is_finite() || delay_ms >= max_ms {
            return self.retry_max_delay;
        }
        Duration::from_millis(delay_ms.max(0.0) as u64)
    }

    /// Builds the connection URI carrying `token` as a query parameter.
    ///
    /// Other query parameters are preserved; an existing token is replaced.
    pub fn connection_url(&self, token: &str) -> Result<Url> {
        let mut url = Url::parse(&self.url).map_err(|e| ChannelError::InvalidUrl {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;

        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ChannelError::InvalidUrl {
                url: self.url.clone(),
                reason: format!("unsupported scheme `{}`", url.scheme()),
            });
        }

        let retained: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(key, _)| key != TOKEN_QUERY_PARAM)
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();

        url.query_pairs_mut()
            .clear()
            .extend_pairs(retained)
            .append_pair(TOKEN_QUERY_PARAM, token);

        Ok(url)
    }
}

// ============================================================================
// Tests
// ============================================================================
