//! Pulse - realtime economic data from the command line
//!
//! This binary drives a `RealtimeChannel` against the economic data
//! backend: it streams frames, runs one-off searches and series requests,
//! and manages the persisted session used to authenticate.
//!
//! # Usage
//!
//! ```bash
//! # Store a credential for later runs
//! pulse login --access <token> [--refresh <token>]
//!
//! # Print every frame until Ctrl-C
//! pulse watch
//!
//! # One-off requests
//! pulse search "unemployment rate"
//! pulse series UNRATE --days 365 --moving-average
//!
//! # Forget the stored credential
//! pulse logout
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use pulse_client::{ChannelConfig, ChannelStatus, ConnectionState, RealtimeChannel};
use pulse_core::{
    moving_average, within_days, CredentialSource, SessionStore, SessionTokens, StaticCredential,
    DEFAULT_MOVING_AVERAGE_WINDOW,
};
use pulse_protocol::{frame_types, CloseCode, Frame};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Directory name under the platform config/state dirs.
const APP_DIR: &str = "macro-pulse";

// ============================================================================
// CLI Arguments
// ============================================================================

/// Pulse - realtime economic time series over WebSocket
#[derive(Parser, Debug)]
#[command(name = "pulse", version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Config file (default: <config dir>/macro-pulse/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// WebSocket endpoint, overrides the config file and PULSE_URL
    #[arg(long, global = true)]
    url: Option<String>,

    /// Access token, overrides the stored session and PULSE_TOKEN
    #[arg(long, global = true)]
    token: Option<String>,

    /// Seconds to wait for a response in one-off commands
    #[arg(long, global = true, default_value_t = 10)]
    timeout: u64,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every frame until interrupted
    Watch,
    /// Search for series matching a term
    Search {
        /// Free-text search term
        term: String,
    },
    /// Fetch the observations of one series
    Series {
        /// Series identifier, e.g. UNRATE
        id: String,

        /// Only show observations from the last N days
        #[arg(long)]
        days: Option<u32>,

        /// Add a moving-average column
        #[arg(long)]
        moving_average: bool,
    },
    /// Store a credential in the session file
    Login {
        /// Access token
        #[arg(long)]
        access: String,

        /// Refresh token
        #[arg(long)]
        refresh: Option<String>,
    },
    /// Remove the stored credential
    Logout,
}

// ============================================================================
// Configuration
// ============================================================================

/// Errors reading the config file.
#[derive(Error, Debug)]
enum ConfigError {
    #[error("Failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Contents of `config.toml`. Durations are in milliseconds.
///
/// ```toml
/// url = "wss://data.example.com/ws/economic_data/"
/// retry_initial_delay_ms = 1000
/// retry_max_delay_ms = 30000
/// heartbeat_interval_ms = 30000
/// max_reconnect_attempts = 20
/// ```
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    url: Option<String>,
    token: Option<String>,
    session_file: Option<PathBuf>,
    retry_initial_delay_ms: Option<u64>,
    retry_max_delay_ms: Option<u64>,
    retry_multiplier: Option<f64>,
    heartbeat_interval_ms: Option<u64>,
    max_reconnect_attempts: Option<u32>,
    retry_on_auth_failure: Option<bool>,
    connect_timeout_ms: Option<u64>,
    close_timeout_ms: Option<u64>,
}

impl FileConfig {
    /// Loads `path`. A missing file is an empty config unless `required`.
    fn load(path: &Path, required: bool) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                debug!(path = %path.display(), "No config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies `PULSE_URL` and `PULSE_TOKEN` from `lookup`.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("PULSE_URL").filter(|v| !v.trim().is_empty()) {
            self.url = Some(url);
        }
        if let Some(token) = lookup("PULSE_TOKEN").filter(|v| !v.trim().is_empty()) {
            self.token = Some(token);
        }
    }

    fn channel_config(&self) -> ChannelConfig {
        let defaults = ChannelConfig::default();
        let ms = |value: Option<u64>, default: Duration| {
            value.map(Duration::from_millis).unwrap_or(default)
        };

        ChannelConfig {
            url: self.url.clone().unwrap_or(defaults.url),
            retry_initial_delay: ms(self.retry_initial_delay_ms, defaults.retry_initial_delay),
            retry_max_delay: ms(self.retry_max_delay_ms, defaults.retry_max_delay),
            retry_multiplier: self.retry_multiplier.unwrap_or(defaults.retry_multiplier),
            heartbeat_interval: ms(self.heartbeat_interval_ms, defaults.heartbeat_interval),
            max_reconnect_attempts: self
                .max_reconnect_attempts
                .or(defaults.max_reconnect_attempts),
            retry_on_auth_failure: self
                .retry_on_auth_failure
                .unwrap_or(defaults.retry_on_auth_failure),
            connect_timeout: ms(self.connect_timeout_ms, defaults.connect_timeout),
            close_timeout: ms(self.close_timeout_ms, defaults.close_timeout),
        }
    }
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("config.toml")
}

fn default_session_path() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::config_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(APP_DIR)
        .join("session.json")
}

/// Everything a command needs, resolved from file, environment and flags.
struct Settings {
    channel: ChannelConfig,
    session_path: PathBuf,
    /// Token given explicitly; takes precedence over the session file.
    token: Option<String>,
    response_timeout: Duration,
}

impl Settings {
    fn resolve(args: &Args) -> Result<Self> {
        let (path, required) = match &args.config {
            Some(path) => (path.clone(), true),
            None => (default_config_path(), false),
        };
        let mut file = FileConfig::load(&path, required)?;
        file.apply_env(|key| std::env::var(key).ok());

        let mut channel = file.channel_config();
        if let Some(url) = &args.url {
            channel.url = url.clone();
        }

        Ok(Self {
            channel,
            session_path: file.session_file.clone().unwrap_or_else(default_session_path),
            token: args.token.clone().or(file.token),
            response_timeout: Duration::from_secs(args.timeout.max(1)),
        })
    }

    fn credentials(&self) -> Result<Arc<dyn CredentialSource>> {
        if let Some(token) = &self.token {
            return Ok(Arc::new(StaticCredential::new(token.clone())));
        }
        let store = SessionStore::load(&self.session_path)?;
        Ok(Arc::new(store))
    }
}

// ============================================================================
// Logging Setup
// ============================================================================

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pulse=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

// ============================================================================
// Channel Helpers
// ============================================================================

/// Opens `channel` and waits until it is connected.
///
/// Fails if the channel stops for good (no credential, rejected
/// credential) or `limit` elapses first.
async fn open_and_wait(channel: &RealtimeChannel, limit: Duration) -> Result<()> {
    let mut status = channel.watch_status();
    channel.open();

    let result = tokio::time::timeout(
        limit,
        status.wait_for(|s| s.is_connected() || is_stopped(s)),
    )
    .await
    .context("Timed out waiting for connection")?;

    let snapshot = result.context("Channel dropped")?.clone();
    if snapshot.is_connected() {
        return Ok(());
    }
    bail!(describe_stop(&snapshot))
}

/// Whether the channel has stopped and will not reconnect by itself.
fn is_stopped(status: &ChannelStatus) -> bool {
    status.state == ConnectionState::Idle
        && !status.reconnecting
        && (status.credential_missing || status.last_error.is_some())
}

fn describe_stop(status: &ChannelStatus) -> String {
    if status.credential_missing {
        return "Not logged in: run `pulse login --access <token>` or set PULSE_TOKEN".to_string();
    }
    let message = status
        .last_error
        .clone()
        .unwrap_or_else(|| "Channel stopped".to_string());
    if status.last_close.is_some_and(CloseCode::is_auth_failure) {
        return format!("{message} (run `pulse login` to store a fresh token)");
    }
    message
}

/// Waits for the first frame on `frames`, bounded by `limit`.
async fn next_frame(
    frames: &mut mpsc::UnboundedReceiver<Frame>,
    status: &mut watch::Receiver<ChannelStatus>,
    limit: Duration,
) -> Result<Frame> {
    let wait = async {
        loop {
            tokio::select! {
                frame = frames.recv() => {
                    return frame.context("Channel dropped");
                }
                changed = status.changed() => {
                    changed.context("Channel dropped")?;
                    let snapshot = status.borrow_and_update().clone();
                    if is_stopped(&snapshot) {
                        bail!(describe_stop(&snapshot));
                    }
                }
            }
        }
    };

    tokio::time::timeout(limit, wait)
        .await
        .context("Timed out waiting for a response")?
}

// ============================================================================
// Commands
// ============================================================================

async fn run_watch(channel: &RealtimeChannel, cancel_token: &CancellationToken) -> Result<()> {
    let mut frames = channel.subscribe_channel("*");
    let mut status = channel.watch_status();
    channel.open();

    let mut last_state = status.borrow().state;
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                info!("Stopping watch");
                return Ok(());
            }
            Some(frame) = frames.recv() => {
                println!("{}", frame.into_value());
            }
            changed = status.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let snapshot = status.borrow_and_update().clone();
                if snapshot.state != last_state {
                    info!(state = ?snapshot.state, attempt = snapshot.attempt, "Channel state changed");
                    last_state = snapshot.state;
                }
                if snapshot.reconnecting {
                    if let Some(message) = &snapshot.last_error {
                        warn!("{message}");
                    }
                }
                if is_stopped(&snapshot) {
                    bail!(describe_stop(&snapshot));
                }
            }
        }
    }
}

async fn run_search(channel: &RealtimeChannel, term: &str, limit: Duration) -> Result<()> {
    let term = term.trim();
    if term.is_empty() {
        bail!("Search term must not be empty");
    }

    let mut frames = channel.subscribe_channel(frame_types::SEARCH_RESULTS);
    let mut status = channel.watch_status();
    open_and_wait(channel, limit).await?;
    channel.search_series(term)?;

    let frame = next_frame(&mut frames, &mut status, limit).await?;
    let results = frame.search_results()?;

    for series in results.series() {
        println!("{:<20} {} ({})", series.id, series.title, series.frequency);
    }
    println!("{} of {} matches", results.series().len(), results.total());
    Ok(())
}

async fn run_series(
    channel: &RealtimeChannel,
    id: &str,
    days: Option<u32>,
    with_average: bool,
    limit: Duration,
) -> Result<()> {
    let mut frames = channel.subscribe_channel(frame_types::SERIES_DATA);
    let mut status = channel.watch_status();
    open_and_wait(channel, limit).await?;
    channel.get_series(id)?;

    let frame = next_frame(&mut frames, &mut status, limit).await?;
    let data = frame.series_data()?;
    if let Some(message) = &data.error {
        bail!("Server error for {id}: {message}");
    }

    let mut points = data.points();
    if let Some(days) = days {
        points = within_days(&points, days, Utc::now().date_naive());
    }

    if let Some(title) = &data.title {
        println!("{title}");
    }
    if let Some(units) = &data.units {
        println!("Units: {units}");
    }

    if with_average {
        let averages = moving_average(&points, DEFAULT_MOVING_AVERAGE_WINDOW);
        for (point, average) in points.iter().zip(averages) {
            println!("{}  {:>14.3}  {:>14.3}", point.date, point.value, average);
        }
    } else {
        for point in &points {
            println!("{}  {:>14.3}", point.date, point.value);
        }
    }

    let skipped = data.skipped_count();
    if skipped > 0 {
        info!(skipped, "Skipped observations without a numeric value");
    }
    Ok(())
}

fn run_login(session_path: &Path, access: String, refresh: Option<String>) -> Result<()> {
    let tokens = SessionTokens::new(access, refresh)?;
    let store = SessionStore::with_tokens(tokens);
    store.save(session_path)?;
    println!("Session saved to {}", session_path.display());
    Ok(())
}

fn run_logout(session_path: &Path) -> Result<()> {
    let store = SessionStore::load(session_path)?;
    store.clear();
    store.save(session_path)?;
    println!("Logged out");
    Ok(())
}

/// Cancels `cancel_token` on Ctrl-C.
fn spawn_signal_task(cancel_token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C");
                cancel_token.cancel();
            }
            Err(e) => error!(error = %e, "Error waiting for shutdown signal"),
        }
    });
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();

    let settings = Settings::resolve(&args)?;

    // Session management does not touch the network
    match &args.command {
        Command::Login { access, refresh } => {
            return run_login(&settings.session_path, access.clone(), refresh.clone());
        }
        Command::Logout => return run_logout(&settings.session_path),
        _ => {}
    }

    let cancel_token = CancellationToken::new();
    spawn_signal_task(cancel_token.clone());

    let channel = RealtimeChannel::with_cancel_token(
        settings.channel.clone(),
        settings.credentials()?,
        cancel_token.clone(),
    );
    info!(url = %settings.channel.url, "Pulse starting");

    let limit = settings.response_timeout;
    let result = tokio::select! {
        result = async {
            match &args.command {
                Command::Watch => run_watch(&channel, &cancel_token).await,
                Command::Search { term } => run_search(&channel, term, limit).await,
                Command::Series { id, days, moving_average } => {
                    run_series(&channel, id, *days, *moving_average, limit).await
                }
                Command::Login { .. } | Command::Logout => Ok(()),
            }
        } => result,
        _ = cancel_token.cancelled() => Ok(()),
    };

    channel.teardown().await;
    info!("Pulse stopped");
    result
}

// ============================================================================
// Tests
// ============================================================================
