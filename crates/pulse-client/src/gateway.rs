//! Outbound gateway: serializes commands onto the live connection.
//!
//! The supervisor attaches a per-connection queue when a physical
//! connection opens and detaches it the moment that connection is lost.
//! Sending while detached drops the command. There is no buffering across
//! connections: the queue dies with the connection it belongs to.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::{ChannelError, Result};
use crate::status::ChannelStatus;

/// Text frames queued for the current physical connection.
pub(crate) type OutboundSender = mpsc::UnboundedSender<String>;

/// Sends commands over the currently open connection, if any.
#[derive(Clone)]
pub struct OutboundGateway {
    link: Arc<Mutex<Option<OutboundSender>>>,
    status: Arc<watch::Sender<ChannelStatus>>,
}

impl OutboundGateway {
    pub(crate) fn new(status: Arc<watch::Sender<ChannelStatus>>) -> Self {
        Self {
            link: Arc::new(Mutex::new(None)),
            status,
        }
    }

    /// Routes subsequent sends to a newly opened connection.
    pub(crate) fn attach(&self, sender: OutboundSender) {
        *self.link.lock() = Some(sender);
    }

    /// Stops routing sends; anything still queued is dropped with the sender.
    pub(crate) fn detach(&self) {
        self.link.lock().take();
    }

    /// Detaches `sender` if it is still the attached one. A newer
    /// connection's queue is left alone.
    pub(crate) fn release(&self, sender: &OutboundSender) {
        let mut link = self.link.lock();
        if link.as_ref().is_some_and(|current| current.same_channel(sender)) {
            link.take();
        }
    }

    /// Whether a physical connection is currently open.
    pub fn is_open(&self) -> bool {
        self.link
            .lock()
            .as_ref()
            .is_some_and(|sender| !sender.is_closed())
    }

    /// Serializes `command` and transmits it on the open connection.
    ///
    /// # Errors
    ///
    /// - `ChannelError::Serialize` if the command is not JSON-serializable
    /// - `ChannelError::NotConnected` if no connection is open; the command
    ///   is dropped and recorded as the channel's last error
    pub fn send<T: Serialize + ?Sized>(&self, command: &T) -> Result<()> {
        let text = serde_json::to_string(command)?;

        let sent = match self.link.lock().as_ref() {
            Some(sender) => sender.send(text).is_ok(),
            None => false,
        };

        if sent {
            debug!("Queued command for send");
            return Ok(());
        }

        warn!("WebSocket is not connected, dropping command");
        self.status.send_modify(|status| {
            status.last_error = Some(ChannelError::NotConnected.to_string());
        });
        Err(ChannelError::NotConnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_protocol::Command;

    fn gateway() -> (OutboundGateway, watch::Receiver<ChannelStatus>) {
        let (tx, rx) = watch::channel(ChannelStatus::default());
        (OutboundGateway::new(Arc::new(tx)), rx)
    }

    #[test]
    fn test_send_while_detached_is_dropped() {
        let (gateway, status) = gateway();

        let result = gateway.send(&Command::get_series("GDP"));

        assert!(matches!(result, Err(ChannelError::NotConnected)));
        assert!(!gateway.is_open());
        assert_eq!(
            status.borrow().last_error.as_deref(),
            Some("WebSocket is not connected")
        );
    }

    #[test]
    fn test_send_while_attached_queues_json() {
        let (gateway, _status) = gateway();
        let (tx, mut rx) = mpsc::unbounded_channel();
        gateway.attach(tx);

        gateway.send(&Command::search_series("inflation")).unwrap();

        assert!(gateway.is_open());
        let text = rx.try_recv().unwrap();
        assert_eq!(text, r#"{"type":"search_series","search_term":"inflation"}"#);
    }

    #[test]
    fn test_arbitrary_json_commands() {
        let (gateway, _status) = gateway();
        let (tx, mut rx) = mpsc::unbounded_channel();
        gateway.attach(tx);

        gateway
            .send(&serde_json::json!({"type": "subscribe", "series": ["GDP"]}))
            .unwrap();

        let value: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(value["type"], "subscribe");
    }

    #[test]
    fn test_detach_drops_and_never_replays() {
        let (gateway, _status) = gateway();
        let (old_tx, mut old_rx) = mpsc::unbounded_channel();
        gateway.attach(old_tx);
        gateway.detach();

        assert!(gateway.send(&Command::get_series("UNRATE")).is_err());

        let (new_tx, mut new_rx) = mpsc::unbounded_channel();
        gateway.attach(new_tx);

        assert!(old_rx.try_recv().is_err());
        assert!(new_rx.try_recv().is_err());
    }

    #[test]
    fn test_release_keeps_newer_connection() {
        let (gateway, _status) = gateway();
        let (old_tx, _old_rx) = mpsc::unbounded_channel();
        let (new_tx, mut new_rx) = mpsc::unbounded_channel();
        gateway.attach(old_tx.clone());
        gateway.attach(new_tx.clone());

        gateway.release(&old_tx);
        gateway.send(&Command::heartbeat()).unwrap();
        assert_eq!(new_rx.try_recv().unwrap(), r#"{"type":"heartbeat"}"#);

        gateway.release(&new_tx);
        assert!(!gateway.is_open());
    }

    #[test]
    fn test_closed_receiver_counts_as_not_open() {
        let (gateway, _status) = gateway();
        let (tx, rx) = mpsc::unbounded_channel();
        gateway.attach(tx);
        drop(rx);

        assert!(!gateway.is_open());
        assert!(matches!(
            gateway.send(&Command::heartbeat()),
            Err(ChannelError::NotConnected)
        ));
    }
}
