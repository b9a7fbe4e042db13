//! Message router: fans inbound frames out to subscribers.
//!
//! Subscriptions are kept in one list in registration order. A dispatch
//! pass snapshots the matching subscriptions (wildcards first, then the
//! frame's type) and releases the lock before invoking any callback, so a
//! callback may subscribe or unsubscribe freely. Before each invocation the
//! subscription is checked again; one removed earlier in the same pass is
//! skipped.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use pulse_protocol::Frame;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Topic string that matches every frame.
pub const WILDCARD: &str = "*";

/// Subscriber callback.
pub type Callback = Arc<dyn Fn(&Frame) + Send + Sync>;

// ============================================================================
// Topics and Handles
// ============================================================================

/// What a subscription listens to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Every frame, whatever its type.
    Any,
    /// Frames whose `type` equals the string.
    Type(String),
}

impl Topic {
    pub fn of(kind: impl Into<String>) -> Self {
        Self::Type(kind.into())
    }

    fn matches_type(&self, kind: Option<&str>) -> bool {
        match self {
            Self::Any => false,
            Self::Type(t) => Some(t.as_str()) == kind,
        }
    }
}

impl From<&str> for Topic {
    fn from(s: &str) -> Self {
        if s == WILDCARD {
            Self::Any
        } else {
            Self::Type(s.to_string())
        }
    }
}

impl From<String> for Topic {
    fn from(s: String) -> Self {
        Topic::from(s.as_str())
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str(WILDCARD),
            Self::Type(t) => f.write_str(t),
        }
    }
}

/// Handle returned by [`MessageRouter::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

// ============================================================================
// Router
// ============================================================================

struct Subscription {
    id: SubscriptionId,
    topic: Topic,
    callback: Callback,
}

#[derive(Default)]
struct RouterInner {
    next_id: u64,
    subscriptions: Vec<Subscription>,
}

impl RouterInner {
    fn insert(&mut self, topic: Topic, make: impl FnOnce(SubscriptionId) -> Callback) -> SubscriptionId {
        self.next_id = self.next_id.saturating_add(1);
        let id = SubscriptionId(self.next_id);
        let callback = make(id);
        self.subscriptions.push(Subscription { id, topic, callback });
        id
    }

    fn remove(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.id != id);
        self.subscriptions.len() != before
    }

    fn contains(&self, id: SubscriptionId) -> bool {
        self.subscriptions.iter().any(|s| s.id == id)
    }
}

/// Publish/subscribe registry for inbound frames.
///
/// Cheap to clone; clones share the same subscriptions.
#[derive(Clone, Default)]
pub struct MessageRouter {
    inner: Arc<Mutex<RouterInner>>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for `topic` (a frame type, or [`WILDCARD`]).
    pub fn subscribe<F>(&self, topic: impl Into<Topic>, callback: F) -> SubscriptionId
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        let topic = topic.into();
        let id = self
            .inner
            .lock()
            .insert(topic.clone(), |_| Arc::new(callback));
        debug!(%topic, subscription = ?id, "Subscribed");
        id
    }

    /// Registers a forwarding subscription and returns its receiving end.
    ///
    /// The subscription removes itself on the first frame after the
    /// receiver is dropped.
    pub fn subscribe_channel(&self, topic: impl Into<Topic>) -> mpsc::UnboundedReceiver<Frame> {
        let (tx, rx) = mpsc::unbounded_channel();
        let weak: Weak<Mutex<RouterInner>> = Arc::downgrade(&self.inner);

        let topic = topic.into();
        let id = self.inner.lock().insert(topic.clone(), |id| {
            Arc::new(move |frame: &Frame| {
                if tx.send(frame.clone()).is_err() {
                    if let Some(inner) = weak.upgrade() {
                        inner.lock().remove(id);
                        debug!(subscription = ?id, "Receiver dropped, subscription removed");
                    }
                }
            })
        });
        debug!(%topic, subscription = ?id, "Subscribed channel");
        rx
    }

    /// Removes a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.inner.lock().remove(id);
        if removed {
            debug!(subscription = ?id, "Unsubscribed");
        }
        removed
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.inner.lock().subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `frame` to wildcard subscribers, then to subscribers of its
    /// type, each group in registration order.
    ///
    /// Returns the number of callbacks invoked. A panicking callback is
    /// logged and does not stop delivery to the rest.
    pub fn dispatch(&self, frame: &Frame) -> usize {
        let kind = frame.kind();
        let targets: Vec<(SubscriptionId, Callback)> = {
            let inner = self.inner.lock();
            let wildcards = inner.subscriptions.iter().filter(|s| s.topic == Topic::Any);
            let typed = inner.subscriptions.iter().filter(|s| s.topic.matches_type(kind));
            wildcards
                .chain(typed)
                .map(|s| (s.id, Arc::clone(&s.callback)))
                .collect()
        };

        let mut delivered = 0;
        for (id, callback) in targets {
            if !self.inner.lock().contains(id) {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| callback(frame))).is_err() {
                error!(subscription = ?id, frame_type = ?kind, "Subscriber panicked");
            }
            delivered += 1;
        }
        delivered
    }
}

impl fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageRouter")
            .field("subscriptions", &self.len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Records the labels of invoked callbacks in order.
    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Box<dyn Fn(&Frame) + Send + Sync>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_for_make = Arc::clone(&log);
        let make = move |label: &str| {
            let log = Arc::clone(&log_for_make);
            let label = label.to_string();
            Box::new(move |_: &Frame| log.lock().push(label.clone())) as Box<dyn Fn(&Frame) + Send + Sync>
        };
        (log, make)
    }

    fn frame(kind: &str) -> Frame {
        Frame::new(json!({ "type": kind }))
    }

    #[test]
    fn test_wildcards_before_typed_in_registration_order() {
        let router = MessageRouter::new();
        let (log, make) = recorder();

        router.subscribe("series_data", make("typed-1"));
        router.subscribe(WILDCARD, make("any-1"));
        router.subscribe("series_data", make("typed-2"));
        router.subscribe(Topic::Any, make("any-2"));
        router.subscribe("search_results", make("other"));

        let delivered = router.dispatch(&frame("series_data"));

        assert_eq!(delivered, 4);
        assert_eq!(*log.lock(), vec!["any-1", "any-2", "typed-1", "typed-2"]);
    }

    #[test]
    fn test_unknown_or_missing_type_reaches_only_wildcards() {
        let router = MessageRouter::new();
        let (log, make) = recorder();

        router.subscribe("series_data", make("typed"));
        router.subscribe(WILDCARD, make("any"));

        router.dispatch(&frame("something_new"));
        router.dispatch(&Frame::new(json!({"no_type": true})));

        assert_eq!(*log.lock(), vec!["any", "any"]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let router = MessageRouter::new();
        let (log, make) = recorder();

        let id = router.subscribe("echo", make("echo"));
        router.dispatch(&frame("echo"));
        assert!(router.unsubscribe(id));
        assert!(!router.unsubscribe(id));
        router.dispatch(&frame("echo"));

        assert_eq!(*log.lock(), vec!["echo"]);
        assert!(router.is_empty());
    }

    #[test]
    fn test_unsubscribe_pending_subscriber_during_dispatch() {
        let router = MessageRouter::new();
        let (log, make) = recorder();

        let victim_slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let router_clone = router.clone();
        let slot = Arc::clone(&victim_slot);
        let first_log = Arc::clone(&log);
        router.subscribe("welcome", move |_: &Frame| {
            first_log.lock().push("first".to_string());
            if let Some(id) = *slot.lock() {
                router_clone.unsubscribe(id);
            }
        });
        let victim = router.subscribe("welcome", make("victim"));
        *victim_slot.lock() = Some(victim);
        router.subscribe("welcome", make("last"));

        let delivered = router.dispatch(&frame("welcome"));

        assert_eq!(delivered, 2);
        assert_eq!(*log.lock(), vec!["first", "last"]);
    }

    #[test]
    fn test_self_unsubscribe_during_dispatch() {
        let router = MessageRouter::new();
        let (log, make) = recorder();

        let own_id: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let router_clone = router.clone();
        let slot = Arc::clone(&own_id);
        let once_log = Arc::clone(&log);
        let id = router.subscribe(WILDCARD, move |_: &Frame| {
            once_log.lock().push("once".to_string());
            if let Some(id) = *slot.lock() {
                router_clone.unsubscribe(id);
            }
        });
        *own_id.lock() = Some(id);
        router.subscribe(WILDCARD, make("always"));

        router.dispatch(&frame("a"));
        router.dispatch(&frame("b"));

        assert_eq!(*log.lock(), vec!["once", "always", "always"]);
    }

    #[test]
    fn test_subscribe_during_dispatch_starts_next_frame() {
        let router = MessageRouter::new();
        let (log, make) = recorder();

        let router_clone = router.clone();
        let added = Arc::new(Mutex::new(false));
        let make = Arc::new(make);
        let make_clone = Arc::clone(&make);
        router.subscribe(WILDCARD, move |_: &Frame| {
            let mut added = added.lock();
            if !*added {
                *added = true;
                router_clone.subscribe(WILDCARD, (*make_clone)("late"));
            }
        });

        router.dispatch(&frame("a"));
        assert!(log.lock().is_empty());

        router.dispatch(&frame("b"));
        assert_eq!(*log.lock(), vec!["late"]);
    }

    #[test]
    fn test_panicking_subscriber_does_not_block_others() {
        let router = MessageRouter::new();
        let (log, make) = recorder();

        router.subscribe(WILDCARD, |_: &Frame| panic!("subscriber bug"));
        router.subscribe(WILDCARD, make("survivor"));

        let delivered = router.dispatch(&frame("x"));

        assert_eq!(delivered, 2);
        assert_eq!(*log.lock(), vec!["survivor"]);
    }

    #[test]
    fn test_series_payload_delivered_untouched() {
        let router = MessageRouter::new();
        let received = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&received);
        router.subscribe("series_data", move |frame: &Frame| {
            *sink.lock() = Some(frame.clone());
        });

        let text = r#"{"type":"series_data","data":{"observations":[{"date":"2020-01-01","value":"5.1"},{"date":"2020-02-01","value":"bad"}]}}"#;
        let frame = Frame::parse(text).unwrap();
        router.dispatch(&frame);

        let got = received.lock().clone().unwrap();
        assert_eq!(got, frame);
        assert_eq!(got.as_value()["data"]["observations"][1]["value"], "bad");
    }

    #[tokio::test]
    async fn test_subscribe_channel_forwards_and_cleans_up() {
        let router = MessageRouter::new();
        let mut rx = router.subscribe_channel("search_results");

        router.dispatch(&frame("search_results"));
        router.dispatch(&frame("series_data"));

        let got = rx.recv().await.unwrap();
        assert_eq!(got.kind(), Some("search_results"));
        assert!(rx.try_recv().is_err());
        assert_eq!(router.len(), 1);

        drop(rx);
        router.dispatch(&frame("search_results"));
        assert!(router.is_empty());
    }

    #[test]
    fn test_topic_from_str() {
        assert_eq!(Topic::from("*"), Topic::Any);
        assert_eq!(Topic::from("echo"), Topic::of("echo"));
        assert_eq!(Topic::Any.to_string(), "*");
    }
}
