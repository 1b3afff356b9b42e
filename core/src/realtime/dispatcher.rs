/// Publish/subscribe routing of inbound frames by event type
use crate::error::Result;
use crate::realtime::protocol::Frame;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Subscriber callback. Returning an error only affects that subscriber.
pub type Callback = Arc<dyn Fn(&Frame) -> Result<()> + Send + Sync>;

/// Handle identifying one registration; required to unsubscribe it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Clone)]
struct Subscriber {
    id: SubscriptionId,
    callback: Callback,
}

/// Registry of subscribers keyed by event type
#[derive(Clone, Default)]
pub struct EventDispatcher {
    subscribers: Arc<Mutex<HashMap<String, Vec<Subscriber>>>>,
    next_id: Arc<AtomicU64>,
}

/// Counts from one dispatch pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback; subscribers for one type run in registration order
    pub fn subscribe<F>(&self, event_type: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&Frame) -> Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .lock()
            .entry(event_type.to_string())
            .or_default()
            .push(Subscriber {
                id,
                callback: Arc::new(callback),
            });
        debug!("Subscribed to {} ({:?})", event_type, id);
        id
    }

    /// Remove exactly one registration. Returns false if it was not registered.
    pub fn unsubscribe(&self, event_type: &str, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let Some(list) = subscribers.get_mut(event_type) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            subscribers.remove(event_type);
        }
        if removed {
            debug!("Unsubscribed from {} ({:?})", event_type, id);
        }
        removed
    }

    /// Invoke every subscriber registered for `frame.event_type`.
    ///
    /// The list is snapshotted first, so callbacks may subscribe or
    /// unsubscribe while the frame is being delivered; changes apply to the
    /// next frame. A failing or panicking callback is logged and skipped.
    pub fn dispatch(&self, frame: &Frame) -> DispatchReport {
        let snapshot: Vec<Subscriber> = {
            let subscribers = self.subscribers.lock();
            match subscribers.get(&frame.event_type) {
                Some(list) => list.clone(),
                None => Vec::new(),
            }
        };

        if snapshot.is_empty() {
            debug!("No subscribers for {}", frame);
            return DispatchReport::default();
        }

        let mut report = DispatchReport::default();
        for subscriber in snapshot {
            match catch_unwind(AssertUnwindSafe(|| (subscriber.callback)(frame))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!("Subscriber {:?} failed on {}: {}", subscriber.id, frame, e);
                }
                Err(_) => {
                    report.failed += 1;
                    error!("Subscriber {:?} panicked on {}", subscriber.id, frame);
                }
            }
        }
        report
    }

    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.subscribers
            .lock()
            .get(event_type)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Drop every registration
    pub fn clear(&self) {
        let mut subscribers = self.subscribers.lock();
        let total: usize = subscribers.values().map(Vec::len).sum();
        subscribers.clear();
        if total > 0 {
            debug!("Cleared {} subscribers", total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RealtimeError;
    use serde_json::json;

    fn frame(event_type: &str) -> Frame {
        Frame::new(event_type, Some("r1".to_string()), json!({}))
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let seen = seen.clone();
            dispatcher.subscribe("chat.deliver", move |_| {
                seen.lock().push(tag);
                Ok(())
            });
        }

        let report = dispatcher.dispatch(&frame("chat.deliver"));
        assert_eq!(report.delivered, 3);
        assert_eq!(*seen.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_dispatch_only_matching_type() {
        let dispatcher = EventDispatcher::new();
        let hits = Arc::new(AtomicU64::new(0));
        let h = hits.clone();
        dispatcher.subscribe("agent.response", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        dispatcher.dispatch(&frame("chat.deliver"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failing_subscriber_does_not_block_others() {
        let dispatcher = EventDispatcher::new();
        let hits = Arc::new(AtomicU64::new(0));

        dispatcher.subscribe("error", |_| Err(RealtimeError::InvalidInput("bad handler".into())));
        dispatcher.subscribe("error", |_| panic!("handler exploded"));
        let h = hits.clone();
        dispatcher.subscribe("error", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let report = dispatcher.dispatch(&frame("error"));
        assert_eq!(report, DispatchReport { delivered: 1, failed: 2 });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_removes_only_that_callback() {
        let dispatcher = EventDispatcher::new();
        let first = dispatcher.subscribe("chat.seen", |_| Ok(()));
        let second = dispatcher.subscribe("chat.seen", |_| Ok(()));

        assert!(dispatcher.unsubscribe("chat.seen", first));
        assert!(!dispatcher.unsubscribe("chat.seen", first));
        assert_eq!(dispatcher.subscriber_count("chat.seen"), 1);
        assert!(dispatcher.unsubscribe("chat.seen", second));
        assert_eq!(dispatcher.subscriber_count("chat.seen"), 0);
    }

    #[test]
    fn test_mutation_during_dispatch_uses_snapshot() {
        let dispatcher = EventDispatcher::new();
        let late_hits = Arc::new(AtomicU64::new(0));

        let d = dispatcher.clone();
        let late = late_hits.clone();
        dispatcher.subscribe("chat.deliver", move |_| {
            let late = late.clone();
            d.subscribe("chat.deliver", move |_| {
                late.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            Ok(())
        });

        // Newly added subscriber is not invoked for the frame in flight
        let report = dispatcher.dispatch(&frame("chat.deliver"));
        assert_eq!(report.delivered, 1);
        assert_eq!(late_hits.load(Ordering::SeqCst), 0);

        dispatcher.dispatch(&frame("chat.deliver"));
        assert_eq!(late_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_self_unsubscribe_during_dispatch() {
        let dispatcher = EventDispatcher::new();
        let id_slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));

        let d = dispatcher.clone();
        let slot = id_slot.clone();
        let id = dispatcher.subscribe("agent.response", move |_| {
            if let Some(id) = *slot.lock() {
                d.unsubscribe("agent.response", id);
            }
            Ok(())
        });
        *id_slot.lock() = Some(id);

        assert_eq!(dispatcher.dispatch(&frame("agent.response")).delivered, 1);
        assert_eq!(dispatcher.subscriber_count("agent.response"), 0);
    }

    #[test]
    fn test_clear() {
        let dispatcher = EventDispatcher::new();
        dispatcher.subscribe("a", |_| Ok(()));
        dispatcher.subscribe("b", |_| Ok(()));
        dispatcher.clear();
        assert_eq!(dispatcher.subscriber_count("a"), 0);
        assert_eq!(dispatcher.dispatch(&frame("b")), DispatchReport::default());
    }
}
