//! In-process publish/subscribe of change events, keyed by resource name.

use dashmap::DashMap;
use kontract_protocol::ChangeEvent;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

type Handler = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    /// resource -> subscribers in registration order.
    subscribers: DashMap<String, Vec<(u64, Handler)>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn remove(&self, resource: &str, id: u64) -> bool {
        let removed = match self.subscribers.get_mut(resource) {
            Some(mut subs) => {
                let before = subs.len();
                subs.retain(|(sub_id, _)| *sub_id != id);
                subs.len() != before
            }
            None => false,
        };
        self.subscribers.remove_if(resource, |_, subs| subs.is_empty());
        removed
    }
}

/// Shared event bus. Clones refer to the same subscriber set.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `resource`.
    ///
    /// The returned [`Subscription`] removes the handler when
    /// [`Subscription::unsubscribe`] is called. Dropping it does not.
    pub fn subscribe<F>(&self, resource: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let resource = resource.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .entry(resource.clone())
            .or_default()
            .push((id, Arc::new(handler)));

        Subscription {
            bus: Arc::downgrade(&self.inner),
            resource,
            id,
        }
    }

    /// Invokes every handler currently registered for `resource`, in
    /// registration order, and returns how many were invoked.
    ///
    /// Handlers run against a snapshot taken at the start of the call, so a
    /// handler may subscribe or unsubscribe without deadlocking; such changes
    /// apply from the next emit on.
    pub fn emit(&self, resource: &str, event: &ChangeEvent) -> usize {
        let snapshot: Vec<Handler> = match self.inner.subscribers.get(resource) {
            Some(subs) => subs.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => return 0,
        };

        trace!("emit {} to {} handler(s)", resource, snapshot.len());
        for handler in &snapshot {
            handler(event);
        }
        snapshot.len()
    }

    /// Number of live subscribers for `resource`.
    pub fn listener_count(&self, resource: &str) -> usize {
        self.inner
            .subscribers
            .get(resource)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("resources", &self.inner.subscribers.len())
            .finish()
    }
}

/// Handle to one registered handler.
#[derive(Debug)]
pub struct Subscription {
    bus: Weak<BusInner>,
    resource: String,
    id: u64,
}

impl Subscription {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Removes the handler. Returns `false` if it was already removed or the
    /// bus is gone.
    pub fn unsubscribe(&self) -> bool {
        match self.bus.upgrade() {
            Some(bus) => bus.remove(&self.resource, self.id),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn event() -> ChangeEvent {
        ChangeEvent::insert("1", json!({"title": "milk"}))
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.emit("todos", &event()), 0);
        assert_eq!(bus.listener_count("todos"), 0);
    }

    #[test]
    fn test_subscribe_emit_unsubscribe() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let sub = bus.subscribe("todos", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(bus.listener_count("todos"), 1);

        assert_eq!(bus.emit("todos", &event()), 1);
        assert_eq!(bus.emit("users", &event()), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(sub.unsubscribe());
        assert!(!sub.unsubscribe());
        assert_eq!(bus.listener_count("todos"), 0);

        assert_eq!(bus.emit("todos", &event()), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            bus.subscribe("r", move |_| order.lock().push(i));
        }
        bus.emit("r", &event());
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_listener_count_tracks_exactly() {
        let bus = EventBus::new();
        let a = bus.subscribe("r", |_| {});
        let b = bus.subscribe("r", |_| {});
        let _c = bus.subscribe("other", |_| {});
        assert_eq!(bus.listener_count("r"), 2);

        a.unsubscribe();
        assert_eq!(bus.listener_count("r"), 1);
        b.unsubscribe();
        assert_eq!(bus.listener_count("r"), 0);
        assert_eq!(bus.listener_count("other"), 1);
    }

    #[test]
    fn test_unsubscribe_during_emit() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let h = hits.clone();
        let s = slot.clone();
        let sub = bus.subscribe("r", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            if let Some(sub) = s.lock().as_ref() {
                sub.unsubscribe();
            }
        });
        *slot.lock() = Some(sub);

        // Dispatched once, then gone for later emits
        assert_eq!(bus.emit("r", &event()), 1);
        assert_eq!(bus.emit("r", &event()), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clones_share_subscribers() {
        let bus = EventBus::new();
        let other = bus.clone();
        let received = Arc::new(Mutex::new(Vec::new()));

        let r = received.clone();
        other.subscribe("r", move |e| r.lock().push(e.id.clone()));
        bus.emit("r", &event());
        assert_eq!(*received.lock(), vec!["1".to_string()]);
    }

    #[test]
    fn test_unsubscribe_after_bus_dropped() {
        let bus = EventBus::new();
        let sub = bus.subscribe("r", |_| {});
        drop(bus);
        assert!(!sub.unsubscribe());
    }
}
