//! Synchronous publish/subscribe bus keyed by event name.
//!
//! Every inbound protocol message ends up here: the isolation layer
//! republishes `{type, data}` as event `type` with payload `data`, and the
//! session layer subscribes to the events it cares about. Dispatch runs on
//! the publishing thread and iterates a snapshot of the listener list, so a
//! handler that subscribes or unsubscribes during dispatch only affects
//! later publications.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Handler signature: event payload followed by the event name.
pub type Handler = dyn Fn(&Value, &str) + Send + Sync;

/// Identifies one registered handler across all the event names it was
/// subscribed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Clone)]
struct Listener {
    id: SubscriptionId,
    handler: Arc<Handler>,
}

#[derive(Default)]
struct BusInner {
    listeners: Mutex<HashMap<String, Vec<Listener>>>,
    next_id: AtomicU64,
}

/// Cheap to clone; clones share the same listener table.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under every name in `types`.
    pub fn subscribe<F>(&self, types: &[&str], handler: F) -> SubscriptionId
    where
        F: Fn(&Value, &str) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.register(types, id, Arc::new(handler));
        id
    }

    /// Register `handler` for the first publication on any of `types`.
    ///
    /// The handler removes itself from all of `types` before it runs.
    pub fn subscribe_once<F>(&self, types: &[&str], handler: F) -> SubscriptionId
    where
        F: FnOnce(&Value, &str) + Send + 'static,
    {
        let id = self.next_id();
        let owned_types: Vec<String> = types.iter().map(|t| t.to_string()).collect();
        let slot = Mutex::new(Some(handler));
        let bus = self.clone();

        self.register(
            types,
            id,
            Arc::new(move |data: &Value, event: &str| {
                let taken = lock(&slot).take();
                if let Some(handler) = taken {
                    let names: Vec<&str> = owned_types.iter().map(String::as_str).collect();
                    bus.unsubscribe(&names, Some(id));
                    handler(data, event);
                }
            }),
        );
        id
    }

    /// Remove `id` from `types`, or every handler of `types` when `id` is
    /// `None`.
    pub fn unsubscribe(&self, types: &[&str], id: Option<SubscriptionId>) {
        let mut listeners = lock(&self.inner.listeners);
        for event in types {
            let now_empty = match (listeners.get_mut(*event), id) {
                (Some(list), Some(id)) => {
                    list.retain(|listener| listener.id != id);
                    list.is_empty()
                }
                (Some(_), None) => true,
                (None, _) => false,
            };
            if now_empty {
                listeners.remove(*event);
            }
        }
    }

    /// Invoke every handler currently subscribed to `event`, in
    /// registration order. Publishing to an event nobody listens to is a
    /// no-op.
    pub fn publish(&self, event: &str, data: &Value) {
        let snapshot: Vec<Listener> = match lock(&self.inner.listeners).get(event) {
            Some(list) => list.clone(),
            None => return,
        };
        for listener in snapshot {
            (listener.handler)(data, event);
        }
    }

    pub fn listener_count(&self, event: &str) -> usize {
        lock(&self.inner.listeners)
            .get(event)
            .map_or(0, Vec::len)
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn register(&self, types: &[&str], id: SubscriptionId, handler: Arc<Handler>) {
        let mut listeners = lock(&self.inner.listeners);
        for event in types {
            listeners
                .entry(event.to_string())
                .or_default()
                .push(Listener {
                    id,
                    handler: Arc::clone(&handler),
                });
        }
    }
}

// Handlers never run while the table is locked, so a poisoned lock only
// means a panic inside the bus itself; the table is still consistent.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Box<dyn Fn(&Value, &str) + Send + Sync>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = log.clone();
        let make = move |tag: &str| -> Box<dyn Fn(&Value, &str) + Send + Sync> {
            let log = log_clone.clone();
            let tag = tag.to_string();
            Box::new(move |data: &Value, event: &str| {
                log.lock().unwrap().push(format!("{}:{}:{}", tag, event, data));
            })
        };
        (log, make)
    }

    #[test]
    fn test_publish_in_registration_order() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        bus.subscribe(&["result"], make("a"));
        bus.subscribe(&["result"], make("b"));
        bus.subscribe(&["error"], make("c"));

        bus.publish("result", &json!(1));

        assert_eq!(*log.lock().unwrap(), vec!["a:result:1", "b:result:1"]);
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.publish("nobody", &json!(null));
        assert_eq!(bus.listener_count("nobody"), 0);
    }

    #[test]
    fn test_unsubscribe_specific_and_all() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let a = bus.subscribe(&["output"], make("a"));
        bus.subscribe(&["output"], make("b"));

        bus.unsubscribe(&["output"], Some(a));
        bus.publish("output", &json!("x"));
        assert_eq!(*log.lock().unwrap(), vec!["b:output:\"x\""]);

        bus.unsubscribe(&["output"], None);
        assert_eq!(bus.listener_count("output"), 0);
        bus.publish("output", &json!("y"));
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_subscription_across_multiple_types() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let id = bus.subscribe(&["result", "error"], make("h"));

        bus.publish("result", &json!(1));
        bus.publish("error", &json!(2));
        bus.unsubscribe(&["result"], Some(id));
        bus.publish("result", &json!(3));
        bus.publish("error", &json!(4));

        assert_eq!(
            *log.lock().unwrap(),
            vec!["h:result:1", "h:error:2", "h:error:4"]
        );
    }

    #[test]
    fn test_subscribe_once_fires_once_across_types() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let hits_clone = hits.clone();
        bus.subscribe_once(&["result", "error"], move |_, event| {
            hits_clone.lock().unwrap().push(event.to_string());
        });

        bus.publish("error", &json!("boom"));
        bus.publish("result", &json!(1));
        bus.publish("error", &json!("again"));

        assert_eq!(*hits.lock().unwrap(), vec!["error"]);
        assert_eq!(bus.listener_count("result"), 0);
        assert_eq!(bus.listener_count("error"), 0);
    }

    #[test]
    fn test_once_handler_does_not_disturb_siblings() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        bus.subscribe(&["ready"], make("first"));
        let once = make("once");
        bus.subscribe_once(&["ready"], move |data, event| once(data, event));
        bus.subscribe(&["ready"], make("last"));

        bus.publish("ready", &json!(null));
        bus.publish("ready", &json!(null));

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "first:ready:null",
                "once:ready:null",
                "last:ready:null",
                "first:ready:null",
                "last:ready:null",
            ]
        );
    }

    #[test]
    fn test_subscribe_during_dispatch_waits_for_next_publish() {
        let bus = EventBus::new();
        let count = Arc::new(Mutex::new(0));
        let bus_clone = bus.clone();
        let count_clone = count.clone();
        bus.subscribe_once(&["tick"], move |_, _| {
            let count = count_clone.clone();
            bus_clone.subscribe(&["tick"], move |_, _| {
                *count.lock().unwrap() += 1;
            });
        });

        bus.publish("tick", &json!(null));
        assert_eq!(*count.lock().unwrap(), 0);
        bus.publish("tick", &json!(null));
        assert_eq!(*count.lock().unwrap(), 1);
    }
}
