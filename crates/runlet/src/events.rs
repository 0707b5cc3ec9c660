//! Manager-side event-subscriber table.
//!
//! Maps event names to ordered subscriber lists. The facade mutates the
//! table; the reader task delivers into it. All subscribers of one event
//! share the payload type, so each delivery decodes the payload into the
//! subscriber's declared type and invokes handlers in subscription order.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rmpv::Value;
use serde::de::DeserializeOwned;

use crate::bridge::payload;

struct Subscriber {
    id: u64,
    deliver: Box<dyn Fn(&Value) + Send + Sync>,
}

/// Handle returned by subscribe; identity for later removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSubscription {
    event: String,
    id: u64,
}

impl EventSubscription {
    pub fn event(&self) -> &str {
        &self.event
    }
}

#[derive(Default)]
pub(crate) struct EventHub {
    next_id: AtomicU64,
    table: Mutex<HashMap<String, Vec<Arc<Subscriber>>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Vec<Arc<Subscriber>>>> {
        // Handlers run outside the lock, so poisoning can only come from a
        // panic inside this module; recover rather than cascade.
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a typed subscriber to the event's list.
    ///
    /// A payload that fails to decode into `T` is logged and dropped
    /// without invoking the handler.
    pub fn subscribe<T, F>(&self, event: &str, handler: F) -> EventSubscription
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = event.to_string();
        let deliver: Box<dyn Fn(&Value) + Send + Sync> = {
            let name = name.clone();
            Box::new(move |value: &Value| match payload::from_value::<T>(value.clone()) {
                Ok(decoded) => handler(decoded),
                Err(e) => {
                    tracing::warn!(event = %name, error = %e, "Dropping event payload that failed to decode");
                }
            })
        };

        self.table()
            .entry(name)
            .or_default()
            .push(Arc::new(Subscriber { id, deliver }));

        EventSubscription {
            event: event.to_string(),
            id,
        }
    }

    /// Remove the first subscriber equal to the handle. The event's entry
    /// is dropped once its list empties.
    pub fn unsubscribe(&self, subscription: &EventSubscription) -> bool {
        let mut table = self.table();
        let Some(list) = table.get_mut(&subscription.event) else {
            return false;
        };
        let Some(position) = list.iter().position(|s| s.id == subscription.id) else {
            return false;
        };
        list.remove(position);
        if list.is_empty() {
            table.remove(&subscription.event);
        }
        true
    }

    /// Deliver a payload to every subscriber in subscription order.
    ///
    /// Events without subscribers are dropped. A panicking subscriber is
    /// logged and does not stop delivery or the reader loop.
    pub fn dispatch(&self, event: &str, payload_value: &Value) {
        let subscribers: Vec<Arc<Subscriber>> = match self.table().get(event) {
            Some(list) => list.clone(),
            None => return,
        };

        for subscriber in subscribers {
            let delivery = AssertUnwindSafe(|| (subscriber.deliver)(payload_value));
            if catch_unwind(delivery).is_err() {
                tracing::error!(event = %event, "Event subscriber panicked");
            }
        }
    }

    pub fn subscriber_count(&self, event: &str) -> usize {
        self.table().get(event).map_or(0, Vec::len)
    }
}
