//! Per-controller event subscriptions.
//!
//! A document view only routes an inbound event to a controller that is
//! subscribed to its name. Subscribing and unsubscribing are idempotent, so
//! lifecycles can call them without tracking what is already registered.

use std::collections::BTreeSet;

use crate::protocol::EventName;

#[derive(Debug, Default, Clone)]
pub struct Subscriptions {
    names: BTreeSet<EventName>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if already subscribed.
    pub fn subscribe(&mut self, name: EventName) -> bool {
        self.names.insert(name)
    }

    /// Returns `false` if not subscribed.
    pub fn unsubscribe(&mut self, name: EventName) -> bool {
        self.names.remove(&name)
    }

    pub fn is_subscribed(&self, name: EventName) -> bool {
        self.names.contains(&name)
    }

    pub fn clear(&mut self) {
        self.names.clear();
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
