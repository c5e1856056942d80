//! # Connection Events
//!
//! Observer registry: each subscription names one event kind, fan-out runs in
//! subscription order, and a subscription can be removed by id. Callbacks are
//! invoked with the registry unlocked, so a callback may subscribe or
//! unsubscribe.

use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::error::TransportError;

#[derive(Debug)]
pub enum ConnectionEvent {
    Connect,
    Data(Bytes),
    Error(TransportError),
    End,
    Close,
}

impl ConnectionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ConnectionEvent::Connect => EventKind::Connect,
            ConnectionEvent::Data(_) => EventKind::Data,
            ConnectionEvent::Error(_) => EventKind::Error,
            ConnectionEvent::End => EventKind::End,
            ConnectionEvent::Close => EventKind::Close,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Data,
    Error,
    End,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<Mutex<dyn FnMut(&ConnectionEvent) + Send>>;

struct Subscriber {
    id: SubscriptionId,
    kind: EventKind,
    callback: Callback,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: Vec<Subscriber>,
}

/// Cloneable handle to a shared subscriber list.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Registry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> SubscriptionId
    where
        F: FnMut(&ConnectionEvent) + Send + 'static,
    {
        let mut registry = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = SubscriptionId(registry.next_id);
        registry.next_id += 1;
        registry.subscribers.push(Subscriber {
            id,
            kind,
            callback: Arc::new(Mutex::new(callback)),
        });
        id
    }

    /// Returns `false` if the id was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let before = registry.subscribers.len();
        registry.subscribers.retain(|s| s.id != id);
        registry.subscribers.len() != before
    }

    /// Deliver `event` to every subscriber of its kind, in subscription order.
    pub fn emit(&self, event: &ConnectionEvent) {
        let kind = event.kind();
        let targets: Vec<Callback> = {
            let registry = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            registry
                .subscribers
                .iter()
                .filter(|s| s.kind == kind)
                .map(|s| s.callback.clone())
                .collect()
        };
        for callback in targets {
            let mut f = callback.lock().unwrap_or_else(|e| e.into_inner());
            (*f)(event);
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        let registry = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        registry.subscribers.iter().filter(|s| s.kind == kind).count()
    }

    /// Drop every subscription.
    pub fn clear(&self) {
        let mut registry = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        registry.subscribers.clear();
    }
}
