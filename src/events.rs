//! Typed notification surface.
//!
//! The channel and its collaborators communicate through a small publish
//! interface: `RunLineCommand` carries a line command toward whatever
//! executes it, `RunSuccess` carries a finished command's result back toward
//! the completion ring, and `RunInfo` carries informational strings into the
//! exec-info cache. Subscribers are held in an explicit ordered list per
//! event kind and are invoked synchronously, in subscription order.
//!
//! Constraint: a handler must not unsubscribe itself from inside `publish`;
//! the removal is only guaranteed to be observed by later publishes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

/// Event kinds understood by the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A line command to execute (payload: the command string).
    RunLineCommand,
    /// A finished execution reporting success (payload: the result string).
    RunSuccess,
    /// An informational execution update (payload: the info string).
    RunInfo,
}

const KIND_COUNT: usize = 3;

fn kind_index(kind: EventKind) -> usize {
    match kind {
        EventKind::RunLineCommand => 0,
        EventKind::RunSuccess => 1,
        EventKind::RunInfo => 2,
    }
}

type Handler = Arc<dyn Fn(&str) + Send + Sync>;

/// Token returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    kind: EventKind,
    id: u64,
}

/// Ordered-list publish/subscribe hub.
pub struct EventBus {
    lists: [RwLock<Vec<(u64, Handler)>>; KIND_COUNT],
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// An event bus with no subscribers.
    pub fn new() -> Self {
        Self {
            lists: [RwLock::new(Vec::new()), RwLock::new(Vec::new()), RwLock::new(Vec::new())],
            next_id: AtomicU64::new(1),
        }
    }

    /// Add a handler for `kind`. Handlers run in subscription order.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lists[kind_index(kind)]
            .write()
            .push((id, Arc::new(handler)));
        Subscription { kind, id }
    }

    /// Remove a previously subscribed handler. Unknown tokens are ignored.
    pub fn unsubscribe(&self, subscription: Subscription) {
        self.lists[kind_index(subscription.kind)]
            .write()
            .retain(|(id, _)| *id != subscription.id);
    }

    /// Deliver `payload` to every handler of `kind`, in order. Returns the
    /// number of handlers invoked; zero subscribers is a logged no-op.
    pub fn publish(&self, kind: EventKind, payload: &str) -> usize {
        // Snapshot the list so handlers never observe a torn list and
        // subscribers on other threads are not blocked for the duration of
        // the callbacks.
        let handlers: Vec<Handler> = self.lists[kind_index(kind)]
            .read()
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();

        if handlers.is_empty() {
            debug!(kind = ?kind, "publish with no subscribers");
            return 0;
        }
        for handler in &handlers {
            handler(payload);
        }
        handlers.len()
    }
}
