//! Plugin registry for externally owned command IDs.
//!
//! Unrelated subsystems can claim one of the channel's registry slots and
//! receive the payload of every command dispatched to it, without the
//! command processor knowing about them. Slots hold an explicit ordered
//! subscriber list; dispatch order is registration order, by contract.
//!
//! Constraint: a handler must not unregister itself from inside `dispatch`;
//! the removal is only guaranteed to be observed by later dispatches.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Error, Result};

/// Number of slots in the registry table. Command dispatch wires slots 0
/// and 1; the remainder are available to future subscribers.
pub const SLOT_COUNT: usize = 10;

type PluginHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Token returned by [`PluginRegistry::register`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationToken {
    slot: usize,
    id: u64,
}

/// Slot-indexed table of ordered plugin subscriber lists.
pub struct PluginRegistry {
    slots: Vec<RwLock<Vec<(u64, PluginHandler)>>>,
    next_id: AtomicU64,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    /// An empty registry with [`SLOT_COUNT`] slots.
    pub fn new() -> Self {
        Self {
            slots: (0..SLOT_COUNT).map(|_| RwLock::new(Vec::new())).collect(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Attach a handler to `slot`. Handlers run in registration order.
    pub fn register<F>(&self, slot: usize, handler: F) -> Result<RegistrationToken>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        let list = self.slots.get(slot).ok_or(Error::SlotOutOfRange {
            slot,
            capacity: SLOT_COUNT,
        })?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        list.write().push((id, Arc::new(handler)));
        debug!(slot, "plugin handler registered");
        Ok(RegistrationToken { slot, id })
    }

    /// Detach a previously registered handler. Unknown tokens are ignored.
    pub fn unregister(&self, token: RegistrationToken) {
        if let Some(list) = self.slots.get(token.slot) {
            list.write().retain(|(id, _)| *id != token.id);
        }
    }

    /// Invoke every handler registered for `slot` with `payload`, in
    /// registration order. Returns the number of handlers invoked; an
    /// uninitialized (empty) slot is a logged no-op.
    pub fn dispatch(&self, slot: usize, payload: &[u8]) -> usize {
        let Some(list) = self.slots.get(slot) else {
            debug!(slot, "dispatch to slot outside table, ignoring");
            return 0;
        };
        // Snapshot under the read lock; dispatch must never observe a torn
        // list while another thread registers or unregisters.
        let handlers: Vec<PluginHandler> =
            list.read().iter().map(|(_, h)| Arc::clone(h)).collect();

        if handlers.is_empty() {
            debug!(slot, "dispatch to uninitialized slot, ignoring");
            return 0;
        }
        for handler in &handlers {
            handler(payload);
        }
        handlers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_register_then_dispatch_invokes_once() {
        let registry = PluginRegistry::new();
        let payloads = Arc::new(Mutex::new(Vec::new()));
        let payloads_clone = Arc::clone(&payloads);
        registry
            .register(0, move |payload| {
                payloads_clone.lock().push(payload.to_vec());
            })
            .expect("slot 0 exists");

        assert_eq!(registry.dispatch(0, b"exact bytes"), 1);
        assert_eq!(*payloads.lock(), vec![b"exact bytes".to_vec()]);
    }

    #[test]
    fn test_unregister_stops_dispatch() {
        let registry = PluginRegistry::new();
        let hits = Arc::new(Mutex::new(0usize));
        let hits_clone = Arc::clone(&hits);
        let token = registry
            .register(1, move |_| {
                *hits_clone.lock() += 1;
            })
            .expect("slot 1 exists");

        registry.dispatch(1, b"x");
        registry.unregister(token);
        registry.dispatch(1, b"x");
        assert_eq!(*hits.lock(), 1);
    }

    #[test]
    fn test_dispatch_order_is_registration_order() {
        let registry = PluginRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let order_clone = Arc::clone(&order);
            registry
                .register(0, move |_| order_clone.lock().push(tag))
                .expect("slot 0 exists");
        }

        registry.dispatch(0, b"");
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_empty_slot_dispatch_is_noop() {
        let registry = PluginRegistry::new();
        assert_eq!(registry.dispatch(5, b"ignored"), 0);
    }

    #[test]
    fn test_out_of_range_slot() {
        let registry = PluginRegistry::new();
        let err = registry.register(SLOT_COUNT, |_| {}).unwrap_err();
        assert!(matches!(err, Error::SlotOutOfRange { slot, .. } if slot == SLOT_COUNT));
        // Dispatch outside the table is a no-op rather than an error.
        assert_eq!(registry.dispatch(SLOT_COUNT, b""), 0);
    }

    #[test]
    fn test_slots_are_independent() {
        let registry = PluginRegistry::new();
        let hits = Arc::new(Mutex::new(0usize));
        let hits_clone = Arc::clone(&hits);
        registry
            .register(0, move |_| *hits_clone.lock() += 1)
            .expect("slot 0 exists");

        registry.dispatch(1, b"");
        assert_eq!(*hits.lock(), 0);
    }
}
