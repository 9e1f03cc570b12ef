//! Host-bound completion ring.
//!
//! Results of asynchronous executions wait here until the host polls for
//! them (command ID 3). The ring is bounded: once it holds
//! [`COMPLETION_CAPACITY`] unread entries, the next push abandons the oldest
//! entry and reports [`RingFull`] so the producer can log the loss. Overflow
//! is detected, not prevented.

use hostlink_protocol::Payload;
use parking_lot::Mutex;
use thiserror::Error;

/// Number of entries the completion ring holds.
pub const COMPLETION_CAPACITY: usize = 512;

/// Signal that a push abandoned the oldest unread entry.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("completion ring full: oldest unread entry abandoned")]
pub struct RingFull;

struct RingInner {
    slots: Vec<Option<Payload>>,
    start: usize,
    len: usize,
}

/// Bounded single-producer/single-consumer ring of completion results.
///
/// One mutex guards the whole ring; producer and consumer exclude each
/// other at the granularity of one push or one take.
pub struct CompletionRing {
    inner: Mutex<RingInner>,
}

impl Default for CompletionRing {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionRing {
    /// An empty ring.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RingInner {
                slots: (0..COMPLETION_CAPACITY).map(|_| None).collect(),
                start: 0,
                len: 0,
            }),
        }
    }

    /// Append an entry. When the ring is already at capacity the oldest
    /// unread entry is dropped to make room and `RingFull` is returned.
    pub fn push(&self, text: Payload) -> Result<(), RingFull> {
        let mut inner = self.inner.lock();
        let overflowed = inner.len == COMPLETION_CAPACITY;
        if overflowed {
            let start = inner.start;
            inner.slots[start] = None;
            inner.start = (start + 1) % COMPLETION_CAPACITY;
            inner.len -= 1;
        }
        let end = (inner.start + inner.len) % COMPLETION_CAPACITY;
        inner.slots[end] = Some(text);
        inner.len += 1;
        if overflowed {
            Err(RingFull)
        } else {
            Ok(())
        }
    }

    /// Take the oldest unread entry, if any.
    pub fn take_oldest(&self) -> Option<Payload> {
        let mut inner = self.inner.lock();
        if inner.len == 0 {
            return None;
        }
        let start = inner.start;
        let entry = inner.slots[start].take();
        inner.start = (start + 1) % COMPLETION_CAPACITY;
        inner.len -= 1;
        entry
    }

    /// Number of unread entries at this instant. The drain loop snapshots
    /// this once at entry; entries pushed mid-drain wait for the next poll.
    pub fn pending(&self) -> usize {
        self.inner.lock().len
    }
}
