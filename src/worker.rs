//! Deferred task primitive for the command processor.
//!
//! A [`Task`] owns one worker thread and runs its closure once per
//! `schedule()` call, with work-queue semantics: scheduling while a run is
//! already pending is deduplicated to a single pending run, and scheduling
//! while the closure is executing queues exactly one follow-up run. This is
//! the at-most-one-pending-instance discipline the channel relies on for its
//! receive and dispatch tasks.

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

struct TaskState {
    pending: bool,
    shutdown: bool,
}

struct TaskShared {
    state: Mutex<TaskState>,
    wakeup: Condvar,
}

/// A named deferred task backed by one worker thread.
pub struct Task {
    name: &'static str,
    shared: Arc<TaskShared>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Task {
    /// Spawn the worker thread. The closure runs once per scheduled request.
    pub fn spawn<F>(name: &'static str, mut work: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let shared = Arc::new(TaskShared {
            state: Mutex::new(TaskState {
                pending: false,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(format!("hostlink-{name}"))
            .spawn(move || {
                let mut state = thread_shared.state.lock();
                loop {
                    if state.shutdown {
                        break;
                    }
                    if state.pending {
                        state.pending = false;
                        drop(state);
                        work();
                        state = thread_shared.state.lock();
                    } else {
                        thread_shared.wakeup.wait(&mut state);
                    }
                }
            })
            .unwrap_or_else(|e| panic!("failed to spawn worker thread {name}: {e}"));

        Self {
            name,
            shared,
            join: Mutex::new(Some(handle)),
        }
    }

    /// Request one run. Requests made while a run is already pending are
    /// deduplicated; requests made mid-run queue exactly one follow-up.
    pub fn schedule(&self) {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            debug!(task = self.name, "schedule after shutdown ignored");
            return;
        }
        state.pending = true;
        self.shared.wakeup.notify_one();
    }

    /// Stop the worker and wait for it to exit. Safe to call with no run
    /// pending and safe to call more than once.
    pub fn cancel_and_join(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.pending = false;
            self.shared.wakeup.notify_one();
        }
        if let Some(handle) = self.join.lock().take() {
            if handle.join().is_err() {
                debug!(task = self.name, "worker thread panicked");
            }
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.cancel_and_join();
    }
}
