// Copyright (c) 2024-present, octree-store contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Cooperative event substrate.
//!
//! Every subsystem (storage, tree handler, converter master) runs one
//! single-threaded loop that owns that subsystem's mutable state. Producers
//! on other threads post typed events into [`EventPipe`]s; all pipes of one
//! loop share a [`LoopSignal`], so any number of posts between two drains
//! costs a single wakeup.

mod pipe;

pub use pipe::EventPipe;

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

struct SignalInner {
    dirty: Mutex<bool>,
    condvar: Condvar,
}

/// Coalescing wakeup primitive shared by all pipes of one loop.
#[derive(Clone)]
pub struct LoopSignal(Arc<SignalInner>);

impl Default for LoopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopSignal {
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(SignalInner {
            dirty: Mutex::new(false),
            condvar: Condvar::new(),
        }))
    }

    /// Marks the loop dirty and wakes it. Multiple notifications between two
    /// waits collapse into one wakeup.
    #[allow(clippy::expect_used)]
    pub fn notify(&self) {
        let mut dirty = self.0.dirty.lock().expect("lock is poisoned");
        *dirty = true;
        drop(dirty);

        self.0.condvar.notify_one();
    }

    /// Blocks until notified, then clears the dirty flag.
    #[allow(clippy::expect_used)]
    pub fn wait(&self) {
        let mut dirty = self.0.dirty.lock().expect("lock is poisoned");
        while !*dirty {
            dirty = self.0.condvar.wait(dirty).expect("lock is poisoned");
        }
        *dirty = false;
    }

    /// Like [`Self::wait`], but gives up after `timeout`. Returns `true` if
    /// a notification arrived.
    #[allow(clippy::expect_used)]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut dirty = self.0.dirty.lock().expect("lock is poisoned");
        let deadline = std::time::Instant::now() + timeout;

        while !*dirty {
            let Some(remaining) = deadline.checked_duration_since(std::time::Instant::now())
            else {
                return false;
            };

            let (guard, result) = self
                .0
                .condvar
                .wait_timeout(dirty, remaining)
                .expect("lock is poisoned");
            dirty = guard;

            if result.timed_out() && !*dirty {
                return false;
            }
        }

        *dirty = false;
        true
    }
}

/// Spawns a named subsystem loop thread.
#[allow(clippy::expect_used)]
pub fn spawn_loop<F: FnOnce() + Send + 'static>(name: &str, f: F) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name(name.into())
        .spawn(f)
        .expect("should spawn loop thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn notify_before_wait_does_not_block() {
        let signal = LoopSignal::new();
        signal.notify();
        signal.notify();
        signal.wait();
        // second wait would block again
        assert!(!signal.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn cross_thread_wakeup() {
        let signal = LoopSignal::new();

        let remote = signal.clone();
        let handle = std::thread::spawn(move || {
            remote.notify();
        });

        signal.wait();
        handle.join().expect("thread finished");
    }
}
