// Copyright (c) 2024-present, octree-store contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::LoopSignal;
use std::sync::{Arc, Mutex};

struct PipeInner<T> {
    events: Mutex<Vec<T>>,
    signal: LoopSignal,
}

/// Typed MPSC pipe feeding one subsystem loop.
///
/// Guarantees: per producer, delivery order equals post order; every event is
/// drained exactly once; posts between two drains share one wakeup.
pub struct EventPipe<T> {
    inner: Arc<PipeInner<T>>,
}

impl<T> Clone for EventPipe<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> EventPipe<T> {
    /// Creates a pipe waking the given loop.
    #[must_use]
    pub fn new(signal: LoopSignal) -> Self {
        Self {
            inner: Arc::new(PipeInner {
                events: Mutex::new(Vec::new()),
                signal,
            }),
        }
    }

    /// Posts an event from any thread.
    #[allow(clippy::expect_used)]
    pub fn post(&self, event: T) {
        let mut events = self.inner.events.lock().expect("lock is poisoned");
        events.push(event);
        drop(events);

        self.inner.signal.notify();
    }

    /// Swaps out all pending events. Called by the owning loop only.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn drain(&self) -> Vec<T> {
        let mut events = self.inner.events.lock().expect("lock is poisoned");
        std::mem::take(&mut *events)
    }

    /// `true` if no event is pending.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.events.lock().expect("lock is poisoned").is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn drain_preserves_post_order() {
        let signal = LoopSignal::new();
        let pipe = EventPipe::new(signal.clone());

        pipe.post(1);
        pipe.post(2);
        pipe.post(3);

        signal.wait();
        assert_eq!(pipe.drain(), vec![1, 2, 3]);
        assert!(pipe.is_empty());
        assert!(pipe.drain().is_empty());
    }

    #[test]
    fn posts_from_many_threads_are_all_delivered() {
        let signal = LoopSignal::new();
        let pipe = EventPipe::new(signal);

        let handles = (0..8)
            .map(|t| {
                let pipe = pipe.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        pipe.post((t, i));
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().expect("thread finished");
        }

        let events = pipe.drain();
        assert_eq!(events.len(), 800);

        // per-producer order is maintained
        for t in 0..8 {
            let seen = events
                .iter()
                .filter(|(producer, _)| *producer == t)
                .map(|(_, i)| *i)
                .collect::<Vec<_>>();
            assert_eq!(seen, (0..100).collect::<Vec<_>>());
        }
    }
}
