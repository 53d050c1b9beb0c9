// Copyright (c) 2024-present, octree-store contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::Slice;
use std::sync::{Condvar, Mutex};

enum ReadState {
    Pending,
    Done(crate::Result<Slice>),
    Taken,
}

/// Handle to an in-flight read.
///
/// The storage loop holds one strong reference until completion; the issuer
/// may hold another to block on the result (bootstrap paths do).
pub struct ReadHandle {
    state: Mutex<ReadState>,
    done: Condvar,
}

impl Default for ReadHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadHandle {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ReadState::Pending),
            done: Condvar::new(),
        }
    }

    /// Stores the result and wakes waiters. Called by the storage loop.
    #[allow(clippy::expect_used)]
    pub(crate) fn complete(&self, result: crate::Result<Slice>) {
        let mut state = self.state.lock().expect("lock is poisoned");
        debug_assert!(matches!(*state, ReadState::Pending));
        *state = ReadState::Done(result);
        drop(state);

        self.done.notify_all();
    }

    /// Blocks until the read completes and takes the result.
    ///
    /// Calling this twice returns [`crate::Error::Unrecoverable`], as the
    /// first call consumed the buffer.
    #[allow(clippy::expect_used)]
    pub fn wait_for_read(&self) -> crate::Result<Slice> {
        let mut state = self.state.lock().expect("lock is poisoned");

        loop {
            match std::mem::replace(&mut *state, ReadState::Taken) {
                ReadState::Pending => {
                    *state = ReadState::Pending;
                    state = self.done.wait(state).expect("lock is poisoned");
                }
                ReadState::Done(result) => return result,
                ReadState::Taken => return Err(crate::Error::Unrecoverable),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use test_log::test;

    #[test]
    fn wait_returns_completed_result() {
        let handle = Arc::new(ReadHandle::new());

        let remote = handle.clone();
        let thread = std::thread::spawn(move || {
            remote.complete(Ok(Slice::from(b"hello".as_slice())));
        });

        let result = handle.wait_for_read().expect("read succeeded");
        assert_eq!(&*result, b"hello");

        thread.join().expect("thread finished");

        // the buffer was consumed
        assert!(handle.wait_for_read().is_err());
    }
}
