// Copyright (c) 2024-present, octree-store contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex},
};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    queue: VecDeque<Job>,
    stopped: bool,
}

struct PoolInner {
    state: Mutex<PoolState>,
    job_available: Condvar,
}

/// Fixed-size worker pool executing blocking and compute jobs.
///
/// Pre-init, read, sort and LOD work runs here; each job posts its result
/// into an [`crate::event::EventPipe`] owned by some subsystem loop.
///
/// On shutdown, queued jobs are still executed before the workers exit.
pub struct ThreadPool {
    inner: Arc<PoolInner>,
    workers: Vec<std::thread::JoinHandle<()>>,
}

/// The worker count used when none is configured:
/// 1.5x the machine's available parallelism.
#[must_use]
pub fn default_worker_count() -> usize {
    let cores = std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get);
    (cores * 3 / 2).max(1)
}

impl ThreadPool {
    /// Spawns a pool with the given number of worker threads.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new(worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);

        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                stopped: false,
            }),
            job_available: Condvar::new(),
        });

        let workers = (0..worker_count)
            .map(|idx| {
                let inner = inner.clone();

                std::thread::Builder::new()
                    .name(format!("octree-worker-{idx}"))
                    .spawn(move || worker_run(&inner))
                    .expect("should spawn worker thread")
            })
            .collect();

        log::debug!("spawned worker pool with {worker_count} threads");

        Self { inner, workers }
    }

    /// Enqueues a job for execution on some worker thread.
    #[allow(clippy::expect_used)]
    pub fn execute<F: FnOnce() + Send + 'static>(&self, job: F) {
        let mut state = self.inner.state.lock().expect("lock is poisoned");
        debug_assert!(!state.stopped, "pool already shut down");
        state.queue.push_back(Box::new(job));
        drop(state);

        self.inner.job_available.notify_one();
    }

    /// Number of jobs not yet picked up by a worker.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn queued_jobs(&self) -> usize {
        self.inner.state.lock().expect("lock is poisoned").queue.len()
    }
}

#[allow(clippy::expect_used)]
fn worker_run(inner: &PoolInner) {
    loop {
        let job = {
            let mut state = inner.state.lock().expect("lock is poisoned");

            loop {
                if let Some(job) = state.queue.pop_front() {
                    break job;
                }
                if state.stopped {
                    return;
                }
                state = inner.job_available.wait(state).expect("lock is poisoned");
            }
        };

        job();
    }
}

impl Drop for ThreadPool {
    #[allow(clippy::expect_used)]
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock().expect("lock is poisoned");
            state.stopped = true;
        }
        self.inner.job_available.notify_all();

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("worker thread panicked");
            }
        }
    }
}
