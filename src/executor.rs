//! Thread-per-task worker pool.
//!
//! Every submitted task runs on its own freshly spawned OS thread; threads are
//! never reused. The pool only bounds how many tasks may be live at once and
//! lets the owner stop admission and wait for the live set to drain.

use slab::Slab;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Instant;
use tracing::{debug, warn};

/// Bookkeeping for one live task.
struct Worker {
    name: String,
    started: Instant,
}

struct PoolState {
    accepting: bool,
    workers: Slab<Worker>,
}

struct Inner {
    state: Mutex<PoolState>,
    drained: Condvar,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes a task from the live set when its thread finishes, even by panic.
struct WorkerGuard {
    inner: Arc<Inner>,
    key: usize,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        let mut state = self.inner.lock();
        let worker = state.workers.remove(self.key);
        debug!(
            worker = %worker.name,
            elapsed_ms = worker.started.elapsed().as_millis() as u64,
            "Worker finished"
        );
        if state.workers.is_empty() {
            self.inner.drained.notify_all();
        }
    }
}

/// Bounded pool of one-shot worker threads.
pub struct Executor {
    name: String,
    max_workers: usize,
    inner: Arc<Inner>,
}

impl Executor {
    /// Create a pool admitting at most `max_workers` concurrent tasks.
    pub fn new(name: impl Into<String>, max_workers: usize) -> Self {
        Self {
            name: name.into(),
            max_workers,
            inner: Arc::new(Inner {
                state: Mutex::new(PoolState {
                    accepting: true,
                    workers: Slab::with_capacity(max_workers),
                }),
                drained: Condvar::new(),
            }),
        }
    }

    /// Run `task` on a new thread.
    ///
    /// Returns `false` without running it when the pool is stopped, already at
    /// `max_workers` live tasks, or the thread cannot be spawned.
    pub fn execute<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        // The lock is held across spawn so the new thread's guard cannot
        // remove its slot before the slot exists.
        let mut state = self.inner.lock();
        if !state.accepting || state.workers.len() >= self.max_workers {
            return false;
        }

        let entry = state.workers.vacant_entry();
        let key = entry.key();
        let name = format!("{}-{}", self.name, key);
        let inner = Arc::clone(&self.inner);

        let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
            let _guard = WorkerGuard { inner, key };
            task();
        });

        match spawned {
            Ok(_) => {
                entry.insert(Worker {
                    name,
                    started: Instant::now(),
                });
                true
            }
            Err(e) => {
                warn!(pool = %self.name, error = %e, "Failed to spawn worker thread");
                false
            }
        }
    }

    /// Stop admitting tasks. With `await_drain`, also wait for live tasks.
    pub fn stop(&self, await_drain: bool) {
        self.inner.lock().accepting = false;
        if await_drain {
            self.join();
        }
    }

    /// Block until no task is live.
    pub fn join(&self) {
        let state = self.inner.lock();
        let _drained = self
            .inner
            .drained
            .wait_while(state, |state| !state.workers.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Number of tasks currently running.
    pub fn live(&self) -> usize {
        self.inner.lock().workers.len()
    }
}
