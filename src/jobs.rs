//! Fixed-size worker pool for post-build analysis.
//!
//! Jobs sit in one queue guarded by a mutex; workers sleep on a condition
//! variable until work arrives. [`JobPool::map`] gives every job its own
//! output slot and assembles results in input order, so results never depend
//! on scheduling.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use log::{debug, warn};

use crate::cancel::CancelToken;
use crate::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Queue {
    jobs: VecDeque<Job>,
    /// Submitted jobs not yet finished, queued or running.
    pending: usize,
    shutdown: bool,
    cancelled: bool,
    panicked: bool,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
    idle: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Completion latch for one [`JobPool::map`] batch.
#[derive(Default)]
struct Batch {
    state: Mutex<(usize, bool)>,
    done: Condvar,
}

impl Batch {
    fn finish(&self, panicked: bool) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.0 = state.0.saturating_sub(1);
        state.1 |= panicked;
        if state.0 == 0 {
            self.done.notify_all();
        }
    }

    fn wait(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while state.0 > 0 {
            state = self
                .done
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.1
    }
}

/// One job's share of a [`Batch`]. Finishing happens on drop, so a job that
/// [`JobPool::cancel_all`] discards still releases the waiting caller.
struct Ticket {
    batch: Arc<Batch>,
    panicked: bool,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.batch.finish(self.panicked);
    }
}

pub struct JobPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl JobPool {
    pub fn new(threads: usize) -> Result<Self> {
        let threads = threads.max(1);
        let shared = Arc::new(Shared::default());
        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("rmtrace-worker-{index}"))
                .spawn(move || worker_loop(&shared))?;
            workers.push(handle);
        }
        debug!("job pool started with {threads} workers");
        Ok(Self { shared, workers })
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut queue = self.shared.lock();
        queue.jobs.push_back(Box::new(job));
        queue.pending += 1;
        drop(queue);
        self.shared.available.notify_one();
    }

    /// Blocks until every submitted job has finished or been dropped by
    /// [`cancel_all`](Self::cancel_all). Clears the cancel and panic flags.
    pub fn wait_all(&self) -> Result<()> {
        let mut queue = self.shared.lock();
        while queue.pending > 0 {
            queue = self
                .shared
                .idle
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
        let panicked = std::mem::take(&mut queue.panicked);
        let cancelled = std::mem::take(&mut queue.cancelled);
        if panicked {
            Err(Error::WorkerPanicked)
        } else if cancelled {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Drops every queued job. Running jobs finish. A [`map`](Self::map)
    /// whose jobs were dropped returns [`Error::Cancelled`].
    pub fn cancel_all(&self) {
        let mut queue = self.shared.lock();
        let dropped = std::mem::take(&mut queue.jobs);
        queue.pending -= dropped.len();
        queue.cancelled = true;
        if queue.pending == 0 {
            self.shared.idle.notify_all();
        }
        drop(queue);
        // Jobs are dropped outside the lock; their tickets wake map callers.
        debug!("cancelled {} queued jobs", dropped.len());
        drop(dropped);
    }

    /// Runs `f` over `items` on the pool and returns the results in input
    /// order. The token is sampled before each job starts.
    pub fn map<I, T, F>(&self, items: Vec<I>, f: F, cancel: &CancelToken) -> Result<Vec<T>>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(I) -> T + Send + Sync + 'static,
    {
        let count = items.len();
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut slots = Vec::new();
        slots.try_reserve(count)?;
        slots.extend((0..count).map(|_| Mutex::new(None)));
        let slots: Arc<Vec<Mutex<Option<T>>>> = Arc::new(slots);
        let batch = Arc::new(Batch {
            state: Mutex::new((count, false)),
            done: Condvar::new(),
        });
        let f = Arc::new(f);

        for (index, item) in items.into_iter().enumerate() {
            let slots = Arc::clone(&slots);
            let ticket = Ticket {
                batch: Arc::clone(&batch),
                panicked: false,
            };
            let f = Arc::clone(&f);
            let cancel = cancel.clone();
            self.submit(move || {
                let mut ticket = ticket;
                if cancel.is_cancelled() {
                    return;
                }
                match catch_unwind(AssertUnwindSafe(|| f(item))) {
                    Ok(value) => {
                        if let Some(slot) = slots.get(index) {
                            *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
                        }
                    }
                    Err(_) => {
                        warn!("job {index} panicked");
                        ticket.panicked = true;
                    }
                }
            });
        }

        if batch.wait() {
            return Err(Error::WorkerPanicked);
        }
        cancel.check()?;
        let mut out = Vec::with_capacity(count);
        for slot in slots.iter() {
            let value = slot
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
                .ok_or(Error::Cancelled)?;
            out.push(value);
        }
        Ok(out)
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut queue = shared.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                if queue.shutdown {
                    return;
                }
                queue = shared
                    .available
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        let outcome = catch_unwind(AssertUnwindSafe(job));
        let mut queue = shared.lock();
        if outcome.is_err() {
            queue.panicked = true;
        }
        queue.pending = queue.pending.saturating_sub(1);
        if queue.pending == 0 {
            shared.idle.notify_all();
        }
    }
}

impl Drop for JobPool {
    fn drop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.available.notify_all();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("job pool worker exited by panic");
            }
        }
    }
}
