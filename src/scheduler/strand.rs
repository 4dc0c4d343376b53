use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::warn;

use super::pool::{Job, WorkerPool};

/// Maximum jobs a strand runs before handing its worker back to the pool.
const DRAIN_BATCH: usize = 32;

/// Errors returned when a job cannot be queued on a strand.
#[derive(Debug, thiserror::Error)]
pub(crate) enum StrandError {
    #[error("strand queue is full ({capacity} jobs)")]
    Full { capacity: usize },

    #[error("strand is closed")]
    Closed,
}

struct StrandQueue {
    jobs: VecDeque<Job>,
    scheduled: bool,
    closed: bool,
}

struct StrandInner {
    pool: Arc<WorkerPool>,
    capacity: usize,
    queue: Mutex<StrandQueue>,
}

/// A FIFO lane onto a worker pool.
///
/// At most one drain task per strand is queued on or running in the pool at any time, so jobs
/// pushed to a strand run one after another in push order even when the pool has many workers.
#[derive(Clone)]
pub(crate) struct Strand {
    inner: Arc<StrandInner>,
}

impl Strand {
    pub fn new(pool: Arc<WorkerPool>, capacity: usize) -> Self {
        Self {
            inner: Arc::new(StrandInner {
                pool,
                capacity: capacity.max(1),
                queue: Mutex::new(StrandQueue {
                    jobs: VecDeque::new(),
                    scheduled: false,
                    closed: false,
                }),
            }),
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        self.inner
            .queue
            .lock()
            .expect("strand queue lock poisoned")
            .jobs
            .len()
    }

    pub fn push(&self, job: Job) -> Result<(), StrandError> {
        let needs_schedule = {
            let mut queue = self.inner.queue.lock().expect("strand queue lock poisoned");
            if queue.closed {
                return Err(StrandError::Closed);
            }
            if queue.jobs.len() >= self.inner.capacity {
                return Err(StrandError::Full {
                    capacity: self.inner.capacity,
                });
            }

            queue.jobs.push_back(job);
            !std::mem::replace(&mut queue.scheduled, true)
        };

        if needs_schedule {
            self.schedule();
        }

        Ok(())
    }

    /// Reject further jobs and drop the queued ones without running them.
    ///
    /// A job already running on a worker is left to finish.
    pub fn close(&self) -> usize {
        let jobs = {
            let mut queue = self.inner.queue.lock().expect("strand queue lock poisoned");
            queue.closed = true;
            std::mem::take(&mut queue.jobs)
        };

        let dropped = jobs.len();
        drop(jobs);
        dropped
    }

    fn schedule(&self) {
        let strand = self.clone();
        if let Err(e) = self.inner.pool.execute(Box::new(move || strand.drain())) {
            // Pool is gone: the queued jobs can never run, release them.
            warn!(error = %e, "Failed to schedule strand drain, dropping queued jobs");
            let jobs = {
                let mut queue = self.inner.queue.lock().expect("strand queue lock poisoned");
                queue.scheduled = false;
                std::mem::take(&mut queue.jobs)
            };
            drop(jobs);
        }
    }

    fn drain(&self) {
        for _ in 0..DRAIN_BATCH {
            let job = {
                let mut queue = self.inner.queue.lock().expect("strand queue lock poisoned");
                match queue.jobs.pop_front() {
                    Some(job) => job,
                    None => {
                        queue.scheduled = false;
                        return;
                    }
                }
            };

            job();
        }

        // Still scheduled: yield the worker and continue from the back of the pool queue.
        self.schedule();
    }
}
