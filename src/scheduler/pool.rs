use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, info, trace};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Indicates that work was submitted to a pool after it was shut down.
#[derive(Debug, thiserror::Error)]
#[error("worker pool '{pool}' is shut down")]
pub struct PoolClosed {
    pub pool: String,
}

/// A fixed set of worker threads fed by a bounded queue.
///
/// Submitting to a full queue blocks the submitter until a worker frees a slot. Shutting the pool
/// down stops every worker after its current job; queued jobs are dropped without running.
pub struct WorkerPool {
    name: Arc<str>,
    size: usize,
    capacity: usize,
    sender: Mutex<Option<Sender<Job>>>,
    closed: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Start `size` workers (at least one) sharing a queue of `capacity` jobs (at least one).
    pub fn spawn(name: impl Into<Arc<str>>, size: usize, capacity: usize) -> io::Result<Self> {
        let name = name.into();
        let size = size.max(1);
        let capacity = capacity.max(1);

        let (sender, receiver) = crossbeam_channel::bounded::<Job>(capacity);
        let closed = Arc::new(AtomicBool::new(false));

        for index in 0..size {
            let receiver = receiver.clone();
            let closed = Arc::clone(&closed);
            let pool = Arc::clone(&name);

            thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || worker_loop(&pool, &receiver, &closed))?;
        }

        info!(pool = %name, workers = size, capacity, "Worker pool started");

        Ok(Self {
            name,
            size,
            capacity,
            sender: Mutex::new(Some(sender)),
            closed,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queue `job` for execution on one of the workers.
    pub(crate) fn execute(&self, job: Job) -> Result<(), PoolClosed> {
        let sender = self
            .sender
            .lock()
            .expect("worker pool sender lock poisoned")
            .clone();

        sender
            .ok_or_else(|| self.closed_error())?
            .send(job)
            .map_err(|_| self.closed_error())
    }

    /// Stop accepting work and release the workers without draining the queue.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.sender
            .lock()
            .expect("worker pool sender lock poisoned")
            .take();

        info!(pool = %self.name, "Worker pool shut down");
    }

    fn closed_error(&self) -> PoolClosed {
        PoolClosed {
            pool: self.name.to_string(),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("capacity", &self.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn worker_loop(pool: &str, receiver: &Receiver<Job>, closed: &AtomicBool) {
    trace!(pool = %pool, "Worker started");

    while let Ok(job) = receiver.recv() {
        if closed.load(Ordering::Acquire) {
            break;
        }

        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!(pool = %pool, "Job panicked on worker, continuing");
        }
    }

    debug!(pool = %pool, "Worker exiting");
}
