//! Executes published invocations on worker threads.
//!
//! Every method gets one consumer, bound by [`Scheduler::subscribe_all`]. A consumer owns a
//! [`Strand`] onto either the shared pool or, for methods whose stream was replaced, a dedicated
//! single-worker pool created once for that method. Invocations of one method therefore run in
//! publish order; different methods run in parallel.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tonic::Status;
use tracing::{debug, error, info, trace, warn};

pub use self::pool::{PoolClosed, WorkerPool};
use self::strand::{Strand, StrandError};
use crate::RouterError;
use crate::invocation::{Invocation, Payload, Reply};
use crate::method::MethodName;
use crate::registry::{Execution, MethodRegistry, MethodStream, Subscriber};

mod pool;
mod strand;

/// The set of execution bindings produced by subscribing.
///
/// Cloning is cheap; clones compare equal with [`Subscription::same_as`].
#[derive(Clone)]
pub struct Subscription {
    methods: Arc<[MethodName]>,
}

impl Subscription {
    fn new(methods: Vec<MethodName>) -> Self {
        Self {
            methods: methods.into(),
        }
    }

    /// The methods bound to a consumer, sorted.
    pub fn methods(&self) -> &[MethodName] {
        &self.methods
    }

    pub fn contains(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m.as_str() == method)
    }

    /// Whether both values refer to the same subscription.
    pub fn same_as(&self, other: &Subscription) -> bool {
        Arc::ptr_eq(&self.methods, &other.methods)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("methods", &self.methods)
            .finish()
    }
}

/// The consumer bound to one method: runs the stream's stages and then the invocation, in order.
struct StreamConsumer<T, R> {
    stream: Arc<MethodStream<T, R>>,
    strand: Strand,
}

impl<T: Payload, R: Reply> Subscriber<T, R> for StreamConsumer<T, R> {
    fn on_next(&self, invocation: Invocation<T, R>) {
        let pending = invocation.clone();
        let stream = Arc::clone(&self.stream);

        match self.strand.push(Box::new(move || execute(&stream, invocation))) {
            Ok(()) => trace!(
                method = %self.stream.method(),
                invocation = %pending.id(),
                "Invocation queued"
            ),
            Err(StrandError::Full { capacity }) => {
                warn!(
                    method = %self.stream.method(),
                    invocation = %pending.id(),
                    pool = %self.strand.pool().name(),
                    capacity,
                    "Method queue full, rejecting invocation"
                );
                pending.discard(Status::resource_exhausted(format!(
                    "queue of '{}' is full",
                    self.stream.method()
                )));
            }
            Err(StrandError::Closed) => {
                debug!(
                    method = %self.stream.method(),
                    invocation = %pending.id(),
                    "Scheduler shut down, rejecting invocation"
                );
                pending.discard(Status::unavailable("router is shut down"));
            }
        }
    }
}

/// Run `invocation` through the stages of `stream` and execute whatever comes out.
///
/// Runs on a worker thread. A panic in a stage or a repeated `run` is contained here so the
/// method's next invocation still executes.
fn execute<T: Payload, R: Reply>(stream: &MethodStream<T, R>, invocation: Invocation<T, R>) {
    let guard = invocation.clone();

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        if let Some(invocation) = stream.apply(invocation) {
            invocation.run();
        }
    }));

    if result.is_err() {
        error!(
            method = %stream.method(),
            invocation = %guard.id(),
            "Invocation panicked on worker, continuing with next"
        );
        guard.discard(Status::internal("pipeline stage panicked"));
    }
}

/// Binds method streams to worker pools and owns those pools.
pub struct Scheduler<T, R> {
    registry: Arc<MethodRegistry<T, R>>,
    shared: Arc<WorkerPool>,
    dedicated: Mutex<Vec<Arc<WorkerPool>>>,
    strands: Mutex<Vec<Strand>>,
    subscription: Mutex<Option<Subscription>>,
    method_queue_capacity: usize,
    thread_name_prefix: Arc<str>,
    shut_down: AtomicBool,
}

impl<T: Payload, R: Reply> Scheduler<T, R> {
    /// Start the shared pool of `max_workers` threads.
    ///
    /// The pool queue holds at least one drain task per method so a strand rescheduling itself
    /// from a worker never waits on its own pool.
    pub fn new(
        registry: Arc<MethodRegistry<T, R>>,
        max_workers: usize,
        pool_queue_capacity: usize,
        method_queue_capacity: usize,
        thread_name_prefix: impl Into<Arc<str>>,
    ) -> Result<Self, RouterError> {
        let thread_name_prefix = thread_name_prefix.into();
        let capacity = pool_queue_capacity.max(registry.method_names().len());
        let shared = WorkerPool::spawn(thread_name_prefix.clone(), max_workers, capacity)?;

        Ok(Self {
            registry,
            shared: Arc::new(shared),
            dedicated: Mutex::new(Vec::new()),
            strands: Mutex::new(Vec::new()),
            subscription: Mutex::new(None),
            method_queue_capacity,
            thread_name_prefix,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Bind a consumer to every method that does not have one yet.
    ///
    /// Idempotent: once every method is bound, further calls return the existing subscription
    /// without creating consumers.
    pub fn subscribe_all(&self) -> Result<Subscription, RouterError> {
        if self.is_shut_down() {
            return Err(PoolClosed {
                pool: self.shared.name().to_string(),
            }
            .into());
        }

        let mut cached = self
            .subscription
            .lock()
            .expect("subscription lock poisoned");

        let bound = self
            .registry
            .bind_pending(|method, stream| self.bind(method, stream))?;

        match cached.as_ref() {
            Some(subscription) if bound.is_empty() => {
                debug!("Already subscribed, returning existing subscription");
                Ok(subscription.clone())
            }
            _ => {
                let subscription = Subscription::new(self.registry.method_names());
                info!(
                    bound = bound.len(),
                    methods = subscription.methods().len(),
                    "Method streams subscribed"
                );
                *cached = Some(subscription.clone());
                Ok(subscription)
            }
        }
    }

    /// The current subscription, if [`subscribe_all`](Self::subscribe_all) has completed.
    pub fn subscription(&self) -> Option<Subscription> {
        self.subscription
            .lock()
            .expect("subscription lock poisoned")
            .clone()
    }

    /// Number of dedicated single-worker pools created so far.
    pub fn dedicated_pools(&self) -> usize {
        self.dedicated
            .lock()
            .expect("dedicated pools lock poisoned")
            .len()
    }

    pub fn shared_pool(&self) -> &WorkerPool {
        &self.shared
    }

    fn bind(
        &self,
        method: &MethodName,
        stream: MethodStream<T, R>,
    ) -> Result<Arc<dyn Subscriber<T, R>>, RouterError> {
        let pool = match stream.execution() {
            Execution::Shared => Arc::clone(&self.shared),
            Execution::Dedicated => {
                let name = format!("{}-{}", self.thread_name_prefix, method);
                let pool = Arc::new(WorkerPool::spawn(name, 1, self.method_queue_capacity)?);
                self.dedicated
                    .lock()
                    .expect("dedicated pools lock poisoned")
                    .push(Arc::clone(&pool));
                pool
            }
        };

        debug!(
            method = %method,
            pool = %pool.name(),
            stages = stream.stages().len(),
            "Binding method consumer"
        );

        let strand = Strand::new(pool, self.method_queue_capacity);
        self.strands
            .lock()
            .expect("strands lock poisoned")
            .push(strand.clone());

        Ok(Arc::new(StreamConsumer {
            stream: Arc::new(stream),
            strand,
        }))
    }
}

impl<T, R> Scheduler<T, R> {
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Stop every pool without draining.
    ///
    /// Invocations still queued are dropped and complete with [`Status::unavailable`];
    /// invocations already running finish normally.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let strands = std::mem::take(&mut *self.strands.lock().expect("strands lock poisoned"));
        let dropped: usize = strands.iter().map(Strand::close).sum();

        self.shared.shutdown();
        let dedicated =
            std::mem::take(&mut *self.dedicated.lock().expect("dedicated pools lock poisoned"));
        for pool in &dedicated {
            pool.shutdown();
        }

        info!(
            dropped,
            dedicated = dedicated.len(),
            "Scheduler shut down"
        );
    }
}

impl<T, R> Drop for Scheduler<T, R> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<T, R> fmt::Debug for Scheduler<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("shared", &self.shared)
            .field("method_queue_capacity", &self.method_queue_capacity)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
