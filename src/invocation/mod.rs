//! Deferred, composable units of work representing inbound calls.
//!
//! An inbound call is split into two views over one shared call record:
//!
//! - [`Invocation`] travels through a method stream. Pipeline stages [`map`](Invocation::map) it
//!   into new invocations and the scheduler eventually [`run`](Invocation::run)s it.
//! - [`InvocationHandle`] stays with the transport layer, which registers completion callbacks or
//!   awaits [`completion`](InvocationHandle::completion) to resume the suspended call.
//!
//! Every call completes exactly once: by running, by being [discarded](Invocation::discard), or by
//! every stream-side copy being dropped, in which case it completes with
//! [`Status::unavailable`].

use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex, OnceLock};

use tokio::sync::oneshot;
use tonic::Status;
use tracing::{debug, trace, warn};
use uuid::Uuid;

pub use self::context::CallContext;
pub use self::error::NotReady;
use crate::method::MethodName;

pub mod context;
pub mod error;

/// The final state of a call as observed by its completion callbacks.
pub type Outcome<R> = Result<R, Status>;

/// The service implementation for a method: computes the reply from the call context and input.
pub type WorkFn<T, R> = Arc<dyn Fn(&CallContext, T) -> Outcome<R> + Send + Sync>;

/// Lazily yields the input payload of a call.
pub type ArgumentThunk<T> = Box<dyn FnOnce() -> T + Send>;

type Transform<T> = Arc<dyn Fn(T) -> T + Send + Sync>;
type Callback<R> = Box<dyn FnOnce(&Outcome<R>) + Send>;

/// Input payloads carried by invocations.
pub trait Payload: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Payload for T {}

/// Results produced by work functions.
pub trait Reply: Send + Sync + 'static {}

impl<R: Send + Sync + 'static> Reply for R {}

/// Build a [`WorkFn`] from a closure.
pub fn work_fn<T, R, F>(work: F) -> WorkFn<T, R>
where
    F: Fn(&CallContext, T) -> Outcome<R> + Send + Sync + 'static,
{
    Arc::new(work)
}

/// Unique identifier of a single inbound call, shared by every mapped form of it.
#[derive(Clone, Copy, Hash, PartialEq, Eq)]
pub struct InvocationId(Uuid);

impl InvocationId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Debug for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InvocationId({})", self.0)
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    /// The completer is still running callbacks; new ones queue behind them.
    Firing,
    Drained,
}

struct CallState<R> {
    phase: Phase,
    callbacks: Vec<Callback<R>>,
}

/// The shared record of one inbound call.
struct Call<T, R> {
    id: InvocationId,
    context: CallContext,
    work: WorkFn<T, R>,
    argument: LazyLock<T, ArgumentThunk<T>>,
    started: AtomicBool,
    result: OnceLock<Outcome<R>>,
    state: Mutex<CallState<R>>,
}

impl<T, R> Call<T, R> {
    /// Store the outcome and fire the pending callbacks in registration order.
    ///
    /// Callbacks added from other threads while this runs are queued and fired here too, after
    /// the earlier ones. Returns `false` if the call had already completed, in which case nothing
    /// happens.
    fn complete(&self, outcome: Outcome<R>) -> bool {
        if self.result.set(outcome).is_err() {
            return false;
        }
        let Some(outcome) = self.result.get() else {
            return false;
        };

        let mut state = self.state.lock().expect("invocation state lock poisoned");
        state.phase = Phase::Firing;

        loop {
            let callbacks = std::mem::take(&mut state.callbacks);
            if callbacks.is_empty() {
                state.phase = Phase::Drained;
                return true;
            }
            drop(state);

            trace!(invocation = %self.id, callbacks = callbacks.len(), "Running completion callbacks");
            for callback in callbacks {
                self.fire(callback, outcome);
            }

            state = self.state.lock().expect("invocation state lock poisoned");
        }
    }

    fn add_callback(&self, callback: Callback<R>) {
        {
            let mut state = self.state.lock().expect("invocation state lock poisoned");
            if state.phase != Phase::Drained {
                state.callbacks.push(callback);
                return;
            }
        }

        // Fully drained: only the new callback fires.
        if let Some(outcome) = self.result.get() {
            self.fire(callback, outcome);
        }
    }

    fn fire(&self, callback: Callback<R>, outcome: &Outcome<R>) {
        if panic::catch_unwind(AssertUnwindSafe(|| callback(outcome))).is_err() {
            warn!(
                invocation = %self.id,
                method = %self.context.method(),
                "Completion callback panicked"
            );
        }
    }

    fn result(&self) -> Result<&Outcome<R>, NotReady> {
        self.result.get().ok_or(NotReady {
            invocation: self.id,
        })
    }
}

/// Completes the call as unavailable once every stream-side copy is gone without it running.
struct RunTicket<T, R> {
    call: Arc<Call<T, R>>,
}

impl<T, R> Drop for RunTicket<T, R> {
    fn drop(&mut self) {
        let status = Status::unavailable(format!(
            "call to '{}' was dropped before execution",
            self.call.context.method()
        ));

        if self.call.complete(Err(status)) {
            debug!(
                invocation = %self.call.id,
                method = %self.call.context.method(),
                "Invocation dropped before execution"
            );
        }
    }
}

/// A deferred inbound call as carried by a method stream.
///
/// Cloning is cheap and every clone refers to the same call. [`map`](Self::map) produces a new
/// invocation with an extra transform applied to the input while still delegating execution and
/// callbacks to the same call.
pub struct Invocation<T, R> {
    call: Arc<Call<T, R>>,
    ticket: Arc<RunTicket<T, R>>,
    transform: Option<Transform<T>>,
    /// The transformed input, computed on first use and shared by clones.
    input: Arc<OnceLock<T>>,
}

impl<T: Payload, R: Reply> Invocation<T, R> {
    /// Wrap an inbound call.
    ///
    /// `argument` is evaluated at most once, the first time the input is needed.
    pub fn new(
        context: CallContext,
        work: WorkFn<T, R>,
        argument: impl FnOnce() -> T + Send + 'static,
    ) -> Self {
        let thunk: ArgumentThunk<T> = Box::new(argument);
        let call = Arc::new(Call {
            id: InvocationId::generate(),
            context,
            work,
            argument: LazyLock::new(thunk),
            started: AtomicBool::new(false),
            result: OnceLock::new(),
            state: Mutex::new(CallState {
                phase: Phase::Pending,
                callbacks: Vec::new(),
            }),
        });

        Self {
            ticket: Arc::new(RunTicket {
                call: Arc::clone(&call),
            }),
            call,
            transform: None,
            input: Arc::new(OnceLock::new()),
        }
    }

    pub fn id(&self) -> InvocationId {
        self.call.id
    }

    pub fn method(&self) -> &MethodName {
        self.call.context.method()
    }

    pub fn context(&self) -> &CallContext {
        &self.call.context
    }

    /// The transport-side view of this call.
    pub fn handle(&self) -> InvocationHandle<T, R> {
        InvocationHandle {
            call: Arc::clone(&self.call),
        }
    }

    /// Return a new invocation whose input is additionally passed through `transformer`.
    ///
    /// The transformer runs after any transform already present. `self` is left untouched.
    /// If the input of `self` has already been computed, the new transformer starts from it
    /// instead of re-running the earlier transforms.
    pub fn map<F>(&self, transformer: F) -> Self
    where
        F: Fn(T) -> T + Send + Sync + 'static,
    {
        let transform: Transform<T> = match (self.input.get(), self.transform.clone()) {
            (Some(computed), Some(_)) => {
                let computed = computed.clone();
                Arc::new(move |_: T| transformer(computed.clone()))
            }
            (_, Some(previous)) => Arc::new(move |input: T| transformer(previous(input))),
            (_, None) => Arc::new(transformer),
        };

        Self {
            call: Arc::clone(&self.call),
            ticket: Arc::clone(&self.ticket),
            transform: Some(transform),
            input: Arc::new(OnceLock::new()),
        }
    }

    /// The transformed input this invocation would run with.
    ///
    /// The transform chain runs at most once per invocation; later calls return a clone.
    pub fn input(&self) -> T {
        self.input
            .get_or_init(|| {
                let input = T::clone(&self.call.argument);
                match &self.transform {
                    Some(transform) => transform(input),
                    None => input,
                }
            })
            .clone()
    }

    /// Execute the work function, store its outcome and fire the completion callbacks.
    ///
    /// Blocks the calling thread for the duration of the work function. A panicking work function
    /// completes the call with [`Status::internal`].
    ///
    /// # Panics
    /// An inbound call executes at most once. Calling `run` a second time on this invocation, or on
    /// any other invocation mapped from the same call, panics without executing anything.
    pub fn run(&self) {
        let first_run = !self.call.started.swap(true, Ordering::AcqRel);
        assert!(
            first_run,
            "invocation {} for '{}' was run more than once",
            self.call.id,
            self.call.context.method()
        );

        trace!(invocation = %self.call.id, method = %self.call.context.method(), "Invocation run");

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            (self.call.work)(&self.call.context, self.input())
        }))
        .unwrap_or_else(|_| {
            warn!(
                invocation = %self.call.id,
                method = %self.call.context.method(),
                "Work function panicked"
            );
            Err(Status::internal("handler panicked"))
        });

        if !self.call.complete(outcome) {
            debug!(
                invocation = %self.call.id,
                "Invocation ran after it was already completed, outcome ignored"
            );
        }
    }

    /// Complete the call with `status` without running it.
    ///
    /// Returns `false` if the call had already completed.
    pub fn discard(&self, status: Status) -> bool {
        self.call.complete(Err(status))
    }

    /// Register `callback` to observe the outcome.
    ///
    /// Callbacks fire in registration order, each exactly once. A callback added after completion
    /// fires immediately on the calling thread.
    pub fn add_callback(&self, callback: impl FnOnce(&Outcome<R>) + Send + 'static) {
        self.call.add_callback(Box::new(callback));
    }

    pub fn is_done(&self) -> bool {
        self.call.result.get().is_some()
    }

    /// The stored outcome, available once the call has completed.
    pub fn result(&self) -> Result<&Outcome<R>, NotReady> {
        self.call.result()
    }
}

impl<T, R> Clone for Invocation<T, R> {
    fn clone(&self) -> Self {
        Self {
            call: Arc::clone(&self.call),
            ticket: Arc::clone(&self.ticket),
            transform: self.transform.clone(),
            input: Arc::clone(&self.input),
        }
    }
}

impl<T, R> fmt::Debug for Invocation<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("id", &self.call.id)
            .field("method", self.call.context.method())
            .field("transformed", &self.transform.is_some())
            .field("done", &self.call.result.get().is_some())
            .finish()
    }
}

/// The transport-side view of an inbound call.
///
/// Holding a handle does not keep the call pending: once every stream-side [`Invocation`] is gone
/// the call completes whether or not a handle is still alive.
pub struct InvocationHandle<T, R> {
    call: Arc<Call<T, R>>,
}

impl<T: Payload, R: Reply> InvocationHandle<T, R> {
    pub fn id(&self) -> InvocationId {
        self.call.id
    }

    pub fn method(&self) -> &MethodName {
        self.call.context.method()
    }

    /// See [`Invocation::add_callback`].
    pub fn add_callback(&self, callback: impl FnOnce(&Outcome<R>) + Send + 'static) {
        self.call.add_callback(Box::new(callback));
    }

    pub fn is_done(&self) -> bool {
        self.call.result.get().is_some()
    }

    /// The stored outcome, available once the call has completed.
    pub fn result(&self) -> Result<&Outcome<R>, NotReady> {
        self.call.result()
    }

    /// A future resolving to the outcome of the call, for async transports.
    pub fn completion(&self) -> impl Future<Output = Outcome<R>> + Send + 'static + use<T, R>
    where
        R: Clone,
    {
        let (tx, rx) = oneshot::channel();
        self.add_callback(move |outcome: &Outcome<R>| {
            let _ = tx.send(outcome.clone());
        });

        async move {
            rx.await.unwrap_or_else(|_| {
                Err(Status::cancelled(
                    "invocation was released without completing",
                ))
            })
        }
    }
}

impl<T, R> Clone for InvocationHandle<T, R> {
    fn clone(&self) -> Self {
        Self {
            call: Arc::clone(&self.call),
        }
    }
}

impl<T, R> fmt::Debug for InvocationHandle<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationHandle")
            .field("id", &self.call.id)
            .field("method", self.call.context.method())
            .field("done", &self.call.result.get().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn echo() -> WorkFn<String, String> {
        work_fn(|_: &CallContext, input: String| Ok(input))
    }

    fn invocation(input: &str) -> Invocation<String, String> {
        let input = input.to_string();
        Invocation::new(CallContext::new("Echo"), echo(), move || input)
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&'static str) -> Callback<String>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_for_factory = Arc::clone(&log);
        let factory = move |name: &'static str| -> Callback<String> {
            let log = Arc::clone(&log_for_factory);
            Box::new(move |outcome: &Outcome<String>| {
                let value = outcome.as_ref().map(String::as_str).unwrap_or("<err>");
                log.lock().unwrap().push(format!("{name}:{value}"));
            })
        };
        (log, factory)
    }

    #[test]
    fn test_run_sets_result_and_fires_callback() {
        let work = work_fn(|_: &CallContext, _: String| Ok("hi".to_string()));
        let inv = Invocation::new(CallContext::new("Echo"), work, || String::new());
        let (log, callback) = recorder();

        inv.add_callback(callback("cb"));
        assert!(!inv.is_done());

        inv.run();

        assert!(inv.is_done());
        assert_eq!(inv.result().unwrap().as_ref().unwrap(), "hi");
        assert_eq!(*log.lock().unwrap(), vec!["cb:hi"]);
    }

    #[test]
    fn test_result_before_completion_is_not_ready() {
        let inv = invocation("abc");
        assert!(matches!(inv.result(), Err(NotReady { .. })));
        assert!(inv.handle().result().is_err());
    }

    #[test]
    fn test_callbacks_fire_in_registration_order() {
        let inv = invocation("x");
        let (log, callback) = recorder();

        inv.add_callback(callback("first"));
        inv.handle().add_callback(callback("second"));
        inv.add_callback(callback("third"));
        inv.run();

        assert_eq!(*log.lock().unwrap(), vec!["first:x", "second:x", "third:x"]);
    }

    #[test]
    fn test_late_callback_fires_only_itself() {
        let inv = invocation("done");
        let (log, callback) = recorder();

        inv.add_callback(callback("early"));
        inv.run();
        inv.add_callback(callback("late"));

        // The early callback must not be replayed when the late one is added
        assert_eq!(*log.lock().unwrap(), vec!["early:done", "late:done"]);
    }

    #[test]
    fn test_callback_added_while_firing_runs_after_earlier_ones() {
        let inv = invocation("v");
        let (log, callback) = recorder();
        let (started_tx, started_rx) = std::sync::mpsc::channel();

        let slow = callback("c0");
        inv.add_callback(move |outcome: &Outcome<String>| {
            started_tx.send(()).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(100));
            slow(outcome);
        });
        inv.add_callback(callback("c1"));

        let runner = inv.clone();
        let worker = std::thread::spawn(move || runner.run());

        started_rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .unwrap();
        inv.add_callback(callback("c2"));
        worker.join().unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["c0:v", "c1:v", "c2:v"]);
    }

    #[test]
    fn test_map_transforms_input() {
        let inv = invocation("abc");
        let upper = inv.map(|s: String| s.to_uppercase());

        assert_eq!(upper.input(), "ABC");
        assert_eq!(inv.input(), "abc");

        upper.run();
        assert_eq!(inv.handle().result().unwrap().as_ref().unwrap(), "ABC");
    }

    #[test]
    fn test_map_composition_matches_composed_function() {
        let f = |s: String| format!("{s}!");
        let g = |s: String| s.repeat(2);

        for sample in ["", "a", "hello", "ünï"] {
            let chained = invocation(sample).map(f).map(g);
            let composed = invocation(sample).map(move |s| g(f(s)));
            assert_eq!(chained.input(), composed.input());
        }
    }

    #[test]
    fn test_argument_thunk_evaluated_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_for_thunk = Arc::clone(&calls);
        let inv = Invocation::new(CallContext::new("Echo"), echo(), move || {
            calls_for_thunk.fetch_add(1, Ordering::SeqCst);
            "payload".to_string()
        });

        let mapped = inv.map(|s| s.len().to_string());
        assert_eq!(inv.input(), "payload");
        assert_eq!(mapped.input(), "7");
        mapped.run();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_transform_chain_runs_once_per_invocation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_for_map = Arc::clone(&calls);
        let mapped = invocation("abc").map(move |s| {
            calls_for_map.fetch_add(1, Ordering::SeqCst);
            s.to_uppercase()
        });

        assert_eq!(mapped.input(), "ABC");
        assert_eq!(mapped.clone().input(), "ABC");
        let extended = mapped.map(|s| s + "!");
        assert_eq!(extended.input(), "ABC!");
        extended.run();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(mapped.result().unwrap().as_ref().unwrap(), "ABC!");
    }

    #[test]
    fn test_work_error_is_stored() {
        let work = work_fn(|_: &CallContext, _: String| -> Outcome<String> {
            Err(Status::not_found("nothing here"))
        });
        let inv = Invocation::new(CallContext::new("Echo"), work, String::new);
        inv.run();

        let status = inv.result().unwrap().as_ref().unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[test]
    fn test_work_panic_completes_as_internal() {
        let work = work_fn(|_: &CallContext, _: String| -> Outcome<String> { panic!("boom") });
        let inv = Invocation::new(CallContext::new("Echo"), work, String::new);
        inv.run();

        let status = inv.result().unwrap().as_ref().unwrap_err();
        assert_eq!(status.code(), tonic::Code::Internal);
    }

    #[test]
    #[should_panic(expected = "run more than once")]
    fn test_second_run_panics() {
        let inv = invocation("once");
        let mapped = inv.map(|s| s);
        inv.run();
        mapped.run();
    }

    #[test]
    fn test_panicking_callback_does_not_block_others() {
        let inv = invocation("v");
        let (log, callback) = recorder();

        inv.add_callback(|_| panic!("bad callback"));
        inv.add_callback(callback("after"));
        inv.run();

        assert_eq!(*log.lock().unwrap(), vec!["after:v"]);
    }

    #[test]
    fn test_dropping_unrun_invocation_completes_unavailable() {
        let inv = invocation("lost");
        let handle = inv.handle();
        let mapped = inv.map(|s| s);

        drop(inv);
        assert!(!handle.is_done());

        drop(mapped);
        let status = handle.result().unwrap().as_ref().unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unavailable);
    }

    #[test]
    fn test_discard_wins_over_later_drop() {
        let inv = invocation("x");
        let handle = inv.handle();

        assert!(inv.discard(Status::failed_precondition("filtered")));
        assert!(!inv.discard(Status::aborted("again")));
        drop(inv);

        let status = handle.result().unwrap().as_ref().unwrap_err();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn test_completion_future_resolves() {
        let inv = invocation("async");
        let completion = inv.handle().completion();

        std::thread::spawn(move || inv.run());

        assert_eq!(completion.await.unwrap(), "async");
    }
}
