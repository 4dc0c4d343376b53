use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{self, Either};
use tonic::Status;
use tracing::{debug, info};

pub use self::config::RouterConfig;
use crate::RouterError;
use crate::dispatch::Dispatcher;
use crate::invocation::{CallContext, InvocationHandle, Outcome, Payload, Reply, WorkFn};
use crate::method::{MethodName, MethodSelector, Schema};
use crate::pipeline::IntoStages;
use crate::registry::{AlreadySubscribed, MethodRegistry, MethodStream};
use crate::scheduler::{PoolClosed, Scheduler, Subscription};

pub mod config;

/// The lifecycle state of a router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterStatus {
    /// Pipelines may still be attached and replaced.
    Configuring,
    /// Every method is bound to a consumer; pipelines are fixed.
    Subscribed,
}

enum RouterState {
    Configuring,
    Subscribed(Subscription),
}

/// Routes inbound calls through per-method pipelines onto worker threads.
///
/// A router starts out [`Configuring`](RouterStatus::Configuring): pipelines are attached with
/// [`pipe`](Self::pipe) or [`set_observable`](Self::set_observable). [`subscribe`](Self::subscribe)
/// binds every method to a consumer and moves the router to
/// [`Subscribed`](RouterStatus::Subscribed), after which pipelines can no longer change. Calls
/// may be dispatched in either state; calls dispatched before subscribing are held and run once
/// the router subscribes.
///
/// # Example
/// ```ignore
/// let router = Router::<String, String>::new(&["Echo"], RouterConfig::default())?;
/// router.pipe("Echo", map(|s: String| s.to_uppercase()))?;
/// router.subscribe()?;
///
/// let reply = router
///     .invoke(CallContext::new("Echo"), work_fn(|_, s| Ok(s)), || "abc".to_string())
///     .await?;
/// assert_eq!(reply, "ABC");
/// ```
pub struct Router<T, R> {
    registry: Arc<MethodRegistry<T, R>>,
    dispatcher: Dispatcher<T, R>,
    scheduler: Scheduler<T, R>,
    state: Mutex<RouterState>,
    config: RouterConfig,
}

impl<T: Payload, R: Reply> Router<T, R> {
    /// Create a router serving exactly the methods enumerated by `schema`.
    pub fn new<S: Schema + ?Sized>(schema: &S, config: RouterConfig) -> Result<Self, RouterError> {
        let registry = Arc::new(MethodRegistry::new(schema, config.method_queue_capacity));
        let scheduler = Scheduler::new(
            Arc::clone(&registry),
            config.max_workers,
            config.pool_queue_capacity,
            config.method_queue_capacity,
            config.thread_name_prefix(),
        )?;

        info!(
            methods = registry.method_names().len(),
            max_workers = config.max_workers,
            "Router created"
        );

        Ok(Self {
            dispatcher: Dispatcher::new(Arc::clone(&registry)),
            registry,
            scheduler,
            state: Mutex::new(RouterState::Configuring),
            config,
        })
    }

    /// Append `stages` to the pipeline of the selected method.
    ///
    /// Returns the method's new stream. Only legal while configuring.
    pub fn pipe(
        &self,
        selector: impl Into<MethodSelector>,
        stages: impl IntoStages<T, R>,
    ) -> Result<MethodStream<T, R>, RouterError> {
        let method = selector.into().resolve()?;
        let state = self.configuring(&method)?;

        let piped = self.registry.get_stream(method.as_str())?.pipe(stages);
        self.registry.set_stream(method.as_str(), piped)?;
        drop(state);

        let stream = self.registry.get_stream(method.as_str())?;
        info!(method = %method, stages = stream.stages().len(), "Piped method stream");
        Ok(stream)
    }

    /// Replace the stream of the selected method. Only legal while configuring.
    pub fn set_observable(
        &self,
        selector: impl Into<MethodSelector>,
        stream: MethodStream<T, R>,
    ) -> Result<(), RouterError> {
        let method = selector.into().resolve()?;
        let _state = self.configuring(&method)?;

        self.registry.set_stream(method.as_str(), stream)
    }

    /// The current stream of the selected method.
    pub fn get_observable(
        &self,
        selector: impl Into<MethodSelector>,
    ) -> Result<MethodStream<T, R>, RouterError> {
        let method = selector.into().resolve()?;
        Ok(self.registry.get_stream(method.as_str())?)
    }

    /// Bind every method to a consumer and stop accepting pipeline changes.
    ///
    /// Must be called before the transport starts serving; until then no call executes.
    /// Idempotent: later calls return the same subscription.
    pub fn subscribe(&self) -> Result<Subscription, RouterError> {
        let mut state = self.state.lock().expect("router state lock poisoned");

        if let RouterState::Subscribed(subscription) = &*state {
            debug!("Router already subscribed");
            return Ok(subscription.clone());
        }

        let subscription = self.scheduler.subscribe_all()?;
        *state = RouterState::Subscribed(subscription.clone());

        info!(methods = subscription.methods().len(), "Router subscribed");
        Ok(subscription)
    }

    /// Wrap an inbound call and publish it on its method's stream.
    pub fn dispatch(
        &self,
        context: CallContext,
        work: WorkFn<T, R>,
        argument: impl FnOnce() -> T + Send + 'static,
    ) -> Result<InvocationHandle<T, R>, RouterError> {
        if self.scheduler.is_shut_down() {
            return Err(PoolClosed {
                pool: self.scheduler.shared_pool().name().to_string(),
            }
            .into());
        }

        Ok(self.dispatcher.dispatch(context, work, argument)?)
    }

    /// Dispatch a call and await its outcome.
    ///
    /// Dispatch errors resolve immediately to the matching [`Status`].
    pub fn invoke(
        &self,
        context: CallContext,
        work: WorkFn<T, R>,
        argument: impl FnOnce() -> T + Send + 'static,
    ) -> impl Future<Output = Outcome<R>> + Send + 'static
    where
        R: Clone,
    {
        match self.dispatch(context, work, argument) {
            Ok(handle) => Either::Left(handle.completion()),
            Err(e) => Either::Right(future::ready(Err(Status::from(e)))),
        }
    }

    /// A dispatcher sharing this router's registry, for transport adapters.
    pub fn dispatcher(&self) -> Dispatcher<T, R> {
        self.dispatcher.clone()
    }

    /// Stop all worker threads without draining queued calls.
    ///
    /// Queued and buffered calls complete with [`Status::unavailable`]; later dispatches fail.
    pub fn shutdown(&self) {
        if self.scheduler.is_shut_down() {
            return;
        }

        self.scheduler.shutdown();
        let released = self.registry.release_backlogs();
        info!(released, "Router shut down");
    }

    fn configuring(&self, method: &MethodName) -> Result<MutexGuard<'_, RouterState>, RouterError> {
        let state = self.state.lock().expect("router state lock poisoned");

        if matches!(*state, RouterState::Subscribed(_)) {
            return Err(AlreadySubscribed {
                method: method.clone(),
            }
            .into());
        }

        Ok(state)
    }
}

impl<T, R> Router<T, R> {
    pub fn status(&self) -> RouterStatus {
        match *self.state.lock().expect("router state lock poisoned") {
            RouterState::Configuring => RouterStatus::Configuring,
            RouterState::Subscribed(_) => RouterStatus::Subscribed,
        }
    }

    pub fn registry(&self) -> &Arc<MethodRegistry<T, R>> {
        &self.registry
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }
}

impl<T: Payload, R: Reply> Router<T, R> {
    /// The fixed method set, sorted.
    pub fn methods(&self) -> Vec<MethodName> {
        self.registry.method_names()
    }
}

impl<T, R> fmt::Debug for Router<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("status", &self.status())
            .field("registry", &self.registry)
            .field("scheduler", &self.scheduler)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::invocation::work_fn;
    use crate::method::{MethodDescriptor, ServiceDescriptor};
    use crate::pipeline::operators::{filter, map};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn router() -> Router<String, String> {
        let config = RouterConfig::builder().max_workers(2).build();
        Router::new(&["Echo", "Other"], config).unwrap()
    }

    fn echo() -> WorkFn<String, String> {
        work_fn(|_: &CallContext, s: String| Ok(s))
    }

    fn dispatch_and_collect(
        router: &Router<String, String>,
        input: &str,
        tx: &mpsc::Sender<Outcome<String>>,
    ) -> InvocationHandle<String, String> {
        let input = input.to_string();
        let handle = router
            .dispatch(CallContext::new("Echo"), echo(), move || input)
            .unwrap();
        let tx = tx.clone();
        handle.add_callback(move |outcome: &Outcome<String>| {
            tx.send(outcome.clone()).unwrap();
        });
        handle
    }

    #[test]
    fn test_call_published_before_subscribe_runs_after() {
        let router = Router::<String, String>::new(&["Echo"], RouterConfig::default()).unwrap();
        let (tx, rx) = mpsc::channel();

        let handle = router
            .dispatch(
                CallContext::new("Echo"),
                work_fn(|_: &CallContext, _: String| Ok("hi".to_string())),
                String::new,
            )
            .unwrap();
        handle.add_callback(move |outcome: &Outcome<String>| {
            tx.send(outcome.clone()).unwrap();
        });
        assert!(!handle.is_done());

        router.subscribe().unwrap();

        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap().unwrap(), "hi");
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(handle.result().unwrap().as_ref().unwrap(), "hi");
    }

    #[test]
    fn test_set_observable_after_subscribe_fails() {
        let router = router();
        let stream = router.get_observable("Echo").unwrap();
        router.subscribe().unwrap();

        let result = router.set_observable("Echo", stream);
        assert!(matches!(result, Err(RouterError::AlreadySubscribed(_))));

        let result = router.pipe("Echo", map(|s: String| s));
        assert!(matches!(result, Err(RouterError::AlreadySubscribed(_))));
    }

    #[test]
    fn test_pipe_requires_exactly_one_selector() {
        let router = router();

        let both = MethodSelector::builder()
            .method_name("Echo")
            .method(MethodDescriptor::new("demo.EchoService", "Echo"))
            .build();
        let result = router.pipe(both, map(|s: String| s));
        assert!(matches!(result, Err(RouterError::InvalidArgument(_))));

        let result = router.pipe(MethodSelector::default(), map(|s: String| s));
        assert!(matches!(result, Err(RouterError::InvalidArgument(_))));
    }

    #[test]
    fn test_piped_map_transforms_input() {
        let router = router();
        router.pipe("Echo", map(|s: String| s.to_uppercase())).unwrap();
        router.subscribe().unwrap();

        let (tx, rx) = mpsc::channel();
        dispatch_and_collect(&router, "abc", &tx);

        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap().unwrap(), "ABC");
    }

    #[test]
    fn test_late_callback_fires_only_itself() {
        let router = router();
        router.subscribe().unwrap();
        let (tx, rx) = mpsc::channel();

        let handle = dispatch_and_collect(&router, "done", &tx);
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap().unwrap(), "done");

        let (late_tx, late_rx) = mpsc::channel();
        handle.add_callback(move |outcome: &Outcome<String>| {
            late_tx.send(outcome.clone()).unwrap();
        });

        assert_eq!(late_rx.recv_timeout(TIMEOUT).unwrap().unwrap(), "done");
        assert!(late_rx.try_recv().is_err());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_streams_available_in_both_states() {
        let router = router();

        for method in router.methods() {
            assert!(router.get_observable(&method).is_ok());
        }
        router.subscribe().unwrap();
        for method in router.methods() {
            assert!(router.get_observable(&method).is_ok());
        }
        assert!(matches!(
            router.get_observable("Missing"),
            Err(RouterError::UnknownMethod(_))
        ));
    }

    #[test]
    fn test_concurrent_dispatch_keeps_per_thread_order() {
        const THREADS: usize = 4;
        const CALLS: usize = 200;

        let router = Arc::new(router());
        router.subscribe().unwrap();

        let executed = Arc::new(Mutex::new(Vec::new()));
        let executed_for_work = Arc::clone(&executed);
        let work = work_fn(move |_: &CallContext, s: String| {
            executed_for_work.lock().unwrap().push(s.clone());
            Ok(s)
        });
        let (tx, rx) = mpsc::channel();

        let publishers: Vec<_> = (0..THREADS)
            .map(|thread| {
                let router = Arc::clone(&router);
                let work = Arc::clone(&work);
                let tx = tx.clone();
                std::thread::spawn(move || {
                    for call in 0..CALLS {
                        let handle = router
                            .dispatch(CallContext::new("Echo"), Arc::clone(&work), move || {
                                format!("{thread}:{call}")
                            })
                            .unwrap();
                        let tx = tx.clone();
                        handle.add_callback(move |outcome: &Outcome<String>| {
                            tx.send(outcome.clone()).unwrap();
                        });
                    }
                })
            })
            .collect();
        for publisher in publishers {
            publisher.join().unwrap();
        }

        for _ in 0..THREADS * CALLS {
            rx.recv_timeout(TIMEOUT).unwrap().unwrap();
        }
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        let executed = executed.lock().unwrap();
        assert_eq!(executed.len(), THREADS * CALLS);
        for thread in 0..THREADS {
            let order: Vec<usize> = executed
                .iter()
                .filter_map(|entry| entry.split_once(':'))
                .filter(|(t, _)| t.parse::<usize>() == Ok(thread))
                .map(|(_, call)| call.parse().unwrap())
                .collect();
            assert_eq!(order, (0..CALLS).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let router = router();
        assert_eq!(router.status(), RouterStatus::Configuring);

        let first = router.subscribe().unwrap();
        let second = router.subscribe().unwrap();

        assert!(first.same_as(&second));
        assert_eq!(router.status(), RouterStatus::Subscribed);
    }

    #[test]
    fn test_pipe_with_stage_tuple() {
        let router = router();
        router
            .pipe(
                "Echo",
                (
                    map(|s: String| s.trim().to_string()),
                    filter(|s: &String| !s.is_empty()),
                    map(|s: String| format!("<{s}>")),
                ),
            )
            .unwrap();
        router.subscribe().unwrap();

        let (tx, rx) = mpsc::channel();
        dispatch_and_collect(&router, "   ", &tx);
        dispatch_and_collect(&router, " x ", &tx);

        let filtered = rx.recv_timeout(TIMEOUT).unwrap().unwrap_err();
        assert_eq!(filtered.code(), tonic::Code::FailedPrecondition);
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap().unwrap(), "<x>");
    }

    #[test]
    fn test_descriptor_selector_resolves_full_path() {
        let service = ServiceDescriptor::new("demo.EchoService", ["Echo", "Shout"]);
        let router = Router::<String, String>::new(&service, RouterConfig::default()).unwrap();

        let shout = service.method("Shout").unwrap();
        let stream = router.pipe(&shout, map(|s: String| s.to_uppercase())).unwrap();

        assert_eq!(stream.method().as_str(), "/demo.EchoService/Shout");
        assert_eq!(
            router.get_observable("/demo.EchoService/Shout").unwrap().stages().len(),
            1
        );
    }

    #[test]
    fn test_dispatch_after_shutdown_fails() {
        let router = router();
        router.subscribe().unwrap();
        router.shutdown();

        let result = router.dispatch(CallContext::new("Echo"), echo(), String::new);
        assert!(matches!(result, Err(RouterError::PoolClosed(_))));
    }

    #[test]
    fn test_shutdown_releases_buffered_calls() {
        let router = router();
        let handle = router
            .dispatch(CallContext::new("Echo"), echo(), String::new)
            .unwrap();

        router.shutdown();

        let status = handle.result().unwrap().as_ref().unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unavailable);
    }

    #[tokio::test]
    async fn test_invoke_resolves_outcome() {
        let router = router();
        router.subscribe().unwrap();

        let reply = router
            .invoke(CallContext::new("Echo"), echo(), || "async".to_string())
            .await;
        assert_eq!(reply.unwrap(), "async");

        let missing = router
            .invoke(CallContext::new("Missing"), echo(), String::new)
            .await;
        assert_eq!(missing.unwrap_err().code(), tonic::Code::Unimplemented);
    }
}
