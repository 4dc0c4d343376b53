use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::invocation::{CallContext, Invocation, InvocationHandle, Payload, Reply, WorkFn};
use crate::registry::{MethodRegistry, UnknownMethod};

/// Entry point for the transport layer: wraps each inbound call as an [`Invocation`] and
/// publishes it on the stream of the method named by its context.
pub struct Dispatcher<T, R> {
    registry: Arc<MethodRegistry<T, R>>,
}

impl<T: Payload, R: Reply> Dispatcher<T, R> {
    pub fn new(registry: Arc<MethodRegistry<T, R>>) -> Self {
        Self { registry }
    }

    /// Publish a call and return the handle the transport uses to observe its completion.
    ///
    /// The handle is taken before publishing, so a call that completes during publication is
    /// still observed: callbacks added afterwards fire immediately.
    pub fn dispatch(
        &self,
        context: CallContext,
        work: WorkFn<T, R>,
        argument: impl FnOnce() -> T + Send + 'static,
    ) -> Result<InvocationHandle<T, R>, UnknownMethod> {
        let method = context.method().clone();

        if !self.registry.contains(method.as_str()) {
            warn!(method = %method, "Call for unknown method");
            return Err(UnknownMethod {
                method: method.to_string(),
            });
        }

        let invocation = Invocation::new(context, work, argument);
        let handle = invocation.handle();
        let delivery = self.registry.publish(method.as_str(), invocation)?;

        debug!(
            method = %method,
            invocation = %handle.id(),
            subscribers = delivery.subscribers,
            buffered = delivery.buffered,
            rejected = delivery.rejected,
            "Dispatched call"
        );

        Ok(handle)
    }
}

impl<T, R> Clone for Dispatcher<T, R> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<T, R> fmt::Debug for Dispatcher<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .finish()
    }
}
