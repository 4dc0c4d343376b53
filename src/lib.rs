//! Per-method invocation streams for RPC servers.
//!
//! Each inbound call is wrapped as an [`Invocation`] and published on the stream of its method.
//! Pipeline stages attached to a stream before the router subscribes transform or filter the
//! calls, and a worker pool runs them in per-method order, completing the transport's
//! [`InvocationHandle`].

pub mod dispatch;
pub mod error;
pub mod invocation;
pub mod method;
pub mod pipeline;
pub mod registry;
pub mod router;
pub mod scheduler;

pub use dispatch::Dispatcher;
pub use error::RouterError;
pub use invocation::{
    CallContext, Invocation, InvocationHandle, InvocationId, Outcome, WorkFn, work_fn,
};
pub use method::{MethodDescriptor, MethodName, MethodSelector, Schema, ServiceDescriptor};
pub use pipeline::{IntoStages, Operator, Stage};
pub use registry::{MethodRegistry, MethodStream};
pub use router::{Router, RouterConfig, RouterStatus};
pub use scheduler::Subscription;
