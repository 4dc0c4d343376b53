use std::fmt;

use crate::invocation::{Invocation, Payload, Reply};
use crate::method::MethodName;
use crate::pipeline::operators::{filter, map};
use crate::pipeline::{IntoStages, Stage};

/// Where the consumer of a method stream executes its invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execution {
    /// The bounded worker pool shared by every method of the router.
    Shared,
    /// A single worker owned by this method alone.
    Dedicated,
}

/// The ordered sequence of invocations for one method, together with the pipeline stages applied
/// to each invocation before it runs.
///
/// A stream is a value: [`pipe`](Self::pipe) returns a new stream with more stages and leaves the
/// original untouched. Installing it as the method's current stream is done through the registry
/// (or the router facade).
pub struct MethodStream<T, R> {
    method: MethodName,
    stages: Vec<Stage<T, R>>,
    execution: Execution,
}

impl<T, R> MethodStream<T, R> {
    /// The initial stream of a method: no stages, executed on the shared pool.
    pub fn new(method: MethodName) -> Self {
        Self {
            method,
            stages: Vec::new(),
            execution: Execution::Shared,
        }
    }

    pub fn method(&self) -> &MethodName {
        &self.method
    }

    pub fn stages(&self) -> &[Stage<T, R>] {
        &self.stages
    }

    pub fn execution(&self) -> Execution {
        self.execution
    }

    /// Return a new stream with `stages` appended after the existing ones.
    pub fn pipe(&self, stages: impl IntoStages<T, R>) -> Self {
        let mut piped = self.clone();
        stages.into_stages(&mut piped.stages);
        piped
    }

    /// Push `invocation` through every stage in order.
    ///
    /// Returns `None` as soon as a stage drops the invocation.
    pub fn apply(&self, invocation: Invocation<T, R>) -> Option<Invocation<T, R>> {
        self.stages
            .iter()
            .try_fold(invocation, |invocation, stage| stage.apply(invocation))
    }

    /// Rebind this stream as the replacement stream of `method`.
    pub(crate) fn into_replacement(mut self, method: MethodName) -> Self {
        self.method = method;
        self.execution = Execution::Dedicated;
        self
    }
}

impl<T: Payload, R: Reply> MethodStream<T, R> {
    /// Shorthand for piping a single [`map`] stage.
    pub fn map(&self, transformer: impl Fn(T) -> T + Send + Sync + 'static) -> Self {
        self.pipe(map(transformer))
    }

    /// Shorthand for piping a single [`filter`] stage.
    pub fn filter(&self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.pipe(filter(predicate))
    }
}

impl<T, R> Clone for MethodStream<T, R> {
    fn clone(&self) -> Self {
        Self {
            method: self.method.clone(),
            stages: self.stages.clone(),
            execution: self.execution,
        }
    }
}

impl<T, R> fmt::Debug for MethodStream<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodStream")
            .field("method", &self.method)
            .field("stages", &self.stages)
            .field("execution", &self.execution)
            .finish()
    }
}
