//! Pipeline stages that transform invocations on their way to execution.
//!
//! A stage is any [`Operator`]: it receives an [`Invocation`] and either passes on an invocation
//! (usually a [mapped](Invocation::map) one) or drops it from the stream by returning `None`.
//! Closures of the shape `Fn(Invocation<T, R>) -> Option<Invocation<T, R>>` are operators, and the
//! [`operators`] module provides the common ones.
//!
//! Stages are handed to [`MethodStream::pipe`](crate::registry::MethodStream::pipe) through
//! [`IntoStages`], which accepts a single stage, a `Vec` of stages, or a tuple of stages:
//!
//! ```ignore
//! router.pipe(
//!     "/demo.Echo/Shout",
//!     (filter(|s: &String| !s.is_empty()), map(|s: String| s.to_uppercase())),
//! )?;
//! ```

use std::fmt;
use std::sync::Arc;

use impl_trait_for_tuples::impl_for_tuples;

use crate::invocation::Invocation;

pub mod operators;

/// A transformation applied to each invocation flowing through a method stream.
///
/// Operators run on the worker thread that executes the method, immediately before the invocation
/// runs, and see invocations one at a time in stream order.
pub trait Operator<T, R>: Send + Sync {
    /// Transform `invocation`, or return `None` to drop it from the stream.
    ///
    /// An operator that drops an invocation should [discard](Invocation::discard) it with a status
    /// explaining why; otherwise the caller sees a generic unavailable status.
    fn apply(&self, invocation: Invocation<T, R>) -> Option<Invocation<T, R>>;
}

impl<T, R, F> Operator<T, R> for F
where
    F: Fn(Invocation<T, R>) -> Option<Invocation<T, R>> + Send + Sync,
{
    fn apply(&self, invocation: Invocation<T, R>) -> Option<Invocation<T, R>> {
        self(invocation)
    }
}

/// A named, shareable pipeline stage.
pub struct Stage<T, R> {
    name: &'static str,
    operator: Arc<dyn Operator<T, R>>,
}

impl<T, R> Stage<T, R> {
    pub fn new(operator: impl Operator<T, R> + 'static) -> Self {
        Self::named("custom", operator)
    }

    /// Create a stage with a name used in logs and debug output.
    pub fn named(name: &'static str, operator: impl Operator<T, R> + 'static) -> Self {
        Self {
            name,
            operator: Arc::new(operator),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn apply(&self, invocation: Invocation<T, R>) -> Option<Invocation<T, R>> {
        self.operator.apply(invocation)
    }
}

impl<T, R> Clone for Stage<T, R> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            operator: Arc::clone(&self.operator),
        }
    }
}

impl<T, R> fmt::Debug for Stage<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Stage").field(&self.name).finish()
    }
}

/// Anything that can be appended to a pipeline as an ordered list of stages.
pub trait IntoStages<T, R> {
    /// Append the stages in order to `stages`.
    fn into_stages(self, stages: &mut Vec<Stage<T, R>>);
}

impl<T, R> IntoStages<T, R> for Stage<T, R> {
    fn into_stages(self, stages: &mut Vec<Stage<T, R>>) {
        stages.push(self);
    }
}

impl<T, R> IntoStages<T, R> for Vec<Stage<T, R>> {
    fn into_stages(self, stages: &mut Vec<Stage<T, R>>) {
        stages.extend(self);
    }
}

#[impl_for_tuples(1, 12)]
impl<T, R> IntoStages<T, R> for Tuple {
    fn into_stages(self, stages: &mut Vec<Stage<T, R>>) {
        for_tuples!( #( self.Tuple.into_stages(stages); )* );
    }
}
