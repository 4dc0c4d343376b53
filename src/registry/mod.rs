use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tonic::Status;
use tracing::{debug, info, warn};

pub use self::error::{AlreadySubscribed, UnknownMethod};
pub use self::stream::{Execution, MethodStream};
use crate::invocation::{Invocation, Payload, Reply};
use crate::method::{MethodName, Schema};

pub mod error;
pub mod stream;

/// The publish side of a method stream: receives every invocation published for a method.
///
/// The scheduler's consumer is one subscriber; additional subscribers may observe the stream, but
/// only the consumer executes invocations.
pub trait Subscriber<T, R>: Send + Sync {
    fn on_next(&self, invocation: Invocation<T, R>);
}

/// The result of publishing one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// Number of subscribers the invocation was handed to.
    pub subscribers: usize,
    /// Whether the invocation was held back until the method's consumer is bound.
    pub buffered: bool,
    /// Whether the invocation was rejected because the backlog was full.
    pub rejected: bool,
}

struct MethodSlot<T, R> {
    current: MethodStream<T, R>,
    /// The stream the scheduler will bind; `None` once the method is subscribed.
    pending: Option<MethodStream<T, R>>,
    subscribers: Vec<Arc<dyn Subscriber<T, R>>>,
    backlog: VecDeque<Invocation<T, R>>,
}

/// The fixed set of method streams of one router.
///
/// Each method name maps to its current [`MethodStream`] and the list of subscribers invocations
/// are published to. The method set is read from the [`Schema`] at construction and never changes
/// afterwards.
///
/// Until a method's consumer is bound, published invocations are buffered (up to
/// `backlog_capacity` per method) and delivered to the consumer in order once it is bound.
pub struct MethodRegistry<T, R> {
    slots: DashMap<MethodName, MethodSlot<T, R>, ahash::RandomState>,
    backlog_capacity: usize,
}

impl<T: Payload, R: Reply> MethodRegistry<T, R> {
    /// Create one empty stream per method named by `schema`.
    pub fn new<S: Schema + ?Sized>(schema: &S, backlog_capacity: usize) -> Self {
        let slots = DashMap::default();

        for method in schema.method_names() {
            let stream = MethodStream::new(method.clone());
            slots.insert(
                method,
                MethodSlot {
                    current: stream.clone(),
                    pending: Some(stream),
                    subscribers: Vec::new(),
                    backlog: VecDeque::new(),
                },
            );
        }

        info!(methods = slots.len(), "Method registry created");

        Self {
            slots,
            backlog_capacity,
        }
    }

    /// All method names, sorted.
    pub fn method_names(&self) -> Vec<MethodName> {
        let mut names: Vec<_> = self.slots.iter().map(|slot| slot.key().clone()).collect();
        names.sort();
        names
    }

    pub fn contains(&self, method: &str) -> bool {
        self.slots.contains_key(method)
    }

    /// Whether the consumer of `method` has been bound.
    pub fn is_subscribed(&self, method: &str) -> Result<bool, UnknownMethod> {
        self.slots
            .view(method, |_, slot| slot.pending.is_none())
            .ok_or_else(|| unknown(method))
    }

    /// Publish `invocation` to every subscriber of `method`, in subscription order.
    ///
    /// While the method's consumer is not yet bound the invocation is also buffered for it. If
    /// that backlog is full the invocation completes with [`Status::resource_exhausted`] and is
    /// not delivered to any subscriber.
    pub fn publish(
        &self,
        method: &str,
        invocation: Invocation<T, R>,
    ) -> Result<Delivery, UnknownMethod> {
        let (subscribers, buffered, overflowed) = {
            let mut slot = self.slots.get_mut(method).ok_or_else(|| unknown(method))?;

            let buffered = slot.pending.is_some();
            let overflowed = buffered && slot.backlog.len() >= self.backlog_capacity;
            if buffered && !overflowed {
                slot.backlog.push_back(invocation.clone());
            }

            (slot.subscribers.clone(), buffered, overflowed)
        };

        if overflowed {
            warn!(
                method = %method,
                invocation = %invocation.id(),
                capacity = self.backlog_capacity,
                "Backlog full before subscription, rejecting invocation"
            );
            invocation.discard(Status::resource_exhausted(format!(
                "backlog of '{method}' is full"
            )));
            return Ok(Delivery {
                subscribers: 0,
                buffered: false,
                rejected: true,
            });
        }

        debug!(
            method = %method,
            invocation = %invocation.id(),
            subscribers = subscribers.len(),
            buffered,
            "Publishing invocation"
        );

        for subscriber in &subscribers {
            subscriber.on_next(invocation.clone());
        }

        Ok(Delivery {
            subscribers: subscribers.len(),
            buffered,
            rejected: false,
        })
    }

    /// Register an additional subscriber that observes every invocation published for `method`.
    pub fn subscribe(
        &self,
        method: &str,
        subscriber: Arc<dyn Subscriber<T, R>>,
    ) -> Result<(), UnknownMethod> {
        let mut slot = self.slots.get_mut(method).ok_or_else(|| unknown(method))?;
        slot.subscribers.push(subscriber);
        Ok(())
    }

    /// The current stream of `method`.
    pub fn get_stream(&self, method: &str) -> Result<MethodStream<T, R>, UnknownMethod> {
        self.slots
            .view(method, |_, slot| slot.current.clone())
            .ok_or_else(|| unknown(method))
    }

    /// Replace the stream of `method`; it will be executed on a dedicated worker.
    ///
    /// Fails once the method's consumer has been bound.
    pub fn set_stream(
        &self,
        method: &str,
        stream: MethodStream<T, R>,
    ) -> Result<(), crate::RouterError> {
        let mut slot = self.slots.get_mut(method).ok_or_else(|| unknown(method))?;

        if slot.pending.is_none() {
            return Err(AlreadySubscribed {
                method: slot.key().clone(),
            }
            .into());
        }

        let stream = stream.into_replacement(slot.key().clone());
        debug!(method = %method, stages = stream.stages().len(), "Replacing method stream");

        slot.current = stream.clone();
        slot.pending = Some(stream);
        Ok(())
    }

    /// Bind a consumer to every method that does not have one yet.
    ///
    /// `bind` turns the pending stream of a method into its consumer. The consumer receives the
    /// buffered backlog in order before any later invocation, and is then registered as a
    /// subscriber. Neither `bind` nor the flush runs under a map lock. A failing `bind` leaves
    /// that method pending and stops the pass; methods bound so far stay bound.
    ///
    /// Callers serialize this with [`set_stream`](Self::set_stream).
    pub(crate) fn bind_pending<F, E>(&self, mut bind: F) -> Result<Vec<MethodName>, E>
    where
        F: FnMut(&MethodName, MethodStream<T, R>) -> Result<Arc<dyn Subscriber<T, R>>, E>,
    {
        let pending: Vec<_> = self
            .slots
            .iter()
            .filter_map(|slot| {
                let stream = slot.pending.clone()?;
                Some((slot.key().clone(), stream))
            })
            .collect();

        let mut bound = Vec::new();
        for (method, stream) in pending {
            let consumer = bind(&method, stream)?;
            if self.attach(&method, consumer) {
                bound.push(method);
            }
        }

        bound.sort();
        Ok(bound)
    }

    /// Flush the backlog of `method` to `consumer`, then register it as the method's consumer.
    ///
    /// The method stays pending while a flushed batch is delivered, so invocations published in
    /// the meantime land in the backlog and go out in the next batch. Returns `false` if the method
    /// was bound by someone else first.
    fn attach(&self, method: &MethodName, consumer: Arc<dyn Subscriber<T, R>>) -> bool {
        let mut flushed = 0;

        loop {
            let batch = {
                let Some(mut slot) = self.slots.get_mut(method.as_str()) else {
                    return false;
                };
                if slot.pending.is_none() {
                    debug!(method = %method, "Method already bound, dropping new consumer");
                    return false;
                }

                if slot.backlog.is_empty() {
                    slot.pending = None;
                    slot.subscribers.push(consumer);
                    break;
                }
                std::mem::take(&mut slot.backlog)
            };

            flushed += batch.len();
            for invocation in batch {
                consumer.on_next(invocation);
            }
        }

        if flushed > 0 {
            debug!(method = %method, flushed, "Flushed backlog to consumer");
        }
        true
    }

    /// Drop every invocation still buffered for an unbound method.
    ///
    /// Returns the number of invocations released.
    pub(crate) fn release_backlogs(&self) -> usize {
        let mut released = Vec::new();
        for mut slot in self.slots.iter_mut() {
            released.extend(slot.backlog.drain(..));
        }

        // Dropped outside the map locks since dropping may fire completion callbacks.
        let count = released.len();
        drop(released);
        count
    }
}

impl<T, R> fmt::Debug for MethodRegistry<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.slots.len())
            .field("backlog_capacity", &self.backlog_capacity)
            .finish()
    }
}

fn unknown(method: &str) -> UnknownMethod {
    UnknownMethod {
        method: method.to_string(),
    }
}
