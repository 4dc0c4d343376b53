//! Built-in pipeline stages.

use std::sync::Arc;

use bytes::Bytes;
use tonic::Status;
use tracing::{debug, warn};

use super::Stage;
use crate::invocation::{Invocation, Payload, Reply};

/// Transform the input of every invocation with `transformer`.
pub fn map<T, R>(transformer: impl Fn(T) -> T + Send + Sync + 'static) -> Stage<T, R>
where
    T: Payload,
    R: Reply,
{
    let transformer = Arc::new(transformer);
    Stage::named("map", move |invocation: Invocation<T, R>| {
        let transformer = Arc::clone(&transformer);
        Some(invocation.map(move |input| transformer(input)))
    })
}

/// Drop invocations whose input does not satisfy `predicate`.
///
/// Dropped invocations never run; their callers complete with [`Status::failed_precondition`].
pub fn filter<T, R>(predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Stage<T, R>
where
    T: Payload,
    R: Reply,
{
    Stage::named("filter", move |invocation: Invocation<T, R>| {
        if predicate(&invocation.input()) {
            return Some(invocation);
        }

        debug!(
            invocation = %invocation.id(),
            method = %invocation.method(),
            "Invocation filtered out of pipeline"
        );
        invocation.discard(Status::failed_precondition(format!(
            "call to '{}' was rejected by a pipeline filter",
            invocation.method()
        )));
        None
    })
}

/// Observe every invocation without altering it.
pub fn inspect<T, R>(observer: impl Fn(&Invocation<T, R>) + Send + Sync + 'static) -> Stage<T, R>
where
    T: Payload,
    R: Reply,
{
    Stage::named("inspect", move |invocation: Invocation<T, R>| {
        observer(&invocation);
        Some(invocation)
    })
}

/// Transform encoded protobuf payloads as messages of type `M`.
///
/// Payloads that fail to decode pass through unchanged so the work function reports the decode
/// failure itself.
pub fn map_message<M, R>(transformer: impl Fn(M) -> M + Send + Sync + 'static) -> Stage<Bytes, R>
where
    M: prost::Message + Default + 'static,
    R: Reply,
{
    map(move |payload: Bytes| match M::decode(payload.clone()) {
        Ok(message) => Bytes::from(transformer(message).encode_to_vec()),
        Err(e) => {
            warn!(error = %e, "Failed to decode payload for transform, passing through");
            payload
        }
    })
}

/// Drop encoded protobuf payloads whose decoded message of type `M` fails `predicate`.
///
/// Payloads that fail to decode are kept so the work function reports the decode failure itself.
pub fn filter_message<M, R>(
    predicate: impl Fn(&M) -> bool + Send + Sync + 'static,
) -> Stage<Bytes, R>
where
    M: prost::Message + Default + 'static,
    R: Reply,
{
    filter(move |payload: &Bytes| match M::decode(payload.clone()) {
        Ok(message) => predicate(&message),
        Err(_) => true,
    })
}
