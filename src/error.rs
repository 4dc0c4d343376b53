use thiserror::Error;
use tonic::Status;

use crate::invocation::NotReady;
use crate::method::InvalidSelector;
use crate::registry::{AlreadySubscribed, UnknownMethod};
use crate::scheduler::PoolClosed;

/// Errors surfaced by the router's configuration and dispatch operations.
///
/// All of these are contract violations reported synchronously at the point of misuse. Failures
/// of individual calls are never reported here; they are the [`Outcome`](crate::Outcome) of the
/// call.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Both or neither of a method name and a method descriptor were supplied.
    #[error("invalid method selector")]
    InvalidArgument(#[from] InvalidSelector),

    /// The method is not part of the router's fixed method set.
    #[error(transparent)]
    UnknownMethod(#[from] UnknownMethod),

    /// A pipeline or stream was replaced after the router subscribed.
    #[error(transparent)]
    AlreadySubscribed(#[from] AlreadySubscribed),

    /// A result was read before the invocation completed.
    #[error(transparent)]
    NotReady(#[from] NotReady),

    /// Work was submitted to a worker pool that has been shut down.
    #[error(transparent)]
    PoolClosed(#[from] PoolClosed),

    /// A worker thread could not be started.
    #[error("failed to spawn worker thread")]
    WorkerSpawn(#[from] std::io::Error),
}

impl From<RouterError> for Status {
    fn from(err: RouterError) -> Self {
        let message = err.to_string();
        match err {
            RouterError::InvalidArgument(source) => {
                Status::invalid_argument(format!("{message}: {source}"))
            }
            RouterError::UnknownMethod(_) => Status::unimplemented(message),
            RouterError::AlreadySubscribed(_) => Status::failed_precondition(message),
            RouterError::NotReady(_) | RouterError::PoolClosed(_) => Status::unavailable(message),
            RouterError::WorkerSpawn(source) => {
                Status::internal(format!("{message}: {source}"))
            }
        }
    }
}
