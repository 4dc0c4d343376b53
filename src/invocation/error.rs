use super::InvocationId;

/// Indicates that the result of an invocation was read before it completed.
#[derive(Debug, thiserror::Error)]
#[error("invocation {invocation} has not completed yet")]
pub struct NotReady {
    pub invocation: InvocationId,
}
