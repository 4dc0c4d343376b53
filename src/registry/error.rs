use crate::method::MethodName;

/// Indicates that an operation referenced a method that is not part of the fixed method set.
#[derive(Debug, thiserror::Error)]
#[error("method '{method}' is not registered")]
pub struct UnknownMethod {
    pub method: String,
}

/// Indicates that a method's stream was replaced after its consumer was bound.
#[derive(Debug, thiserror::Error)]
#[error("method '{method}' is already subscribed, its stream can no longer be replaced")]
pub struct AlreadySubscribed {
    pub method: MethodName,
}
