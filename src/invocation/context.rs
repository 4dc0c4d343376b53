use std::net::SocketAddr;
use std::time::Instant;

use bon::Builder;
use tonic::metadata::MetadataMap;

use crate::method::MethodName;

/// Transport-specific context of one inbound call.
///
/// The transport layer builds one of these per call; the router only reads
/// [`method`](Self::method) to route the call and otherwise hands the context to the work function
/// untouched.
#[derive(Debug, Clone, Builder)]
pub struct CallContext {
    /// The resolved method this call targets.
    #[builder(into)]
    method: MethodName,

    /// Request metadata (headers and any extra per-call arguments the transport forwards).
    #[builder(default)]
    metadata: MetadataMap,

    remote_addr: Option<SocketAddr>,

    #[builder(default = Instant::now())]
    received_at: Instant,
}

impl CallContext {
    /// Context for a call with no metadata or peer information.
    pub fn new(method: impl Into<MethodName>) -> Self {
        Self::builder().method(method).build()
    }

    pub fn method(&self) -> &MethodName {
        &self.method
    }

    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }
}
