use bon::Builder;

/// Configuration for the invocation router.
#[derive(Debug, Clone, Builder)]
pub struct RouterConfig {
    /// Number of threads in the pool shared by every method.
    #[builder(default = 4)]
    pub max_workers: usize,

    /// Capacity of the shared pool's job queue.
    #[builder(default = 256)]
    pub pool_queue_capacity: usize,

    /// Per-method bound on invocations waiting to run, and on invocations buffered before the
    /// router subscribes.
    #[builder(default = 1024)]
    pub method_queue_capacity: usize,

    /// Prefix for worker thread names (e.g., "echo").
    /// Defaults to "invocation" if not specified.
    #[builder(into)]
    pub thread_name_prefix: Option<String>,
}

impl RouterConfig {
    /// Get the thread name prefix, defaulting to "invocation".
    pub fn thread_name_prefix(&self) -> &str {
        self.thread_name_prefix.as_deref().unwrap_or("invocation")
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
