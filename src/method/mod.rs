use std::borrow::Borrow;
use std::fmt::{self, Display};
use std::sync::Arc;

pub use self::error::InvalidSelector;
pub use self::selector::MethodSelector;

pub mod error;
pub mod selector;

/// The fully resolved name of an RPC method endpoint.
///
/// Names resolved from a [`MethodDescriptor`] take the form `/{service_full_name}/{method}`, but
/// any verbatim string is accepted so callers can key methods however their transport does.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct MethodName(Arc<str>);

impl MethodName {
    /// Create a new [`MethodName`] from any type that can be converted into an `Arc<str>`.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    /// Returns the underlying string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for MethodName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Borrow<str> for MethodName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<String> for MethodName {
    fn from(s: String) -> Self {
        Self(s.into())
    }
}

impl From<&str> for MethodName {
    fn from(s: &str) -> Self {
        Self(s.into())
    }
}

/// Schema-level description of a single method.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct MethodDescriptor {
    service_full_name: Arc<str>,
    name: Arc<str>,
}

impl MethodDescriptor {
    pub fn new(service_full_name: impl Into<Arc<str>>, name: impl Into<Arc<str>>) -> Self {
        Self {
            service_full_name: service_full_name.into(),
            name: name.into(),
        }
    }

    pub fn service_full_name(&self) -> &str {
        &self.service_full_name
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The routable path of this method: `/{service_full_name}/{name}`.
    pub fn full_path(&self) -> MethodName {
        MethodName::from(format!("/{}/{}", self.service_full_name, self.name))
    }
}

/// Schema-level description of a service and the methods it exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    full_name: Arc<str>,
    methods: Vec<Arc<str>>,
}

impl ServiceDescriptor {
    pub fn new<I, S>(full_name: impl Into<Arc<str>>, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Arc<str>>,
    {
        Self {
            full_name: full_name.into(),
            methods: methods.into_iter().map(Into::into).collect(),
        }
    }

    /// Describe a tonic service by its generated [`NamedService::NAME`](tonic::server::NamedService).
    pub fn for_service<S, I, M>(methods: I) -> Self
    where
        S: tonic::server::NamedService,
        I: IntoIterator<Item = M>,
        M: Into<Arc<str>>,
    {
        Self::new(S::NAME, methods)
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn methods(&self) -> impl Iterator<Item = MethodDescriptor> + '_ {
        self.methods
            .iter()
            .map(|method| MethodDescriptor::new(Arc::clone(&self.full_name), Arc::clone(method)))
    }

    /// Look up a method of this service by its short name.
    pub fn method(&self, name: &str) -> Option<MethodDescriptor> {
        self.methods().find(|method| method.name() == name)
    }
}

/// The external interface definition capability: enumerate the method names a server exposes.
///
/// The router reads this exactly once at construction; the resulting set of methods never changes.
pub trait Schema {
    fn method_names(&self) -> Vec<MethodName>;
}

impl Schema for ServiceDescriptor {
    fn method_names(&self) -> Vec<MethodName> {
        self.methods().map(|method| method.full_path()).collect()
    }
}

impl Schema for [ServiceDescriptor] {
    fn method_names(&self) -> Vec<MethodName> {
        self.iter().flat_map(Schema::method_names).collect()
    }
}

impl Schema for Vec<ServiceDescriptor> {
    fn method_names(&self) -> Vec<MethodName> {
        self.as_slice().method_names()
    }
}

impl Schema for [&str] {
    fn method_names(&self) -> Vec<MethodName> {
        self.iter().copied().map(MethodName::from).collect()
    }
}

impl<const N: usize> Schema for [&str; N] {
    fn method_names(&self) -> Vec<MethodName> {
        self.as_slice().method_names()
    }
}

impl Schema for Vec<MethodName> {
    fn method_names(&self) -> Vec<MethodName> {
        self.clone()
    }
}
