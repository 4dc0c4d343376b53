use bon::Builder;

use super::error::InvalidSelector;
use super::{MethodDescriptor, MethodName};

/// Identifies the method a configuration call targets.
///
/// Exactly one of [`method_name`](Self::method_name) or [`method`](Self::method) must be set.
/// Plain strings and descriptors convert into a selector directly, so most callers never build one
/// by hand.
///
/// ```ignore
/// let selector = MethodSelector::builder()
///     .method_name("/demo.Echo/Echo")
///     .build();
/// router.pipe(selector, map(|s: String| s.to_uppercase()))?;
/// ```
#[derive(Debug, Clone, Default, Builder)]
pub struct MethodSelector {
    /// Verbatim method name. An empty name counts as absent.
    #[builder(into)]
    pub method_name: Option<String>,

    /// Schema descriptor, resolved to `/{service_full_name}/{method}`.
    pub method: Option<MethodDescriptor>,
}

impl MethodSelector {
    /// Resolve the selector into the method name it identifies.
    pub fn resolve(&self) -> Result<MethodName, InvalidSelector> {
        let method_name = self.method_name.as_deref().filter(|name| !name.is_empty());

        match (method_name, &self.method) {
            (Some(name), None) => Ok(MethodName::from(name)),
            (None, Some(descriptor)) => Ok(descriptor.full_path()),
            (Some(name), Some(descriptor)) => Err(InvalidSelector::Ambiguous {
                method_name: name.to_string(),
                descriptor_path: descriptor.full_path().to_string(),
            }),
            (None, None) => Err(InvalidSelector::Missing),
        }
    }
}

impl From<&str> for MethodSelector {
    fn from(name: &str) -> Self {
        Self {
            method_name: Some(name.to_string()),
            method: None,
        }
    }
}

impl From<String> for MethodSelector {
    fn from(name: String) -> Self {
        Self {
            method_name: Some(name),
            method: None,
        }
    }
}

impl From<&MethodName> for MethodSelector {
    fn from(name: &MethodName) -> Self {
        Self::from(name.as_str())
    }
}

impl From<MethodName> for MethodSelector {
    fn from(name: MethodName) -> Self {
        Self::from(&name)
    }
}

impl From<MethodDescriptor> for MethodSelector {
    fn from(method: MethodDescriptor) -> Self {
        Self {
            method_name: None,
            method: Some(method),
        }
    }
}

impl From<&MethodDescriptor> for MethodSelector {
    fn from(method: &MethodDescriptor) -> Self {
        Self::from(method.clone())
    }
}
