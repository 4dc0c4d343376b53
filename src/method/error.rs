//! Error types for method selection.

/// Indicates that a method selector did not identify exactly one method.
///
/// A configuration call must name its method either verbatim or through a descriptor, never both
/// and never neither.
#[derive(Debug, thiserror::Error)]
pub enum InvalidSelector {
    #[error(
        "exactly one of a method name or a method descriptor is required, got both ('{method_name}' and '{descriptor_path}')"
    )]
    Ambiguous {
        method_name: String,
        descriptor_path: String,
    },

    #[error("exactly one of a method name or a method descriptor is required, got neither")]
    Missing,
}
