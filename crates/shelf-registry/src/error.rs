//! Error types for the registry crate.

use shelf_types::BackendKind;

/// Errors produced by registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No backend matches the given id or label.
    #[error("backend not found: {0}")]
    NotFound(String),

    /// Another backend already uses this label.
    #[error("a backend labelled {0:?} already exists")]
    DuplicateLabel(String),

    /// The plugin does not implement the kind the backend declares.
    #[error("backend {label:?} is declared {declared} but its plugin is {actual}")]
    CapabilityMismatch {
        /// Label of the backend.
        label: String,
        /// Kind given at registration.
        declared: BackendKind,
        /// Kind reported by the plugin.
        actual: BackendKind,
    },

    /// The supplied configuration is not acceptable.
    #[error("invalid backend configuration: {0}")]
    InvalidConfiguration(String),

    /// The operation is refused in the backend's current state.
    #[error("operation forbidden on backend {label:?}: {reason}")]
    Forbidden {
        /// Label of the backend.
        label: String,
        /// Why the operation was refused.
        reason: String,
    },

    /// An error from the metadata store.
    #[error("meta store error: {0}")]
    Meta(#[from] shelf_meta::MetaError),
}
