//! Error types for storage plugin operations.

use shelf_types::BackendKind;

/// Errors a plugin can return from its synchronous queries.
///
/// Per-request job failures are not errors: they are reported through the
/// [`ProgressManager`](crate::ProgressManager).
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// The remote system behind the backend could not be reached.
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// The backend does not implement the operation for its kind.
    #[error("{operation} is not supported by {kind} backends")]
    Unsupported {
        /// Kind of the backend that was asked.
        kind: BackendKind,
        /// Name of the operation.
        operation: &'static str,
    },

    /// An I/O error occurred.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
