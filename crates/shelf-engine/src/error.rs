//! Error types for the engine.

use shelf_types::{Checksum, RequestId, RequestKind};

/// Errors that can occur during engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Failed to access the metadata store.
    #[error("metadata error: {0}")]
    Meta(#[from] shelf_meta::MetaError),

    /// A registry operation failed.
    #[error("registry error: {0}")]
    Registry(#[from] shelf_registry::RegistryError),

    /// A request names a backend that is not registered.
    #[error("{request} targets unknown backend {label:?}")]
    UnknownBackend {
        /// The offending request.
        request: RequestId,
        /// Label it names.
        label: String,
    },

    /// A storage request targets a backend that accepts no new files.
    #[error("{request} targets inactive backend {label:?}")]
    InactiveBackend {
        /// The offending request.
        request: RequestId,
        /// Label it names.
        label: String,
    },

    /// No plugin is bound to the backend a request needs.
    #[error("{request} needs backend {label:?}, which has no plugin attached")]
    PluginUnavailable {
        /// The offending request.
        request: RequestId,
        /// Label of the backend.
        label: String,
    },

    /// A nearline backend could not answer an availability check.
    #[error("availability check for {checksum} on {backend:?} failed: {source}")]
    RemoteCheck {
        /// File being checked.
        checksum: Checksum,
        /// Backend that was asked.
        backend: String,
        /// Plugin error.
        #[source]
        source: shelf_store::PluginError,
    },

    /// Failed requests of this kind cannot be retried.
    #[error("retry of {0} requests is not supported")]
    RetryForbidden(RequestKind),

    /// The request itself is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}
