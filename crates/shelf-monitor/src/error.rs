//! Error types for capacity monitoring.

/// Errors that can occur during a monitor run.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    /// Failed to access the metadata store.
    #[error("metadata error: {0}")]
    Meta(#[from] shelf_meta::MetaError),

    /// Failed to record usage in the registry.
    #[error("registry error: {0}")]
    Registry(#[from] shelf_registry::RegistryError),

    /// The scope source could not list active scopes.
    #[error("cannot list active scopes: {0}")]
    Scopes(String),

    /// A run for this scope is already in progress.
    #[error("monitor run already in progress for scope {0}")]
    AlreadyRunning(String),

    /// Warning and critical percentages are inconsistent.
    #[error("invalid thresholds: warning {warning}% must be positive and not above critical {critical}%")]
    InvalidThresholds {
        /// Requested warning percentage.
        warning: u32,
        /// Requested critical percentage.
        critical: u32,
    },
}
