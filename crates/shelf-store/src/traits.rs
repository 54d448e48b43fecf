//! Core trait and types for storage plugins.

use shelf_types::{
    BackendConfig, BackendKind, DeletionRequest, FileReference, PendingRequest, RestorationRequest,
    StorageRequest, WorkingSubset,
};

use crate::error::PluginError;
use crate::progress::ProgressManager;

/// Answer of a nearline backend about one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NearlineStatus {
    /// Whether the file can be read without a restore right now.
    pub available: bool,
    /// Unix timestamp (seconds) after which the file may stop being readable.
    pub expires_at: Option<u64>,
    /// Free-form detail from the backend.
    pub message: Option<String>,
}

impl NearlineStatus {
    /// Readable until `expires_at`.
    pub fn available(expires_at: Option<u64>) -> Self {
        Self {
            available: true,
            expires_at,
            message: None,
        }
    }

    /// Not readable without a restore.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            expires_at: None,
            message: None,
        }
    }
}

/// Answer of a plugin asked whether a configuration change is safe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationUpdate {
    /// Whether the change may be applied.
    pub allowed: bool,
    /// Why the change was refused.
    pub reason: Option<String>,
}

impl ConfigurationUpdate {
    /// The change may be applied.
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    /// The change must not be applied.
    pub fn refused(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Result of a plugin's preparation hook over one working subset.
///
/// A plugin may turn individual requests away, but it never splits a
/// subset: whatever it keeps is run as one job.
#[derive(Debug, Clone)]
pub struct Preparation<R> {
    /// Requests the plugin accepted, if any.
    pub subset: Option<WorkingSubset<R>>,
    /// Requests the plugin refused, with the reason.
    pub rejected: Vec<(R, String)>,
}

impl<R: PendingRequest> Preparation<R> {
    /// Accept every request of the subset.
    pub fn accept_all(subset: WorkingSubset<R>) -> Self {
        Self {
            subset: Some(subset),
            rejected: Vec::new(),
        }
    }

    /// Split the subset with `check`: `Some(reason)` rejects a request.
    pub fn screen(subset: WorkingSubset<R>, check: impl Fn(&R) -> Option<String>) -> Self {
        let label = subset.backend_label().to_string();
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();

        for request in subset.into_requests() {
            match check(&request) {
                Some(reason) => rejected.push((request, reason)),
                None => accepted.push(request),
            }
        }

        Self {
            subset: WorkingSubset::new(label, accepted),
            rejected,
        }
    }
}

/// Trait implemented by every storage backend.
///
/// All implementations must be `Send + Sync`: jobs run as independent tokio
/// tasks and may overlap. `store`, `delete` and `retrieve` must report
/// exactly one terminal outcome per request through the given
/// [`ProgressManager`]; they return nothing themselves.
#[async_trait::async_trait]
pub trait StoragePlugin: Send + Sync {
    /// The tier this plugin implements.
    fn kind(&self) -> BackendKind;

    /// Screen a storage subset before its job starts.
    fn prepare_for_storage(
        &self,
        subset: WorkingSubset<StorageRequest>,
    ) -> Preparation<StorageRequest> {
        Preparation::accept_all(subset)
    }

    /// Screen a deletion subset before its job starts.
    fn prepare_for_deletion(
        &self,
        subset: WorkingSubset<DeletionRequest>,
    ) -> Preparation<DeletionRequest> {
        Preparation::accept_all(subset)
    }

    /// Screen a restoration subset before its job starts.
    fn prepare_for_restoration(
        &self,
        subset: WorkingSubset<RestorationRequest>,
    ) -> Preparation<RestorationRequest> {
        Preparation::accept_all(subset)
    }

    /// Store every file of the subset.
    async fn store(&self, subset: WorkingSubset<StorageRequest>, progress: ProgressManager);

    /// Delete every file of the subset.
    async fn delete(&self, subset: WorkingSubset<DeletionRequest>, progress: ProgressManager);

    /// Copy every file of the subset to local cache storage.
    ///
    /// The default fails each request: only backends with a slow tier
    /// need to restore.
    async fn retrieve(&self, subset: WorkingSubset<RestorationRequest>, progress: ProgressManager) {
        let cause = format!("{} backends do not restore files", self.kind());
        for request in subset.requests() {
            progress.restore_failed(request, cause.clone());
        }
    }

    /// Ask a nearline backend whether a file is readable right now.
    async fn check_availability(
        &self,
        _reference: &FileReference,
    ) -> Result<NearlineStatus, PluginError> {
        Err(PluginError::Unsupported {
            kind: self.kind(),
            operation: "availability check",
        })
    }

    /// Whether `new` may replace `old` given files are already stored.
    ///
    /// The default refuses any change once files exist.
    fn allow_configuration_update(
        &self,
        _new: &BackendConfig,
        _old: &BackendConfig,
        files_already_stored: bool,
    ) -> ConfigurationUpdate {
        if files_already_stored {
            ConfigurationUpdate::refused("backend does not support reconfiguration with stored files")
        } else {
            ConfigurationUpdate::allowed()
        }
    }

    /// Whether deletion jobs physically remove data, or only forget it.
    fn allow_physical_deletion(&self) -> bool {
        true
    }
}
