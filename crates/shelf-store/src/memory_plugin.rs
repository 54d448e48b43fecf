//! In-memory storage plugin.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use shelf_types::{
    BackendConfig, BackendKind, Checksum, DeletionRequest, FileReference, RestorationRequest,
    StorageRequest, WorkingSubset,
};
use tracing::debug;

use crate::error::PluginError;
use crate::progress::ProgressManager;
use crate::traits::{ConfigurationUpdate, NearlineStatus, Preparation, StoragePlugin};

/// Storage plugin keeping only bookkeeping in memory.
///
/// Works as any [`BackendKind`]. Useful for tests and for demo deployments:
/// files can be made to fail, and a nearline instance answers availability
/// checks from a staging set the caller controls.
pub struct MemoryPlugin {
    kind: BackendKind,
    max_bytes: Option<u64>,
    /// checksum → stored size.
    objects: RwLock<HashMap<Checksum, u64>>,
    /// Nearline files currently readable, with their optional expiry.
    staged: RwLock<HashMap<Checksum, Option<u64>>>,
    failing: RwLock<HashSet<Checksum>>,
    availability_error: AtomicBool,
    availability_checks: AtomicU64,
    restore_dir: PathBuf,
}

impl MemoryPlugin {
    /// Create an unbounded plugin of the given kind.
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            max_bytes: None,
            objects: RwLock::new(HashMap::new()),
            staged: RwLock::new(HashMap::new()),
            failing: RwLock::new(HashSet::new()),
            availability_error: AtomicBool::new(false),
            availability_checks: AtomicU64::new(0),
            restore_dir: std::env::temp_dir().join("shelf-restore"),
        }
    }

    /// Refuse to hold more than `max_bytes` in total.
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    /// Directory restored copies are reported under.
    pub fn with_restore_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.restore_dir = dir.into();
        self
    }

    /// Make `checksum` readable until `expires_at` (nearline only).
    pub fn stage(&self, checksum: impl Into<Checksum>, expires_at: Option<u64>) {
        self.staged
            .write()
            .expect("lock poisoned")
            .insert(checksum.into(), expires_at);
    }

    /// Make `checksum` unreadable again.
    pub fn unstage(&self, checksum: &Checksum) {
        self.staged.write().expect("lock poisoned").remove(checksum);
    }

    /// Fail every job operation on `checksum` until cleared.
    pub fn fail_on(&self, checksum: impl Into<Checksum>) {
        self.failing
            .write()
            .expect("lock poisoned")
            .insert(checksum.into());
    }

    /// Stop injecting failures.
    pub fn clear_failures(&self) {
        self.failing.write().expect("lock poisoned").clear();
    }

    /// Make availability checks return a transport error.
    pub fn set_availability_error(&self, failing: bool) {
        self.availability_error.store(failing, Ordering::Relaxed);
    }

    /// Number of availability checks received so far.
    pub fn availability_checks(&self) -> u64 {
        self.availability_checks.load(Ordering::Relaxed)
    }

    /// Whether `checksum` is held.
    pub fn contains(&self, checksum: &Checksum) -> bool {
        self.objects
            .read()
            .expect("lock poisoned")
            .contains_key(checksum)
    }

    /// Total size of the held files.
    pub fn used_bytes(&self) -> u64 {
        self.objects.read().expect("lock poisoned").values().sum()
    }

    fn is_failing(&self, checksum: &Checksum) -> bool {
        self.failing
            .read()
            .expect("lock poisoned")
            .contains(checksum)
    }
}

#[async_trait::async_trait]
impl StoragePlugin for MemoryPlugin {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn prepare_for_storage(
        &self,
        subset: WorkingSubset<StorageRequest>,
    ) -> Preparation<StorageRequest> {
        let Some(max) = self.max_bytes else {
            return Preparation::accept_all(subset);
        };
        Preparation::screen(subset, |request| {
            (request.size_bytes > max).then(|| {
                format!(
                    "file of {} bytes exceeds backend limit of {max} bytes",
                    request.size_bytes
                )
            })
        })
    }

    async fn store(&self, subset: WorkingSubset<StorageRequest>, progress: ProgressManager) {
        for request in subset.requests() {
            if self.is_failing(&request.checksum) {
                progress.storage_failed(request, "injected failure");
                continue;
            }

            let mut objects = self.objects.write().expect("lock poisoned");
            let used: u64 = objects.values().sum();
            let existing = objects.get(&request.checksum).copied().unwrap_or(0);
            let needed = request.size_bytes.saturating_sub(existing);

            if let Some(max) = self.max_bytes.filter(|max| used + needed > *max) {
                drop(objects);
                progress.storage_failed(
                    request,
                    format!(
                        "capacity exceeded: need {needed} bytes, {} free",
                        max.saturating_sub(used)
                    ),
                );
                continue;
            }

            objects.insert(request.checksum.clone(), request.size_bytes);
            drop(objects);

            debug!(checksum = %request.checksum, size = request.size_bytes, "stored file in memory");
            let url = format!("memory://{}/{}", progress.backend_label(), request.checksum);
            progress.storage_succeed(request, url, request.size_bytes);
        }
    }

    async fn delete(&self, subset: WorkingSubset<DeletionRequest>, progress: ProgressManager) {
        for request in subset.requests() {
            let checksum = &request.reference.checksum;
            if self.is_failing(checksum) {
                progress.deletion_failed(request, "injected failure");
                continue;
            }

            // Deleting an unknown file is not an error.
            self.objects.write().expect("lock poisoned").remove(checksum);
            self.staged.write().expect("lock poisoned").remove(checksum);
            debug!(%checksum, "deleted file from memory");
            progress.deletion_succeed(request);
        }
    }

    async fn retrieve(&self, subset: WorkingSubset<RestorationRequest>, progress: ProgressManager) {
        for request in subset.requests() {
            let checksum = &request.reference.checksum;
            if self.is_failing(checksum) {
                progress.restore_failed(request, "injected failure");
                continue;
            }
            if !self.contains(checksum) {
                progress.restore_failed(request, format!("{checksum} is not stored here"));
                continue;
            }

            let path = self.restore_dir.join(checksum.as_str());
            debug!(%checksum, path = %path.display(), "restored file from memory");
            progress.restore_succeed(request, path);
        }
    }

    async fn check_availability(
        &self,
        reference: &FileReference,
    ) -> Result<NearlineStatus, PluginError> {
        self.availability_checks.fetch_add(1, Ordering::Relaxed);

        if self.kind != BackendKind::Nearline {
            return Err(PluginError::Unsupported {
                kind: self.kind,
                operation: "availability check",
            });
        }
        if self.availability_error.load(Ordering::Relaxed) {
            return Err(PluginError::Unreachable("injected availability error".into()));
        }

        let staged = self.staged.read().expect("lock poisoned");
        Ok(match staged.get(&reference.checksum) {
            Some(expires_at) => NearlineStatus::available(*expires_at),
            None => NearlineStatus::unavailable(),
        })
    }

    fn allow_configuration_update(
        &self,
        new: &BackendConfig,
        old: &BackendConfig,
        files_already_stored: bool,
    ) -> ConfigurationUpdate {
        if files_already_stored && new.settings != old.settings {
            ConfigurationUpdate::refused("settings cannot change while files are stored")
        } else {
            ConfigurationUpdate::allowed()
        }
    }
}
