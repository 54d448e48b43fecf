//! [`ShelfEngine`]: dispatch, job execution and outcome tracking.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use shelf_registry::{BackendRegistry, RegistryError};
use shelf_store::{ProgressEvent, ProgressManager, StoragePlugin};
use shelf_types::events::EventBus;
use shelf_types::{
    AvailabilityStatus, BackendConfig, Checksum, DeletionRequest, FileRequest, PendingRequest,
    RequestId, RequestKind, RequestOutcome, RestorationRequest, StorageRequest, WorkingSubset,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::availability::{AvailabilityResolver, DEFAULT_MAX_BULK_SIZE};
use crate::dispatch::{DispatchPlan, Dispatcher};
use crate::error::EngineError;
use crate::progress::{DEFAULT_OUTCOME_CAPACITY, ProgressHandler, RequestCounts};

/// Tunables of a [`ShelfEngine`].
#[derive(Debug, Clone)]
pub struct ShelfEngineConfig {
    /// How long a restored copy stays in the cache.
    pub cache_ttl: Duration,
    /// Upper bound on checksums per availability request.
    pub max_bulk_size: usize,
    /// Settled outcomes kept for [`ShelfEngine::outcome`] lookups.
    pub outcome_capacity: usize,
}

impl Default for ShelfEngineConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(86_400),
            max_bulk_size: DEFAULT_MAX_BULK_SIZE,
            outcome_capacity: DEFAULT_OUTCOME_CAPACITY,
        }
    }
}

/// A backend together with its request activity.
#[derive(Debug, Clone)]
pub struct BackendOverview {
    /// Registered configuration, usage included.
    pub config: BackendConfig,
    /// Storage requests on this backend.
    pub storage: RequestCounts,
    /// Deletion requests on this backend.
    pub deletion: RequestCounts,
    /// Restoration requests from this backend.
    pub restoration: RequestCounts,
    /// Whether the plugin lets files be physically removed.
    pub allow_physical_deletion: bool,
}

impl BackendOverview {
    /// Whether any request is still running on the backend.
    pub fn is_busy(&self) -> bool {
        self.storage.pending + self.deletion.pending + self.restoration.pending > 0
    }
}

/// What [`ShelfEngine::submit`] started.
#[derive(Debug)]
pub struct Submission {
    /// Every request of the batch, in submission order.
    pub request_ids: Vec<RequestId>,
    /// Requests a plugin refused before any job started.
    pub rejected: Vec<RequestId>,
    /// One handle per spawned job.
    pub jobs: Vec<JoinHandle<()>>,
}

impl Submission {
    /// Wait for every spawned job to return.
    ///
    /// Outcomes may still be in flight to the progress handler afterwards;
    /// use [`ShelfEngine::await_outcomes`] to wait for them.
    pub async fn join(self) -> Vec<RequestId> {
        for job in self.jobs {
            if let Err(e) = job.await {
                warn!(error = %e, "job task failed");
            }
        }
        self.request_ids
    }
}

/// Orchestrates backend jobs over a [`BackendRegistry`].
///
/// Must be created inside a tokio runtime: the progress receiver loop is
/// spawned on construction.
pub struct ShelfEngine {
    registry: Arc<BackendRegistry>,
    dispatcher: Dispatcher,
    resolver: AvailabilityResolver,
    progress: Arc<ProgressHandler>,
    progress_tx: mpsc::UnboundedSender<ProgressEvent>,
    events: EventBus,
    next_request: AtomicU64,
}

impl ShelfEngine {
    /// Create an engine and start its progress receiver loop.
    pub fn new(registry: Arc<BackendRegistry>, events: EventBus, config: ShelfEngineConfig) -> Self {
        let progress = Arc::new(
            ProgressHandler::new(registry.meta().clone(), events.clone(), config.cache_ttl)
                .with_capacity(config.outcome_capacity),
        );
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        progress.spawn(progress_rx);

        Self {
            dispatcher: Dispatcher::new(registry.clone()),
            resolver: AvailabilityResolver::new(
                registry.clone(),
                events.clone(),
                config.max_bulk_size,
            ),
            registry,
            progress,
            progress_tx,
            events,
            next_request: AtomicU64::new(1),
        }
    }

    /// The backend registry.
    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    /// The event bus outcomes are published on.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The progress handler applying job outcomes.
    pub fn progress(&self) -> &Arc<ProgressHandler> {
        &self.progress
    }

    /// Allocate a fresh request id.
    pub fn next_request_id(&self) -> RequestId {
        RequestId::new(self.next_request.fetch_add(1, Ordering::Relaxed))
    }

    /// Partition `batch` into working subsets without running anything.
    pub fn dispatch(&self, batch: Vec<FileRequest>) -> Result<DispatchPlan, EngineError> {
        self.dispatcher.dispatch(batch)
    }

    /// Dispatch `batch` and spawn one job per working subset.
    ///
    /// Fails without side effects when the batch does not validate.
    /// Requests a plugin refuses during preparation settle as failures
    /// straight away.
    ///
    /// A request whose last attempt failed may be submitted again under the
    /// same id; the new job is a fresh attempt.
    pub fn submit(&self, batch: Vec<FileRequest>) -> Result<Submission, EngineError> {
        self.launch(batch, false)
    }

    fn launch(&self, batch: Vec<FileRequest>, force: bool) -> Result<Submission, EngineError> {
        let request_ids: Vec<RequestId> = batch.iter().map(FileRequest::id).collect();
        let mut requests: HashMap<RequestId, FileRequest> =
            batch.iter().map(|r| (r.id(), r.clone())).collect();
        let plan = self.dispatcher.dispatch(batch)?;

        let DispatchPlan {
            storage,
            deletion,
            restoration,
            rejected,
            plugins,
        } = plan;

        let rejected = rejected
            .iter()
            .map(|rejection| {
                self.progress.reject(rejection);
                rejection.request.id()
            })
            .collect();

        let mut jobs = Vec::new();
        for subset in storage {
            if let Some(plugin) = plugins.get(subset.backend_label()).cloned() {
                self.track(&subset, &mut requests, force);
                let progress = self.manager_for(subset.backend_label());
                jobs.push(tokio::spawn(run_storage_job(plugin, subset, progress)));
            }
        }
        for subset in deletion {
            if let Some(plugin) = plugins.get(subset.backend_label()).cloned() {
                self.track(&subset, &mut requests, force);
                let progress = self.manager_for(subset.backend_label());
                jobs.push(tokio::spawn(run_deletion_job(plugin, subset, progress)));
            }
        }
        for subset in restoration {
            if let Some(plugin) = plugins.get(subset.backend_label()).cloned() {
                self.track(&subset, &mut requests, force);
                let progress = self.manager_for(subset.backend_label());
                jobs.push(tokio::spawn(run_restoration_job(plugin, subset, progress)));
            }
        }

        info!(requests = request_ids.len(), jobs = jobs.len(), "batch submitted");
        Ok(Submission {
            request_ids,
            rejected,
            jobs,
        })
    }

    /// Outcome of `request`, if it has settled.
    pub fn outcome(&self, request: RequestId) -> Option<RequestOutcome> {
        self.progress.outcome(request)
    }

    /// Wait up to `timeout` for every request in `ids` to settle.
    pub async fn await_outcomes(
        &self,
        ids: &[RequestId],
        timeout: Duration,
    ) -> Vec<RequestOutcome> {
        self.progress.wait_for(ids, timeout).await
    }

    /// Resolve whether `checksums` can be read right now.
    pub async fn check_availability(
        &self,
        checksums: &[Checksum],
    ) -> Result<Vec<AvailabilityStatus>, EngineError> {
        self.resolver.check(checksums).await
    }

    /// Backend `label` with its request activity.
    pub fn overview(&self, label: &str) -> Result<BackendOverview, EngineError> {
        let config = self
            .registry
            .get_by_label(label)
            .ok_or_else(|| RegistryError::NotFound(label.to_string()))?;
        Ok(self.overview_of(config))
    }

    /// Every backend with its request activity, in tier and priority order.
    pub fn overviews(&self) -> Vec<BackendOverview> {
        self.registry
            .list_all()
            .into_iter()
            .map(|config| self.overview_of(config))
            .collect()
    }

    /// Delete every file referenced on backend `label`.
    ///
    /// With `force`, a file whose physical deletion fails loses its
    /// reference anyway.
    pub fn delete_files(&self, label: &str, force: bool) -> Result<Submission, EngineError> {
        if self.registry.get_by_label(label).is_none() {
            return Err(RegistryError::NotFound(label.to_string()).into());
        }
        let batch: Vec<FileRequest> = self
            .registry
            .meta()
            .list_files()?
            .into_iter()
            .filter(|file| file.backend_label == label)
            .map(|reference| {
                FileRequest::Delete(DeletionRequest {
                    id: self.next_request_id(),
                    reference,
                })
            })
            .collect();
        info!(backend = %label, files = batch.len(), force, "deleting all files of backend");
        self.launch(batch, force)
    }

    /// Submit again every failed `kind` request of backend `label`.
    ///
    /// Only storage and deletion requests can be retried.
    pub fn retry_errors(&self, label: &str, kind: RequestKind) -> Result<Submission, EngineError> {
        if kind == RequestKind::Restoration {
            return Err(EngineError::RetryForbidden(kind));
        }
        let batch = self.progress.failed_requests(label, kind);
        info!(backend = %label, %kind, requests = batch.len(), "retrying failed requests");
        self.launch(batch, false)
    }

    /// Drop every failed `kind` request of backend `label` without retrying.
    pub fn discard_errors(&self, label: &str, kind: RequestKind) -> usize {
        self.progress.discard_failures(label, kind)
    }

    fn overview_of(&self, config: BackendConfig) -> BackendOverview {
        let label = config.label.as_str();
        BackendOverview {
            storage: self.progress.counts(label, RequestKind::Storage),
            deletion: self.progress.counts(label, RequestKind::Deletion),
            restoration: self.progress.counts(label, RequestKind::Restoration),
            allow_physical_deletion: self.registry.allow_physical_deletion(label),
            config,
        }
    }

    fn track<R: PendingRequest>(
        &self,
        subset: &WorkingSubset<R>,
        requests: &mut HashMap<RequestId, FileRequest>,
        force: bool,
    ) {
        for id in subset.ids() {
            if let Some(request) = requests.remove(&id) {
                self.progress.track(request, subset.backend_label(), force);
            }
        }
    }

    fn manager_for(&self, label: &str) -> ProgressManager {
        ProgressManager::new(label, self.progress_tx.clone())
    }
}

impl std::fmt::Debug for ShelfEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShelfEngine")
            .field("registry", &self.registry)
            .field("progress", &self.progress)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[tracing::instrument(name = "storage_job", skip_all, fields(backend = %subset.backend_label(), requests = subset.len()))]
async fn run_storage_job(
    plugin: Arc<dyn StoragePlugin>,
    subset: WorkingSubset<StorageRequest>,
    progress: ProgressManager,
) {
    let ids = subset.ids();
    plugin.store(subset, progress.clone()).await;
    warn_unreported(&ids, &progress);
}

#[tracing::instrument(name = "deletion_job", skip_all, fields(backend = %subset.backend_label(), requests = subset.len()))]
async fn run_deletion_job(
    plugin: Arc<dyn StoragePlugin>,
    subset: WorkingSubset<DeletionRequest>,
    progress: ProgressManager,
) {
    let ids = subset.ids();
    plugin.delete(subset, progress.clone()).await;
    warn_unreported(&ids, &progress);
}

#[tracing::instrument(name = "restoration_job", skip_all, fields(backend = %subset.backend_label(), requests = subset.len()))]
async fn run_restoration_job(
    plugin: Arc<dyn StoragePlugin>,
    subset: WorkingSubset<RestorationRequest>,
    progress: ProgressManager,
) {
    let ids = subset.ids();
    plugin.retrieve(subset, progress.clone()).await;
    warn_unreported(&ids, &progress);
}

/// Requests a job returned without reporting stay unresolved.
fn warn_unreported(ids: &[RequestId], progress: &ProgressManager) {
    let missing: Vec<RequestId> = ids
        .iter()
        .copied()
        .filter(|id| !progress.is_reported(*id))
        .collect();
    if !missing.is_empty() {
        warn!(
            backend = %progress.backend_label(),
            missing = ?missing,
            "job returned without reporting every request"
        );
    }
}
