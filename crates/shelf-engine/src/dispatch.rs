//! Partitioning of request batches into per-backend working subsets.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use shelf_registry::BackendRegistry;
use shelf_store::{Preparation, StoragePlugin};
use shelf_types::{
    DeletionRequest, FileRequest, PendingRequest, RequestKind, RestorationRequest, StorageRequest,
    WorkingSubset,
};
use tracing::{debug, info};

use crate::error::EngineError;

/// A request a plugin turned away during preparation.
#[derive(Debug, Clone)]
pub struct Rejection {
    /// The refused request.
    pub request: FileRequest,
    /// Backend whose plugin refused it.
    pub backend_label: String,
    /// Reason given by the plugin.
    pub reason: String,
}

/// Result of dispatching one batch.
///
/// Each subset becomes exactly one job. Subsets of one kind are in ascending
/// label order; no label appears twice within a kind.
pub struct DispatchPlan {
    /// Storage subsets.
    pub storage: Vec<WorkingSubset<StorageRequest>>,
    /// Deletion subsets.
    pub deletion: Vec<WorkingSubset<DeletionRequest>>,
    /// Restoration subsets.
    pub restoration: Vec<WorkingSubset<RestorationRequest>>,
    /// Requests refused by a plugin's preparation hook.
    pub rejected: Vec<Rejection>,
    pub(crate) plugins: BTreeMap<String, Arc<dyn StoragePlugin>>,
}

impl DispatchPlan {
    /// Number of jobs the plan describes.
    pub fn job_count(&self) -> usize {
        self.storage.len() + self.deletion.len() + self.restoration.len()
    }

    /// Plugin resolved for `label` when the plan was made.
    pub fn plugin(&self, label: &str) -> Option<Arc<dyn StoragePlugin>> {
        self.plugins.get(label).cloned()
    }
}

impl std::fmt::Debug for DispatchPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchPlan")
            .field("storage", &self.storage)
            .field("deletion", &self.deletion)
            .field("restoration", &self.restoration)
            .field("rejected", &self.rejected)
            .finish()
    }
}

/// Turns request batches into working subsets.
pub struct Dispatcher {
    registry: Arc<BackendRegistry>,
}

impl Dispatcher {
    /// Create a dispatcher over `registry`.
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self { registry }
    }

    /// Partition `batch` into one subset per backend and operation.
    ///
    /// The whole batch is validated before anything is grouped: a storage
    /// request naming an unknown, inactive or plugin-less backend fails the
    /// batch, as does a deletion or restoration whose file sits on an
    /// unknown or plugin-less backend.
    pub fn dispatch(&self, batch: Vec<FileRequest>) -> Result<DispatchPlan, EngineError> {
        let mut seen = HashSet::with_capacity(batch.len());
        let mut plugins: BTreeMap<String, Arc<dyn StoragePlugin>> = BTreeMap::new();

        for request in &batch {
            if !seen.insert(request.id()) {
                return Err(EngineError::InvalidRequest(format!(
                    "{} appears more than once in the batch",
                    request.id()
                )));
            }

            let label = target_label(request);
            let Some(config) = self.registry.get_by_label(label) else {
                return Err(EngineError::UnknownBackend {
                    request: request.id(),
                    label: label.to_string(),
                });
            };
            if request.kind() == RequestKind::Storage && !config.active {
                return Err(EngineError::InactiveBackend {
                    request: request.id(),
                    label: config.label,
                });
            }
            if !plugins.contains_key(label) {
                let plugin = self.registry.plugin_for(label).ok_or_else(|| {
                    EngineError::PluginUnavailable {
                        request: request.id(),
                        label: label.to_string(),
                    }
                })?;
                plugins.insert(label.to_string(), plugin);
            }
        }

        let mut storage: BTreeMap<String, Vec<StorageRequest>> = BTreeMap::new();
        let mut deletion: BTreeMap<String, Vec<DeletionRequest>> = BTreeMap::new();
        let mut restoration: BTreeMap<String, Vec<RestorationRequest>> = BTreeMap::new();
        let total = batch.len();

        for request in batch {
            match request {
                FileRequest::Store(r) => storage.entry(r.target_backend.clone()).or_default().push(r),
                FileRequest::Delete(r) => deletion
                    .entry(r.reference.backend_label.clone())
                    .or_default()
                    .push(r),
                FileRequest::Restore(r) => restoration
                    .entry(r.reference.backend_label.clone())
                    .or_default()
                    .push(r),
            }
        }

        let mut rejected = Vec::new();
        let storage = prepare(
            storage,
            &plugins,
            &mut rejected,
            |plugin, subset| plugin.prepare_for_storage(subset),
            FileRequest::Store,
        );
        let deletion = prepare(
            deletion,
            &plugins,
            &mut rejected,
            |plugin, subset| plugin.prepare_for_deletion(subset),
            FileRequest::Delete,
        );
        let restoration = prepare(
            restoration,
            &plugins,
            &mut rejected,
            |plugin, subset| plugin.prepare_for_restoration(subset),
            FileRequest::Restore,
        );
        let plan = DispatchPlan {
            storage,
            deletion,
            restoration,
            rejected,
            plugins,
        };

        info!(
            requests = total,
            jobs = plan.job_count(),
            rejected = plan.rejected.len(),
            "batch dispatched"
        );
        Ok(plan)
    }
}

/// Backend a request must run on.
fn target_label(request: &FileRequest) -> &str {
    match request {
        FileRequest::Store(r) => &r.target_backend,
        FileRequest::Delete(r) => &r.reference.backend_label,
        FileRequest::Restore(r) => &r.reference.backend_label,
    }
}

/// Build one subset per label and run it through the plugin's hook.
fn prepare<R: PendingRequest>(
    groups: BTreeMap<String, Vec<R>>,
    plugins: &BTreeMap<String, Arc<dyn StoragePlugin>>,
    rejected: &mut Vec<Rejection>,
    hook: impl Fn(&dyn StoragePlugin, WorkingSubset<R>) -> Preparation<R>,
    wrap: fn(R) -> FileRequest,
) -> Vec<WorkingSubset<R>> {
    let mut subsets = Vec::with_capacity(groups.len());

    for (label, requests) in groups {
        // Labels were checked above and groups are never empty.
        let (Some(plugin), Some(subset)) = (plugins.get(&label), WorkingSubset::new(&label, requests))
        else {
            continue;
        };

        let prepared = hook(plugin.as_ref(), subset);
        for (request, reason) in prepared.rejected {
            debug!(%label, request = %request.id(), %reason, "request refused by plugin");
            rejected.push(Rejection {
                request: wrap(request),
                backend_label: label.clone(),
                reason,
            });
        }
        if let Some(subset) = prepared.subset {
            subsets.push(subset);
        }
    }

    subsets
}
