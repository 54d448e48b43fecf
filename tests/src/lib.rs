//! Shared test harness for Shelf integration tests.
//!
//! Provides [`TestShelf`] (a registry, engine and event bus over one
//! metadata store) and [`ScriptedPlugin`], a backend whose behaviour is
//! scripted per file so tests can drive the progress protocol through its
//! corner cases: duplicate reports, late reports, missing reports.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use shelf_engine::{ShelfEngine, ShelfEngineConfig};
use shelf_meta::MetaStore;
use shelf_registry::BackendRegistry;
use shelf_store::{NearlineStatus, PluginError, Preparation, ProgressManager, StoragePlugin};
use shelf_types::events::EventBus;
use shelf_types::*;

/// Generous bound for outcomes to arrive.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

// =========================================================================
// Scripted plugin
// =========================================================================

/// What a [`ScriptedPlugin`] does with one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Script {
    /// Report success once.
    Succeed,
    /// Report failure with the given cause.
    Fail(String),
    /// Report success twice.
    ReportTwice,
    /// Report success, then a failure for the same request.
    SucceedThenFail,
    /// Never report.
    Silent,
    /// Report success after a delay, from a detached task.
    Late(Duration),
}

/// One job a [`ScriptedPlugin`] ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    /// Operation of the job.
    pub kind: RequestKind,
    /// Files of the subset, in request order.
    pub checksums: Vec<Checksum>,
}

/// A backend that does what it is told, per file.
///
/// Files without a script succeed. Nearline answers are queued per file;
/// the last queued answer repeats.
pub struct ScriptedPlugin {
    kind: BackendKind,
    scripts: Mutex<HashMap<Checksum, Script>>,
    refusals: Mutex<HashMap<Checksum, String>>,
    answers: Mutex<HashMap<Checksum, VecDeque<NearlineStatus>>>,
    checks: AtomicU64,
    jobs: Mutex<Vec<JobRecord>>,
}

impl ScriptedPlugin {
    /// A plugin of `kind` where every request succeeds.
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            scripts: Mutex::new(HashMap::new()),
            refusals: Mutex::new(HashMap::new()),
            answers: Mutex::new(HashMap::new()),
            checks: AtomicU64::new(0),
            jobs: Mutex::new(Vec::new()),
        }
    }

    /// Script the handling of `checksum`.
    pub fn script(&self, checksum: &str, script: Script) {
        self.scripts.lock().unwrap().insert(checksum.into(), script);
    }

    /// Refuse `checksum` during preparation.
    pub fn refuse(&self, checksum: &str, reason: &str) {
        self.refusals
            .lock()
            .unwrap()
            .insert(checksum.into(), reason.to_string());
    }

    /// Queue the next nearline answer for `checksum`.
    pub fn answer(&self, checksum: &str, status: NearlineStatus) {
        self.answers
            .lock()
            .unwrap()
            .entry(checksum.into())
            .or_default()
            .push_back(status);
    }

    /// Number of nearline availability checks made.
    pub fn availability_checks(&self) -> u64 {
        self.checks.load(Ordering::SeqCst)
    }

    /// Jobs run so far, in start order.
    pub fn jobs(&self) -> Vec<JobRecord> {
        self.jobs.lock().unwrap().clone()
    }

    fn script_for(&self, checksum: &Checksum) -> Script {
        self.scripts
            .lock()
            .unwrap()
            .get(checksum)
            .cloned()
            .unwrap_or(Script::Succeed)
    }

    fn record<R: PendingRequest>(&self, subset: &WorkingSubset<R>) {
        self.jobs.lock().unwrap().push(JobRecord {
            kind: R::KIND,
            checksums: subset.requests().iter().map(|r| r.checksum().clone()).collect(),
        });
    }

    fn screen<R: PendingRequest>(&self, subset: WorkingSubset<R>) -> Preparation<R> {
        let refusals = self.refusals.lock().unwrap().clone();
        Preparation::screen(subset, |r| refusals.get(r.checksum()).cloned())
    }

    /// Run `subset` through the scripts, using `succeed`/`fail` to report.
    async fn play<R, S, F>(&self, subset: WorkingSubset<R>, progress: ProgressManager, succeed: S, fail: F)
    where
        R: PendingRequest,
        S: Fn(&ProgressManager, &R) + Send + Sync + Copy + 'static,
        F: Fn(&ProgressManager, &R, String) + Send + Sync + Copy + 'static,
    {
        self.record(&subset);
        for request in subset.into_requests() {
            match self.script_for(request.checksum()) {
                Script::Succeed => succeed(&progress, &request),
                Script::Fail(cause) => fail(&progress, &request, cause),
                Script::ReportTwice => {
                    succeed(&progress, &request);
                    succeed(&progress, &request);
                }
                Script::SucceedThenFail => {
                    succeed(&progress, &request);
                    fail(&progress, &request, "late failure".to_string());
                }
                Script::Silent => {}
                Script::Late(delay) => {
                    let progress = progress.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        succeed(&progress, &request);
                    });
                }
            }
        }
    }
}

#[async_trait]
impl StoragePlugin for ScriptedPlugin {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn prepare_for_storage(&self, subset: WorkingSubset<StorageRequest>) -> Preparation<StorageRequest> {
        self.screen(subset)
    }

    fn prepare_for_deletion(&self, subset: WorkingSubset<DeletionRequest>) -> Preparation<DeletionRequest> {
        self.screen(subset)
    }

    fn prepare_for_restoration(
        &self,
        subset: WorkingSubset<RestorationRequest>,
    ) -> Preparation<RestorationRequest> {
        self.screen(subset)
    }

    async fn store(&self, subset: WorkingSubset<StorageRequest>, progress: ProgressManager) {
        self.play(
            subset,
            progress,
            |p, r| p.storage_succeed(r, format!("scripted://{}/{}", r.target_backend, r.checksum), r.size_bytes),
            |p, r, cause| p.storage_failed(r, cause),
        )
        .await;
    }

    async fn delete(&self, subset: WorkingSubset<DeletionRequest>, progress: ProgressManager) {
        self.play(
            subset,
            progress,
            |p, r| p.deletion_succeed(r),
            |p, r, cause| p.deletion_failed(r, cause),
        )
        .await;
    }

    async fn retrieve(&self, subset: WorkingSubset<RestorationRequest>, progress: ProgressManager) {
        self.play(
            subset,
            progress,
            |p, r| p.restore_succeed(r, format!("/restored/{}", r.reference.checksum)),
            |p, r, cause| p.restore_failed(r, cause),
        )
        .await;
    }

    async fn check_availability(&self, reference: &FileReference) -> Result<NearlineStatus, PluginError> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        let mut answers = self.answers.lock().unwrap();
        let Some(queue) = answers.get_mut(&reference.checksum) else {
            return Err(PluginError::Unreachable(format!("no answer scripted for {}", reference.checksum)));
        };
        let status = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        status.ok_or_else(|| PluginError::Unreachable("empty answer queue".into()))
    }
}

// =========================================================================
// Test shelf
// =========================================================================

/// A registry and engine over one metadata store, with scripted backends.
///
/// Must be created inside a tokio runtime.
pub struct TestShelf {
    pub meta: Arc<MetaStore>,
    pub registry: Arc<BackendRegistry>,
    pub engine: ShelfEngine,
    pub events: EventBus,
    plugins: BTreeMap<String, Arc<ScriptedPlugin>>,
}

impl TestShelf {
    /// An empty shelf with default engine settings.
    pub fn new() -> Self {
        Self::with_config(ShelfEngineConfig::default())
    }

    /// An empty shelf with custom engine settings.
    pub fn with_config(config: ShelfEngineConfig) -> Self {
        let meta = Arc::new(MetaStore::open_temporary().unwrap());
        let registry = Arc::new(BackendRegistry::open(meta.clone()).unwrap());
        let events = EventBus::new();
        Self {
            engine: ShelfEngine::new(registry.clone(), events.clone(), config),
            meta,
            registry,
            events,
            plugins: BTreeMap::new(),
        }
    }

    /// A shelf with one active backend per `(label, kind)`.
    pub fn with_backends(backends: &[(&str, BackendKind)]) -> Self {
        let mut shelf = Self::new();
        for (label, kind) in backends {
            shelf.add_backend(BackendSpec::new(*label, *kind));
        }
        shelf
    }

    /// Register a backend served by a fresh [`ScriptedPlugin`].
    pub fn add_backend(&mut self, spec: BackendSpec) -> Arc<ScriptedPlugin> {
        let plugin = Arc::new(ScriptedPlugin::new(spec.kind));
        let label = spec.label.clone();
        self.registry.register(spec, plugin.clone()).unwrap();
        self.plugins.insert(label, plugin.clone());
        plugin
    }

    /// The plugin serving `label`.
    pub fn plugin(&self, label: &str) -> Arc<ScriptedPlugin> {
        self.plugins
            .get(label)
            .cloned()
            .unwrap_or_else(|| panic!("no plugin for {label}"))
    }

    /// Rebuild the registry and engine from the metadata store, re-attaching
    /// the same plugins, as a process restart would.
    pub fn restart(self) -> Self {
        let Self {
            meta, events, plugins, ..
        } = self;
        let registry = Arc::new(BackendRegistry::open(meta.clone()).unwrap());
        for (label, plugin) in &plugins {
            registry.attach_plugin(label, plugin.clone()).unwrap();
        }
        Self {
            engine: ShelfEngine::new(registry.clone(), events.clone(), ShelfEngineConfig::default()),
            meta,
            registry,
            events,
            plugins,
        }
    }

    /// A storage request for `checksum` on `backend`.
    pub fn store(&self, checksum: &str, backend: &str, size_bytes: u64) -> FileRequest {
        FileRequest::Store(StorageRequest {
            id: self.engine.next_request_id(),
            checksum: checksum.into(),
            display_name: format!("{checksum}.dat"),
            size_bytes,
            target_backend: backend.to_string(),
            origin: format!("file:///incoming/{checksum}"),
        })
    }

    /// A deletion request for the stored `checksum`.
    pub fn delete(&self, checksum: &str) -> FileRequest {
        FileRequest::Delete(DeletionRequest {
            id: self.engine.next_request_id(),
            reference: self.file(checksum).expect("file is referenced"),
        })
    }

    /// A restoration request for the stored `checksum`.
    pub fn restore(&self, checksum: &str) -> FileRequest {
        FileRequest::Restore(RestorationRequest {
            id: self.engine.next_request_id(),
            reference: self.file(checksum).expect("file is referenced"),
        })
    }

    /// Submit `batch`, wait for its jobs and for every outcome to settle.
    ///
    /// Returns the outcomes that settled within [`SETTLE_TIMEOUT`], in
    /// request order.
    pub async fn run(&self, batch: Vec<FileRequest>) -> Vec<RequestOutcome> {
        let ids = self.engine.submit(batch).unwrap().join().await;
        self.engine.await_outcomes(&ids, SETTLE_TIMEOUT).await
    }

    /// Store `checksum` on `backend` and assert it succeeded.
    pub async fn put(&self, checksum: &str, backend: &str, size_bytes: u64) -> FileReference {
        let outcomes = self.run(vec![self.store(checksum, backend, size_bytes)]).await;
        assert!(outcomes[0].is_success(), "store failed: {:?}", outcomes[0]);
        self.file(checksum).unwrap()
    }

    /// The reference of `checksum`, if any.
    pub fn file(&self, checksum: &str) -> Option<FileReference> {
        self.meta.get_file(&checksum.into()).unwrap()
    }

    /// `(label, priority)` of every backend of `kind`, in priority order.
    pub fn priorities(&self, kind: BackendKind) -> Vec<(String, u32)> {
        self.registry
            .list_by_kind(kind)
            .into_iter()
            .map(|b| (b.label, b.priority))
            .collect()
    }

    /// Checksums the resolver reports as available.
    pub async fn available(&self, checksums: &[&str]) -> Vec<AvailabilityStatus> {
        let wanted: Vec<Checksum> = checksums.iter().map(|c| Checksum::from(*c)).collect();
        self.engine.check_availability(&wanted).await.unwrap()
    }
}

impl Default for TestShelf {
    fn default() -> Self {
        Self::new()
    }
}
