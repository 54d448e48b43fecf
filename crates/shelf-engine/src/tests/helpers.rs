//! Shared test utilities for shelf-engine tests.

use std::sync::Arc;
use std::time::Duration;

use shelf_meta::MetaStore;
use shelf_registry::BackendRegistry;
use shelf_store::MemoryPlugin;
use shelf_types::events::EventBus;
use shelf_types::*;

use crate::engine::{ShelfEngine, ShelfEngineConfig};

/// Generous bound for outcomes to arrive.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// An engine over three backends: `disk` (online), `tape` (nearline) and
/// `vault` (offline), each backed by its own [`MemoryPlugin`].
pub struct Harness {
    pub engine: ShelfEngine,
    pub disk: Arc<MemoryPlugin>,
    pub tape: Arc<MemoryPlugin>,
    pub vault: Arc<MemoryPlugin>,
}

impl Harness {
    pub fn meta(&self) -> &Arc<MetaStore> {
        self.engine.registry().meta()
    }
}

/// Build a [`Harness`] with default engine settings.
///
/// Must run inside a tokio runtime.
pub fn harness() -> Harness {
    harness_with(ShelfEngineConfig::default())
}

/// Build a [`Harness`] with custom engine settings.
pub fn harness_with(config: ShelfEngineConfig) -> Harness {
    let meta = Arc::new(MetaStore::open_temporary().unwrap());
    let registry = Arc::new(BackendRegistry::open(meta).unwrap());

    let disk = Arc::new(MemoryPlugin::new(BackendKind::Online));
    let tape = Arc::new(MemoryPlugin::new(BackendKind::Nearline).with_restore_dir("/cache"));
    let vault = Arc::new(MemoryPlugin::new(BackendKind::Offline));

    registry
        .register(BackendSpec::new("disk", BackendKind::Online), disk.clone())
        .unwrap();
    registry
        .register(BackendSpec::new("tape", BackendKind::Nearline), tape.clone())
        .unwrap();
    registry
        .register(BackendSpec::new("vault", BackendKind::Offline), vault.clone())
        .unwrap();

    Harness {
        engine: ShelfEngine::new(registry, EventBus::new(), config),
        disk,
        tape,
        vault,
    }
}

/// A storage request for `checksum` on `backend`.
pub fn store_request(id: u64, checksum: &str, backend: &str, size: u64) -> StorageRequest {
    StorageRequest {
        id: RequestId::new(id),
        checksum: checksum.into(),
        display_name: format!("{checksum}.bin"),
        size_bytes: size,
        target_backend: backend.to_string(),
        origin: format!("file:///incoming/{checksum}"),
    }
}

/// A file reference as the progress handler would have written it.
pub fn reference(checksum: &str, backend: &str) -> FileReference {
    FileReference {
        checksum: checksum.into(),
        display_name: format!("{checksum}.bin"),
        size_bytes: 100,
        backend_label: backend.to_string(),
        url: format!("memory://{backend}/{checksum}"),
        nearline_confirmed: false,
        stored_at: 1_700_000_000,
    }
}

/// Store `checksum` on `backend` through a real job and wait for it.
pub async fn store_file(harness: &Harness, id: u64, checksum: &str, backend: &str) -> FileReference {
    let submission = harness
        .engine
        .submit(vec![FileRequest::Store(store_request(id, checksum, backend, 100))])
        .unwrap();
    let ids = submission.join().await;
    let outcomes = harness.engine.await_outcomes(&ids, SETTLE_TIMEOUT).await;
    assert!(outcomes[0].is_success(), "store failed: {:?}", outcomes[0]);
    harness.meta().get_file(&checksum.into()).unwrap().unwrap()
}
