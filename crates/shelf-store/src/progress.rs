//! Per-request progress reporting from running jobs.
//!
//! A job owns a [`ProgressManager`]; each callback turns into a
//! [`ProgressEvent`] sent over an unbounded channel to whoever owns the
//! receiving end. Sending never blocks the job, and nothing is persisted on
//! this side: the receiver applies bookkeeping changes when it handles the
//! event.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use shelf_types::{
    DeletionRequest, PendingRequest, RequestId, RequestKind, RestorationRequest, StorageRequest,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Receiving end of the progress channel.
pub type ProgressReceiver = mpsc::UnboundedReceiver<ProgressEvent>;

/// One terminal outcome reported by a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// The file was stored.
    StorageSucceeded {
        /// The request that completed.
        request: StorageRequest,
        /// Backend that ran the job.
        backend_label: String,
        /// Location of the stored file.
        url: String,
        /// Final size of the stored file.
        size_bytes: u64,
    },
    /// The file could not be stored.
    StorageFailed {
        /// The request that failed.
        request: StorageRequest,
        /// Backend that ran the job.
        backend_label: String,
        /// Message from the plugin.
        cause: String,
    },
    /// The file was deleted.
    DeletionSucceeded {
        /// The request that completed.
        request: DeletionRequest,
        /// Backend that ran the job.
        backend_label: String,
    },
    /// The file could not be deleted.
    DeletionFailed {
        /// The request that failed.
        request: DeletionRequest,
        /// Backend that ran the job.
        backend_label: String,
        /// Message from the plugin.
        cause: String,
    },
    /// The file was copied to local storage.
    RestoreSucceeded {
        /// The request that completed.
        request: RestorationRequest,
        /// Backend that ran the job.
        backend_label: String,
        /// Where the copy was written.
        local_path: PathBuf,
    },
    /// The file could not be restored.
    RestoreFailed {
        /// The request that failed.
        request: RestorationRequest,
        /// Backend that ran the job.
        backend_label: String,
        /// Message from the plugin.
        cause: String,
    },
}

impl ProgressEvent {
    /// Identifier of the request this event settles.
    pub fn request_id(&self) -> RequestId {
        match self {
            ProgressEvent::StorageSucceeded { request, .. }
            | ProgressEvent::StorageFailed { request, .. } => request.id,
            ProgressEvent::DeletionSucceeded { request, .. }
            | ProgressEvent::DeletionFailed { request, .. } => request.id,
            ProgressEvent::RestoreSucceeded { request, .. }
            | ProgressEvent::RestoreFailed { request, .. } => request.id,
        }
    }

    /// Operation the settled request asked for.
    pub fn kind(&self) -> RequestKind {
        match self {
            ProgressEvent::StorageSucceeded { .. } | ProgressEvent::StorageFailed { .. } => {
                RequestKind::Storage
            }
            ProgressEvent::DeletionSucceeded { .. } | ProgressEvent::DeletionFailed { .. } => {
                RequestKind::Deletion
            }
            ProgressEvent::RestoreSucceeded { .. } | ProgressEvent::RestoreFailed { .. } => {
                RequestKind::Restoration
            }
        }
    }

    /// Backend that reported the event.
    pub fn backend_label(&self) -> &str {
        match self {
            ProgressEvent::StorageSucceeded { backend_label, .. }
            | ProgressEvent::StorageFailed { backend_label, .. }
            | ProgressEvent::DeletionSucceeded { backend_label, .. }
            | ProgressEvent::DeletionFailed { backend_label, .. }
            | ProgressEvent::RestoreSucceeded { backend_label, .. }
            | ProgressEvent::RestoreFailed { backend_label, .. } => backend_label,
        }
    }

    /// Whether the event reports a success.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ProgressEvent::StorageSucceeded { .. }
                | ProgressEvent::DeletionSucceeded { .. }
                | ProgressEvent::RestoreSucceeded { .. }
        )
    }
}

/// Handle a job reports its per-request outcomes through.
///
/// Clonable; clones share the set of already-reported requests, so a job
/// that fans work out over several tasks still reports each request once.
/// A second report for the same request is dropped here.
#[derive(Clone)]
pub struct ProgressManager {
    backend_label: Arc<str>,
    tx: mpsc::UnboundedSender<ProgressEvent>,
    reported: Arc<Mutex<HashSet<RequestId>>>,
}

impl ProgressManager {
    /// Create a manager for a job on `backend_label` sending into `tx`.
    pub fn new(backend_label: &str, tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self {
            backend_label: Arc::from(backend_label),
            tx,
            reported: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Create a manager together with a fresh receiving end.
    pub fn channel(backend_label: &str) -> (Self, ProgressReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(backend_label, tx), rx)
    }

    /// Backend the job runs on.
    pub fn backend_label(&self) -> &str {
        &self.backend_label
    }

    /// Whether a terminal outcome was already reported for `request`.
    pub fn is_reported(&self, request: RequestId) -> bool {
        self.reported
            .lock()
            .expect("progress lock poisoned")
            .contains(&request)
    }

    /// Number of requests with a reported outcome.
    pub fn reported_count(&self) -> usize {
        self.reported.lock().expect("progress lock poisoned").len()
    }

    /// Report that `request` was stored at `url` with `size_bytes`.
    pub fn storage_succeed(&self, request: &StorageRequest, url: impl Into<String>, size_bytes: u64) {
        self.report(
            request,
            ProgressEvent::StorageSucceeded {
                request: request.clone(),
                backend_label: self.backend_label.to_string(),
                url: url.into(),
                size_bytes,
            },
        );
    }

    /// Report that `request` could not be stored.
    pub fn storage_failed(&self, request: &StorageRequest, cause: impl Into<String>) {
        self.report(
            request,
            ProgressEvent::StorageFailed {
                request: request.clone(),
                backend_label: self.backend_label.to_string(),
                cause: cause.into(),
            },
        );
    }

    /// Report that the file of `request` was deleted.
    pub fn deletion_succeed(&self, request: &DeletionRequest) {
        self.report(
            request,
            ProgressEvent::DeletionSucceeded {
                request: request.clone(),
                backend_label: self.backend_label.to_string(),
            },
        );
    }

    /// Report that the file of `request` could not be deleted.
    pub fn deletion_failed(&self, request: &DeletionRequest, cause: impl Into<String>) {
        self.report(
            request,
            ProgressEvent::DeletionFailed {
                request: request.clone(),
                backend_label: self.backend_label.to_string(),
                cause: cause.into(),
            },
        );
    }

    /// Report that the file of `request` was copied to `local_path`.
    pub fn restore_succeed(&self, request: &RestorationRequest, local_path: impl Into<PathBuf>) {
        self.report(
            request,
            ProgressEvent::RestoreSucceeded {
                request: request.clone(),
                backend_label: self.backend_label.to_string(),
                local_path: local_path.into(),
            },
        );
    }

    /// Report that the file of `request` could not be restored.
    pub fn restore_failed(&self, request: &RestorationRequest, cause: impl Into<String>) {
        self.report(
            request,
            ProgressEvent::RestoreFailed {
                request: request.clone(),
                backend_label: self.backend_label.to_string(),
                cause: cause.into(),
            },
        );
    }

    fn report<R: PendingRequest>(&self, request: &R, event: ProgressEvent) {
        let first = self
            .reported
            .lock()
            .expect("progress lock poisoned")
            .insert(request.id());

        if !first {
            debug!(request = %request.id(), backend = %self.backend_label, "duplicate outcome dropped");
            return;
        }

        if self.tx.send(event).is_err() {
            warn!(
                request = %request.id(),
                backend = %self.backend_label,
                kind = %R::KIND,
                "progress receiver gone, outcome lost"
            );
        }
    }
}

impl std::fmt::Debug for ProgressManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressManager")
            .field("backend_label", &self.backend_label)
            .field("reported", &self.reported_count())
            .finish()
    }
}
