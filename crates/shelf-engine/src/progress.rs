//! Receiving side of the progress protocol.
//!
//! Jobs report through [`ProgressManager`](shelf_store::ProgressManager)
//! handles; the events land here. [`ProgressHandler`] is the only place that
//! mutates file bookkeeping on behalf of jobs:
//!
//! - a file reference is created only when a store succeeds,
//! - it is removed only when a delete succeeds (or a forced delete fails),
//! - a cache entry is created only when a restore succeeds.
//!
//! Every applied outcome is kept in a bounded ledger keyed by request id.
//! Within one attempt the first terminal outcome wins, except that a success
//! always replaces an earlier failure. Handing a request to a new job, or
//! refusing it at preparation, starts a new attempt.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shelf_meta::MetaStore;
use shelf_store::{ProgressEvent, ProgressReceiver};
use shelf_types::events::{EventBus, FileDeleted, FileRestored, FileStored, RequestFailed};
use shelf_types::{
    CacheFileEntry, Checksum, FileReference, FileRequest, OutcomeStatus, PendingRequest, RequestId,
    RequestKind, RequestOutcome, unix_now,
};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::dispatch::Rejection;
use crate::error::EngineError;

/// Settled outcomes kept by default before the oldest are evicted.
pub const DEFAULT_OUTCOME_CAPACITY: usize = 10_000;

/// Pending and failed request counts of one backend for one operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestCounts {
    /// Requests handed to a job that have not settled.
    pub pending: usize,
    /// Requests whose last attempt failed.
    pub failed: usize,
}

/// A request as it was handed to a job.
#[derive(Debug, Clone)]
struct Tracked {
    request: FileRequest,
    backend_label: String,
    force: bool,
}

impl Tracked {
    fn matches(&self, label: &str, kind: RequestKind) -> bool {
        self.backend_label == label && self.request.kind() == kind
    }
}

#[derive(Default)]
struct Ledger {
    settled: HashMap<RequestId, (u64, RequestOutcome)>,
    /// Settlement order, oldest first.
    order: VecDeque<(u64, RequestId)>,
    next_seq: u64,
    pending: HashMap<RequestId, Tracked>,
    /// Failed requests, kept until retried, discarded or superseded.
    failed: HashMap<RequestId, Tracked>,
}

impl Ledger {
    /// Forget what earlier attempts of `request` settled to.
    fn begin_attempt(&mut self, request: RequestId) {
        self.failed.remove(&request);
        self.settled.remove(&request);
    }

    fn accepts(&self, request: RequestId, success: bool) -> bool {
        match self.settled.get(&request) {
            None => true,
            Some((_, previous)) => success && !previous.is_success(),
        }
    }

    /// Drop the oldest outcomes beyond `capacity`, and the order slots
    /// left behind by restarted attempts.
    fn evict_to(&mut self, capacity: usize) {
        while self.settled.len() > capacity || self.order.len() > capacity.saturating_mul(2) {
            let Some((seq, id)) = self.order.pop_front() else {
                break;
            };
            if self.settled.get(&id).is_some_and(|(s, _)| *s == seq) {
                self.settled.remove(&id);
            }
        }
    }
}

/// Applies job outcomes and tracks which requests have settled.
pub struct ProgressHandler {
    meta: Arc<MetaStore>,
    events: EventBus,
    cache_ttl: Duration,
    capacity: usize,
    ledger: Mutex<Ledger>,
    settled: Notify,
}

impl ProgressHandler {
    /// Create a handler persisting into `meta`.
    ///
    /// Restored copies stay in the cache for `cache_ttl`.
    pub fn new(meta: Arc<MetaStore>, events: EventBus, cache_ttl: Duration) -> Self {
        Self {
            meta,
            events,
            cache_ttl,
            capacity: DEFAULT_OUTCOME_CAPACITY,
            ledger: Mutex::new(Ledger::default()),
            settled: Notify::new(),
        }
    }

    /// Keep at most `capacity` settled outcomes, evicting the oldest first.
    ///
    /// Pending and failed requests are not subject to the bound.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Start the receiver loop for `rx`.
    ///
    /// The loop ends once every sender is gone.
    pub fn spawn(self: &Arc<Self>, mut rx: ProgressReceiver) -> JoinHandle<()> {
        let handler = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                handler.handle(event);
            }
            debug!("progress channel closed");
        })
    }

    /// Record that `request` was handed to a job on `backend_label`.
    ///
    /// Whatever an earlier attempt of the same request settled to is
    /// dropped. A forced deletion removes the reference even when the plugin
    /// fails to delete the bytes.
    pub fn track(&self, request: FileRequest, backend_label: &str, force: bool) {
        let id = request.id();
        let mut ledger = self.ledger.lock().expect("ledger lock poisoned");
        ledger.begin_attempt(id);
        ledger.pending.insert(
            id,
            Tracked {
                request,
                backend_label: backend_label.to_string(),
                force,
            },
        );
    }

    /// Apply `event`, turning a bookkeeping error into a failed outcome.
    pub fn handle(&self, event: ProgressEvent) {
        let request = event.request_id();
        let kind = event.kind();
        let backend_label = event.backend_label().to_string();
        let checksum = checksum_of(&event);

        if let Err(e) = self.apply(event) {
            error!(%request, backend = %backend_label, error = %e, "failed to apply job outcome");
            self.settle(
                RequestOutcome {
                    request,
                    kind,
                    checksum,
                    backend_label,
                    status: OutcomeStatus::Failed {
                        cause: format!("bookkeeping failed: {e}"),
                    },
                    settled_at: unix_now(),
                },
                None,
            );
        }
    }

    /// Apply one terminal outcome.
    ///
    /// Returns `None` when the outcome was ignored because the request had
    /// already settled.
    pub fn apply(&self, event: ProgressEvent) -> Result<Option<RequestOutcome>, EngineError> {
        let request = event.request_id();
        let forced = {
            let ledger = self.ledger.lock().expect("ledger lock poisoned");
            if !ledger.accepts(request, event.is_success()) {
                debug!(%request, "request already settled, outcome ignored");
                return Ok(None);
            }
            ledger.pending.get(&request).is_some_and(|t| t.force)
        };

        let now = unix_now();
        let outcome = RequestOutcome {
            request,
            kind: event.kind(),
            checksum: checksum_of(&event),
            backend_label: event.backend_label().to_string(),
            status: OutcomeStatus::Succeeded,
            settled_at: now,
        };

        let outcome = match event {
            ProgressEvent::StorageSucceeded {
                request,
                backend_label,
                url,
                size_bytes,
            } => {
                match self.meta.get_file(&request.checksum)? {
                    Some(existing) if existing.backend_label == backend_label => {
                        debug!(checksum = %request.checksum, backend = %backend_label, "file already referenced");
                    }
                    existing => {
                        if let Some(existing) = existing {
                            warn!(
                                checksum = %request.checksum,
                                from = %existing.backend_label,
                                to = %backend_label,
                                "file reference moved to another backend"
                            );
                        }
                        self.meta.put_file(&FileReference {
                            checksum: request.checksum.clone(),
                            display_name: request.display_name.clone(),
                            size_bytes,
                            backend_label: backend_label.clone(),
                            url,
                            nearline_confirmed: false,
                            stored_at: now,
                        })?;
                        info!(checksum = %request.checksum, backend = %backend_label, size_bytes, "file stored");
                    }
                }
                self.events.emit(FileStored {
                    request: request.id,
                    checksum: request.checksum,
                    backend_label,
                });
                outcome
            }

            ProgressEvent::DeletionSucceeded {
                request,
                backend_label,
            } => {
                self.forget(request.checksum(), &backend_label)?;
                self.events.emit(FileDeleted {
                    request: request.id,
                    checksum: request.checksum().clone(),
                    backend_label,
                });
                outcome
            }

            ProgressEvent::DeletionFailed {
                request,
                backend_label,
                cause,
            } if forced => {
                warn!(
                    checksum = %request.checksum(),
                    backend = %backend_label,
                    %cause,
                    "physical deletion failed, reference removed anyway"
                );
                self.forget(request.checksum(), &backend_label)?;
                self.events.emit(FileDeleted {
                    request: request.id,
                    checksum: request.checksum().clone(),
                    backend_label,
                });
                outcome
            }

            ProgressEvent::RestoreSucceeded {
                request,
                backend_label,
                local_path,
            } => {
                let expires_at = now + self.cache_ttl.as_secs();
                self.meta.put_cache_entry(&CacheFileEntry {
                    checksum: request.reference.checksum.clone(),
                    size_bytes: request.reference.size_bytes,
                    expiration_date: expires_at,
                    local_path,
                    source_backend: backend_label,
                })?;
                info!(checksum = %request.reference.checksum, expires_at, "file restored to cache");
                self.events.emit(FileRestored {
                    request: request.id,
                    checksum: request.reference.checksum,
                    expires_at,
                });
                outcome
            }

            ProgressEvent::StorageFailed { cause, .. }
            | ProgressEvent::DeletionFailed { cause, .. }
            | ProgressEvent::RestoreFailed { cause, .. } => {
                warn!(%request, kind = %outcome.kind, backend = %outcome.backend_label, %cause, "request failed");
                self.events.emit(RequestFailed {
                    request,
                    kind: outcome.kind,
                    backend_label: outcome.backend_label.clone(),
                    cause: cause.clone(),
                });
                RequestOutcome {
                    status: OutcomeStatus::Failed { cause },
                    ..outcome
                }
            }
        };

        Ok(self.settle(outcome, None))
    }

    /// Record a request refused before its job started.
    pub fn reject(&self, rejection: &Rejection) -> Option<RequestOutcome> {
        let request = rejection.request.id();
        warn!(%request, backend = %rejection.backend_label, reason = %rejection.reason, "request rejected");
        self.ledger
            .lock()
            .expect("ledger lock poisoned")
            .begin_attempt(request);
        self.events.emit(RequestFailed {
            request,
            kind: rejection.request.kind(),
            backend_label: rejection.backend_label.clone(),
            cause: rejection.reason.clone(),
        });
        self.settle(
            RequestOutcome {
                request,
                kind: rejection.request.kind(),
                checksum: rejection.request.checksum().clone(),
                backend_label: rejection.backend_label.clone(),
                status: OutcomeStatus::Failed {
                    cause: rejection.reason.clone(),
                },
                settled_at: unix_now(),
            },
            Some(Tracked {
                request: rejection.request.clone(),
                backend_label: rejection.backend_label.clone(),
                force: false,
            }),
        )
    }

    /// Outcome of `request`, if it has settled and was not evicted yet.
    pub fn outcome(&self, request: RequestId) -> Option<RequestOutcome> {
        self.ledger
            .lock()
            .expect("ledger lock poisoned")
            .settled
            .get(&request)
            .map(|(_, outcome)| outcome.clone())
    }

    /// Number of settled outcomes held.
    pub fn settled_count(&self) -> usize {
        self.ledger.lock().expect("ledger lock poisoned").settled.len()
    }

    /// Pending and failed counts of `kind` requests on `backend_label`.
    pub fn counts(&self, backend_label: &str, kind: RequestKind) -> RequestCounts {
        let ledger = self.ledger.lock().expect("ledger lock poisoned");
        RequestCounts {
            pending: ledger
                .pending
                .values()
                .filter(|t| t.matches(backend_label, kind))
                .count(),
            failed: ledger
                .failed
                .values()
                .filter(|t| t.matches(backend_label, kind))
                .count(),
        }
    }

    /// Failed `kind` requests on `backend_label`, by request id.
    pub fn failed_requests(&self, backend_label: &str, kind: RequestKind) -> Vec<FileRequest> {
        let ledger = self.ledger.lock().expect("ledger lock poisoned");
        let mut requests: Vec<FileRequest> = ledger
            .failed
            .values()
            .filter(|t| t.matches(backend_label, kind))
            .map(|t| t.request.clone())
            .collect();
        requests.sort_by_key(FileRequest::id);
        requests
    }

    /// Forget failed `kind` requests on `backend_label` without retrying.
    ///
    /// Returns how many were discarded.
    pub fn discard_failures(&self, backend_label: &str, kind: RequestKind) -> usize {
        let mut ledger = self.ledger.lock().expect("ledger lock poisoned");
        let before = ledger.failed.len();
        ledger.failed.retain(|_, t| !t.matches(backend_label, kind));
        before - ledger.failed.len()
    }

    /// Wait until every request in `ids` has settled, or `timeout` elapses.
    ///
    /// Returns the outcomes available at that point, in `ids` order.
    pub async fn wait_for(&self, ids: &[RequestId], timeout: Duration) -> Vec<RequestOutcome> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let outcomes = self.collect(ids);
            if outcomes.len() == ids.len() {
                return outcomes;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.collect(ids);
            }
        }
    }

    fn collect(&self, ids: &[RequestId]) -> Vec<RequestOutcome> {
        let ledger = self.ledger.lock().expect("ledger lock poisoned");
        ids.iter()
            .filter_map(|id| ledger.settled.get(id).map(|(_, o)| o.clone()))
            .collect()
    }

    /// Remove the reference of a deleted file, then its cache entry.
    ///
    /// A stale cache entry is only logged: unreferenced files are never
    /// reported available.
    fn forget(&self, checksum: &Checksum, backend_label: &str) -> Result<(), EngineError> {
        match self.meta.get_file(checksum)? {
            Some(current) if current.backend_label != backend_label => {
                // Stored again elsewhere since the request was made.
                warn!(%checksum, backend = %backend_label, now_on = %current.backend_label, "reference kept");
                return Ok(());
            }
            _ => self.meta.remove_file(checksum)?,
        }
        if let Err(e) = self.meta.remove_cache_entry(checksum) {
            warn!(%checksum, error = %e, "cache entry of deleted file left behind");
        }
        info!(%checksum, backend = %backend_label, "file deleted");
        Ok(())
    }

    /// Insert `outcome` unless the ledger refuses it.
    fn settle(&self, outcome: RequestOutcome, origin: Option<Tracked>) -> Option<RequestOutcome> {
        {
            let mut ledger = self.ledger.lock().expect("ledger lock poisoned");
            let id = outcome.request;
            if !ledger.accepts(id, outcome.is_success()) {
                return None;
            }

            let tracked = ledger.pending.remove(&id).or(origin);
            if outcome.is_success() {
                ledger.failed.remove(&id);
            } else if let Some(tracked) = tracked {
                ledger.failed.insert(id, tracked);
            }

            let seq = ledger.next_seq;
            ledger.next_seq += 1;
            ledger.settled.insert(id, (seq, outcome.clone()));
            ledger.order.push_back((seq, id));
            ledger.evict_to(self.capacity);
        }
        self.settled.notify_waiters();
        Some(outcome)
    }
}

fn checksum_of(event: &ProgressEvent) -> Checksum {
    match event {
        ProgressEvent::StorageSucceeded { request, .. }
        | ProgressEvent::StorageFailed { request, .. } => request.checksum.clone(),
        ProgressEvent::DeletionSucceeded { request, .. }
        | ProgressEvent::DeletionFailed { request, .. } => request.checksum().clone(),
        ProgressEvent::RestoreSucceeded { request, .. }
        | ProgressEvent::RestoreFailed { request, .. } => request.checksum().clone(),
    }
}

impl std::fmt::Debug for ProgressHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressHandler")
            .field("cache_ttl", &self.cache_ttl)
            .field("capacity", &self.capacity)
            .field("settled", &self.settled_count())
            .finish()
    }
}
