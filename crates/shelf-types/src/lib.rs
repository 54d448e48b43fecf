//! Shared types and identifiers for Shelf.
//!
//! This crate defines the bookkeeping model used across the workspace:
//! identifiers ([`BackendId`], [`Checksum`], [`RequestId`]),
//! backend configuration ([`BackendConfig`], [`BackendKind`], [`BackendSpec`]),
//! file bookkeeping ([`FileReference`], [`CacheFileEntry`]),
//! pending work ([`FileRequest`], [`WorkingSubset`]) and its outcomes
//! ([`RequestOutcome`], [`AvailabilityStatus`]).

pub mod events;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ID types
// ---------------------------------------------------------------------------

/// Opaque identifier of a configured backend: `blake3(label)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct BackendId([u8; 32]);

impl BackendId {
    /// Derive the identifier of the backend registered under `label`.
    pub fn from_label(label: &str) -> Self {
        Self(blake3::hash(label.as_bytes()).into())
    }

    /// Return the raw 32-byte representation.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for BackendId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Eight bytes are plenty to tell backends apart in logs.
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BackendId({self})")
    }
}

/// Content identifier of a stored file, the primary lookup key.
#[derive(Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Checksum(String);

impl Checksum {
    /// Wrap a checksum string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the checksum as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Checksum {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Checksum {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self.0)
    }
}

/// Identifier of one pending file request, assigned by the request tracker.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RequestId(u64);

impl RequestId {
    /// Wrap a raw request number.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Return the raw request number.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl From<u64> for RequestId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// Access tier of a backend, decided once when it is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Files are always immediately readable.
    Online,
    /// Files may need a slow restore step before they can be read.
    Nearline,
    /// Files are never directly readable without an out-of-band restore.
    Offline,
}

impl BackendKind {
    /// Every kind, in tier order.
    pub const ALL: [BackendKind; 3] = [
        BackendKind::Online,
        BackendKind::Nearline,
        BackendKind::Offline,
    ];

    /// Stable index of this kind in [`BackendKind::ALL`].
    pub fn index(self) -> usize {
        match self {
            BackendKind::Online => 0,
            BackendKind::Nearline => 1,
            BackendKind::Offline => 2,
        }
    }

    /// Lowercase name used in configuration and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Online => "online",
            BackendKind::Nearline => "nearline",
            BackendKind::Offline => "offline",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One configured storage backend instance.
///
/// The plugin implementing the backend is not part of the record; the
/// registry keeps it next to the config, keyed by label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Opaque identifier, derived from the label.
    pub id: BackendId,
    /// Unique human-readable name.
    pub label: String,
    /// Access tier.
    pub kind: BackendKind,
    /// Position within its kind; lower is tried first. Unique per kind.
    pub priority: u32,
    /// Whether new files may be sent to this backend.
    pub active: bool,
    /// Capacity granted to this backend, if bounded.
    pub allowed_capacity_bytes: Option<u64>,
    /// Referenced bytes as of the last capacity monitor run.
    pub used_capacity_bytes: u64,
    /// Referenced files as of the last capacity monitor run.
    pub file_count: u64,
    /// Unix timestamp (seconds) of the last capacity monitor run.
    pub last_monitored_at: Option<u64>,
    /// Plugin parameters.
    pub settings: BTreeMap<String, String>,
}

impl BackendConfig {
    /// Build a fresh config from a spec at the given priority.
    pub fn from_spec(spec: BackendSpec, priority: u32) -> Self {
        Self {
            id: BackendId::from_label(&spec.label),
            label: spec.label,
            kind: spec.kind,
            priority,
            active: spec.active,
            allowed_capacity_bytes: spec.allowed_capacity_bytes,
            used_capacity_bytes: 0,
            file_count: 0,
            last_monitored_at: None,
            settings: spec.settings,
        }
    }

    /// Used capacity as a percentage of the allowed capacity.
    ///
    /// `None` when no positive capacity is configured: the ratio is
    /// undefined, not zero.
    pub fn occupation_percent(&self) -> Option<f64> {
        match self.allowed_capacity_bytes {
            Some(allowed) if allowed > 0 => {
                Some(self.used_capacity_bytes as f64 / allowed as f64 * 100.0)
            }
            _ => None,
        }
    }
}

/// Operator-supplied description of a backend, used to register or update it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSpec {
    /// Unique human-readable name.
    pub label: String,
    /// Access tier.
    pub kind: BackendKind,
    /// Whether new files may be sent to this backend.
    pub active: bool,
    /// Capacity granted to this backend, if bounded.
    pub allowed_capacity_bytes: Option<u64>,
    /// Plugin parameters.
    pub settings: BTreeMap<String, String>,
}

impl BackendSpec {
    /// An active, unbounded backend with no settings.
    pub fn new(label: impl Into<String>, kind: BackendKind) -> Self {
        Self {
            label: label.into(),
            kind,
            active: true,
            allowed_capacity_bytes: None,
            settings: BTreeMap::new(),
        }
    }

    /// Bound the backend to `bytes` of referenced data.
    pub fn with_capacity(mut self, bytes: u64) -> Self {
        self.allowed_capacity_bytes = Some(bytes);
        self
    }

    /// Mark the backend inactive.
    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Add a plugin parameter.
    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }
}

impl From<&BackendConfig> for BackendSpec {
    fn from(config: &BackendConfig) -> Self {
        Self {
            label: config.label.clone(),
            kind: config.kind,
            active: config.active,
            allowed_capacity_bytes: config.allowed_capacity_bytes,
            settings: config.settings.clone(),
        }
    }
}

/// Aggregated bookkeeping for one backend label.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendUsage {
    /// Total size of referenced files.
    pub used_bytes: u64,
    /// Number of referenced files.
    pub file_count: u64,
}

// ---------------------------------------------------------------------------
// File bookkeeping
// ---------------------------------------------------------------------------

/// Bookkeeping record for one stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReference {
    /// Content identifier, the primary key.
    pub checksum: Checksum,
    /// Name shown to users.
    pub display_name: String,
    /// Size of the stored object.
    pub size_bytes: u64,
    /// Label of the backend currently holding the file.
    pub backend_label: String,
    /// Location reported by the plugin when the file was stored.
    pub url: String,
    /// Set once a nearline backend has reported the file as not readable.
    pub nearline_confirmed: bool,
    /// Unix timestamp (seconds) when the store job reported success.
    pub stored_at: u64,
}

/// Ephemeral local copy of a file pulled from a slower tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheFileEntry {
    /// Content identifier of the cached file.
    pub checksum: Checksum,
    /// Size of the cached copy.
    pub size_bytes: u64,
    /// Unix timestamp (seconds) after which the copy must not be served.
    pub expiration_date: u64,
    /// Where the restore job put the copy.
    pub local_path: PathBuf,
    /// Backend the copy was restored from.
    pub source_backend: String,
}

impl CacheFileEntry {
    /// Whether this entry can still be served at `now` (unix seconds).
    pub fn is_live(&self, now: u64) -> bool {
        self.expiration_date > now
    }
}

/// Availability of one file, as answered by the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityStatus {
    /// The file the status is about.
    pub checksum: Checksum,
    /// Whether the file can be read right now.
    pub available: bool,
    /// End of a time-bounded availability; `None` when permanent or unavailable.
    pub expires_at: Option<u64>,
}

impl AvailabilityStatus {
    /// Readable until `expires_at`, or permanently when `None`.
    pub fn available(checksum: Checksum, expires_at: Option<u64>) -> Self {
        Self {
            checksum,
            available: true,
            expires_at,
        }
    }

    /// Not readable without a restore.
    pub fn unavailable(checksum: Checksum) -> Self {
        Self {
            checksum,
            available: false,
            expires_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Requests and working subsets
// ---------------------------------------------------------------------------

/// Operation a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    /// Put a new file on a backend.
    Storage,
    /// Remove a file from its backend.
    Deletion,
    /// Copy a file from its backend into the cache tier.
    Restoration,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RequestKind::Storage => "storage",
            RequestKind::Deletion => "deletion",
            RequestKind::Restoration => "restoration",
        })
    }
}

/// Common view over the three request types.
pub trait PendingRequest: Clone + Send + Sync + fmt::Debug + 'static {
    /// Operation this request type performs.
    const KIND: RequestKind;

    /// Identifier of the request.
    fn id(&self) -> RequestId;

    /// File the request is about.
    fn checksum(&self) -> &Checksum;
}

/// Ask for a file to be stored on a backend chosen by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRequest {
    /// Identifier of the request.
    pub id: RequestId,
    /// Content identifier of the file.
    pub checksum: Checksum,
    /// Name shown to users.
    pub display_name: String,
    /// Expected size of the file.
    pub size_bytes: u64,
    /// Label of the backend the file must go to.
    pub target_backend: String,
    /// Where the plugin fetches the bytes from.
    pub origin: String,
}

impl PendingRequest for StorageRequest {
    const KIND: RequestKind = RequestKind::Storage;

    fn id(&self) -> RequestId {
        self.id
    }

    fn checksum(&self) -> &Checksum {
        &self.checksum
    }
}

/// Ask for a stored file to be removed from its backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionRequest {
    /// Identifier of the request.
    pub id: RequestId,
    /// The reference to remove.
    pub reference: FileReference,
}

impl PendingRequest for DeletionRequest {
    const KIND: RequestKind = RequestKind::Deletion;

    fn id(&self) -> RequestId {
        self.id
    }

    fn checksum(&self) -> &Checksum {
        &self.reference.checksum
    }
}

/// Ask for a stored file to be copied into the cache tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestorationRequest {
    /// Identifier of the request.
    pub id: RequestId,
    /// The reference to restore.
    pub reference: FileReference,
}

impl PendingRequest for RestorationRequest {
    const KIND: RequestKind = RequestKind::Restoration;

    fn id(&self) -> RequestId {
        self.id
    }

    fn checksum(&self) -> &Checksum {
        &self.reference.checksum
    }
}

/// Any pending request, as submitted in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileRequest {
    /// See [`StorageRequest`].
    Store(StorageRequest),
    /// See [`DeletionRequest`].
    Delete(DeletionRequest),
    /// See [`RestorationRequest`].
    Restore(RestorationRequest),
}

impl FileRequest {
    /// Identifier of the wrapped request.
    pub fn id(&self) -> RequestId {
        match self {
            FileRequest::Store(r) => r.id,
            FileRequest::Delete(r) => r.id,
            FileRequest::Restore(r) => r.id,
        }
    }

    /// File the wrapped request is about.
    pub fn checksum(&self) -> &Checksum {
        match self {
            FileRequest::Store(r) => &r.checksum,
            FileRequest::Delete(r) => &r.reference.checksum,
            FileRequest::Restore(r) => &r.reference.checksum,
        }
    }

    /// Operation of the wrapped request.
    pub fn kind(&self) -> RequestKind {
        match self {
            FileRequest::Store(_) => RequestKind::Storage,
            FileRequest::Delete(_) => RequestKind::Deletion,
            FileRequest::Restore(_) => RequestKind::Restoration,
        }
    }
}

/// Requests of one kind assigned to one backend, consumed by exactly one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingSubset<R> {
    backend_label: String,
    requests: Vec<R>,
}

impl<R: PendingRequest> WorkingSubset<R> {
    /// Group `requests` for `backend_label`. Returns `None` when empty.
    pub fn new(backend_label: impl Into<String>, requests: Vec<R>) -> Option<Self> {
        if requests.is_empty() {
            return None;
        }
        Some(Self {
            backend_label: backend_label.into(),
            requests,
        })
    }

    /// Backend every request of this subset targets.
    pub fn backend_label(&self) -> &str {
        &self.backend_label
    }

    /// The grouped requests. Never empty.
    pub fn requests(&self) -> &[R] {
        &self.requests
    }

    /// Identifiers of the grouped requests.
    pub fn ids(&self) -> Vec<RequestId> {
        self.requests.iter().map(PendingRequest::id).collect()
    }

    /// Number of grouped requests.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Always `false`; provided for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Take ownership of the grouped requests.
    pub fn into_requests(self) -> Vec<R> {
        self.requests
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Terminal state of one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeStatus {
    /// The job reported success and the bookkeeping was updated.
    Succeeded,
    /// The job (or the plugin's preparation step) reported a failure.
    Failed {
        /// Message supplied by the plugin.
        cause: String,
    },
}

/// The terminal callback that was applied for a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOutcome {
    /// The request that settled.
    pub request: RequestId,
    /// What the request asked for.
    pub kind: RequestKind,
    /// The file concerned.
    pub checksum: Checksum,
    /// Backend that ran the job.
    pub backend_label: String,
    /// Success or failure.
    pub status: OutcomeStatus,
    /// Unix timestamp (seconds) when the outcome was applied.
    pub settled_at: u64,
}

impl RequestOutcome {
    /// Whether the request succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self.status, OutcomeStatus::Succeeded)
    }
}

/// Per-scope bookkeeping of the capacity monitor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringRun {
    /// Whether a run is in progress.
    pub running: bool,
    /// Unix timestamp (seconds) of the last completed run.
    pub last_run_at: Option<u64>,
    /// Duration of the last completed run.
    pub last_duration_ms: Option<u64>,
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
