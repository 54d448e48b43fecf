//! Type-safe event bus for in-process pub/sub.
//!
//! The progress handler, the availability resolver and the capacity monitor
//! publish what they did on an [`EventBus`]; anything interested (tests, the
//! daemon's log sink) subscribes to the event types it cares about.
//!
//! Channels are created on the first `subscribe()` for a type; events of a
//! type nobody subscribed to are discarded.
//!
//! # Example
//!
//! ```rust
//! use shelf_types::events::{EventBus, NearlineConfirmed};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let bus = EventBus::new();
//! let mut rx = bus.subscribe::<NearlineConfirmed>();
//!
//! bus.emit(NearlineConfirmed {
//!     checksum: "abc".into(),
//!     backend_label: "tape".into(),
//! });
//!
//! let event = rx.recv().await.unwrap();
//! assert_eq!(event.backend_label, "tape");
//! # });
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use tracing::warn;

use crate::{Checksum, RequestId, RequestKind};

// ---------------------------------------------------------------------------
// Event trait
// ---------------------------------------------------------------------------

/// Marker trait for all events that can travel through the [`EventBus`].
pub trait Event: Any + Send + Sync + Clone + std::fmt::Debug + 'static {}

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// A store job succeeded and a file reference was persisted.
#[derive(Clone, Debug)]
pub struct FileStored {
    /// The request that settled.
    pub request: RequestId,
    /// The stored file.
    pub checksum: Checksum,
    /// Backend now holding the file.
    pub backend_label: String,
}
impl Event for FileStored {}

/// A delete job succeeded and the file reference was removed.
#[derive(Clone, Debug)]
pub struct FileDeleted {
    /// The request that settled.
    pub request: RequestId,
    /// The removed file.
    pub checksum: Checksum,
    /// Backend the file was removed from.
    pub backend_label: String,
}
impl Event for FileDeleted {}

/// A restore job succeeded and a cache entry was persisted.
#[derive(Clone, Debug)]
pub struct FileRestored {
    /// The request that settled.
    pub request: RequestId,
    /// The restored file.
    pub checksum: Checksum,
    /// Unix timestamp (seconds) when the cached copy expires.
    pub expires_at: u64,
}
impl Event for FileRestored {}

/// A request settled with a failure.
#[derive(Clone, Debug)]
pub struct RequestFailed {
    /// The request that settled.
    pub request: RequestId,
    /// What the request asked for.
    pub kind: RequestKind,
    /// Backend that reported the failure.
    pub backend_label: String,
    /// Message supplied by the plugin.
    pub cause: String,
}
impl Event for RequestFailed {}

/// A nearline backend reported a file as not readable; the flag was latched.
#[derive(Clone, Debug)]
pub struct NearlineConfirmed {
    /// The file concerned.
    pub checksum: Checksum,
    /// The nearline backend holding it.
    pub backend_label: String,
}
impl Event for NearlineConfirmed {}

/// Severity of a capacity alert.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapacityLevel {
    /// Warning threshold crossed.
    Warning,
    /// Critical threshold crossed; the scope was put in maintenance.
    Critical,
}

/// A backend crossed a capacity threshold during a monitor run.
#[derive(Clone, Debug)]
pub struct CapacityThresholdCrossed {
    /// Scope the run was made for.
    pub scope: String,
    /// The backend concerned.
    pub backend_label: String,
    /// Occupation in percent of the allowed capacity.
    pub occupation_percent: f64,
    /// Which threshold was crossed.
    pub level: CapacityLevel,
}
impl Event for CapacityThresholdCrossed {}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Buffered events per type before slow receivers start lagging.
const CHANNEL_CAPACITY: usize = 256;

type Channels = HashMap<TypeId, Box<dyn Any + Send + Sync>>;

/// In-process publish/subscribe, one broadcast channel per event type.
///
/// Cheap to clone; clones share channels. Emitting never blocks.
#[derive(Clone, Default)]
pub struct EventBus {
    channels: Arc<RwLock<Channels>>,
}

impl EventBus {
    /// A bus with no channels yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `event` to the current subscribers of `E`.
    ///
    /// Dropped when nobody ever subscribed to `E`.
    pub fn emit<E: Event>(&self, event: E) {
        let channels = self.channels.read().expect("event bus lock poisoned");
        if let Some(tx) = channels
            .get(&TypeId::of::<E>())
            .and_then(|boxed| boxed.downcast_ref::<broadcast::Sender<E>>())
        {
            // Fails only when every receiver is gone.
            let _ = tx.send(event);
        }
    }

    /// Receive every `E` emitted from now on.
    pub fn subscribe<E: Event>(&self) -> EventReceiver<E> {
        if let Some(rx) = self.try_subscribe::<E>() {
            return EventReceiver { rx };
        }

        let mut channels = self.channels.write().expect("event bus lock poisoned");
        let boxed = channels.entry(TypeId::of::<E>()).or_insert_with(|| {
            let (tx, _) = broadcast::channel::<E>(CHANNEL_CAPACITY);
            Box::new(tx)
        });
        let rx = match boxed.downcast_ref::<broadcast::Sender<E>>() {
            Some(tx) => tx.subscribe(),
            None => unreachable!("channel keyed by TypeId holds a sender of that type"),
        };
        EventReceiver { rx }
    }

    /// Number of live receivers for `E`.
    pub fn subscriber_count<E: Event>(&self) -> usize {
        self.channels
            .read()
            .expect("event bus lock poisoned")
            .get(&TypeId::of::<E>())
            .and_then(|boxed| boxed.downcast_ref::<broadcast::Sender<E>>())
            .map_or(0, broadcast::Sender::receiver_count)
    }

    fn try_subscribe<E: Event>(&self) -> Option<broadcast::Receiver<E>> {
        self.channels
            .read()
            .expect("event bus lock poisoned")
            .get(&TypeId::of::<E>())
            .and_then(|boxed| boxed.downcast_ref::<broadcast::Sender<E>>())
            .map(broadcast::Sender::subscribe)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let channels = self.channels.read().expect("event bus lock poisoned");
        f.debug_struct("EventBus")
            .field("event_types", &channels.len())
            .finish()
    }
}

/// Receiving end for one event type.
pub struct EventReceiver<E: Event> {
    rx: broadcast::Receiver<E>,
}

impl<E: Event> EventReceiver<E> {
    /// Next event, or `None` once every clone of the bus is gone.
    ///
    /// Events lost to lagging are skipped with a warning.
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, event = std::any::type_name::<E>(), "event receiver lagged");
                }
            }
        }
    }

    /// Next buffered event, without waiting.
    pub fn try_recv(&mut self) -> Option<E> {
        use broadcast::error::TryRecvError;
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(_)) => {}
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}
