//! Capacity monitoring for Shelf.
//!
//! - [`CapacityMonitor`]: one run per scope: aggregates what every backend
//!   holds, records it in the registry and raises alerts when a backend
//!   crosses its warning or critical threshold.
//! - [`MonitorScheduler`]: runs the monitor for every active scope on a
//!   fixed interval, never overlapping two runs of the same scope.
//!
//! Alerts leave the crate through the [`Notifier`] and [`MaintenanceSignal`]
//! traits; the scopes to watch come from a [`ScopeSource`].

pub mod error;
pub mod monitor;
pub mod scheduler;
pub mod traits;

pub use error::MonitorError;
pub use monitor::{BackendCapacity, CapacityMonitor, CapacityReport, Thresholds};
pub use scheduler::MonitorScheduler;
pub use traits::{ADMIN_ROLE, MaintenanceSignal, NotificationLevel, Notifier, ScopeSource, StaticScopes};
