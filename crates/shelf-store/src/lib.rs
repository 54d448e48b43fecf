//! Storage plugin contract and backend implementations.
//!
//! This crate defines the [`StoragePlugin`] trait every backend implements,
//! the [`ProgressManager`] a running job reports per-request outcomes
//! through, and one concrete backend:
//!
//! - [`MemoryPlugin`]: in-memory bookkeeping backend of any kind, with
//!   failure injection and nearline staging for tests and demos.

mod error;
mod memory_plugin;
mod progress;
mod traits;

pub use error::PluginError;
pub use memory_plugin::MemoryPlugin;
pub use progress::{ProgressEvent, ProgressManager, ProgressReceiver};
pub use traits::{ConfigurationUpdate, NearlineStatus, Preparation, StoragePlugin};
