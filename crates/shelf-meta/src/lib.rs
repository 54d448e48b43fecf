//! Bookkeeping persistence layer wrapping Fjall.
//!
//! [`MetaStore`] provides typed accessors over four Fjall keyspaces:
//!
//! - `backends`: [`BackendId`] → serialized [`BackendConfig`]
//! - `files`: [`Checksum`] → serialized [`FileReference`]
//! - `cache`: [`Checksum`] → serialized [`CacheFileEntry`]
//! - `monitoring`: scope name → serialized [`MonitoringRun`]
//!
//! Values are encoded with postcard. Priority is a field of the backend
//! record, never part of a key, so reordering backends rewrites values only.
//!
//! [`BackendId`]: shelf_types::BackendId
//! [`BackendConfig`]: shelf_types::BackendConfig
//! [`Checksum`]: shelf_types::Checksum
//! [`FileReference`]: shelf_types::FileReference
//! [`CacheFileEntry`]: shelf_types::CacheFileEntry
//! [`MonitoringRun`]: shelf_types::MonitoringRun

mod error;
mod store;

pub use error::MetaError;
pub use store::MetaStore;
