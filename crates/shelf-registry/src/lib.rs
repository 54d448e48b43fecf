//! Prioritized registry of storage backends.
//!
//! Backends are grouped by [`BackendKind`](shelf_types::BackendKind); within
//! one kind every backend holds a distinct priority and the set of
//! priorities is always `0..n`. Each kind is published as an immutable
//! [`TierSnapshot`] so readers never observe a half-applied swap.

pub mod error;
pub mod registry;

pub use error::RegistryError;
pub use registry::{BackendRegistry, TierSnapshot};
