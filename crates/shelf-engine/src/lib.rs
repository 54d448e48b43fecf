//! Job orchestration for Shelf.
//!
//! The [`ShelfEngine`] ties the pieces together:
//!
//! - [`Dispatcher`]: turns a batch of file requests into one
//!   [`WorkingSubset`](shelf_types::WorkingSubset) per backend.
//! - [`ProgressHandler`]: receives the outcomes jobs report and applies
//!   the bookkeeping changes they imply.
//! - [`AvailabilityResolver`]: answers whether files can be read now,
//!   asking nearline plugins only when nothing cheaper decides.

pub mod availability;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod progress;

pub use availability::AvailabilityResolver;
pub use dispatch::{DispatchPlan, Dispatcher, Rejection};
pub use engine::{BackendOverview, ShelfEngine, ShelfEngineConfig, Submission};
pub use error::EngineError;
pub use progress::{ProgressHandler, RequestCounts};

#[cfg(test)]
mod tests;
