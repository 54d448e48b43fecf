//! Tests for the shelf-engine crate.

mod helpers;
