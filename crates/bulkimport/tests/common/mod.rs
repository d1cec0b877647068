//! Shared test utilities for bulkimport integration tests.
//!
//! This module provides:
//! - `TestHarness` for isolated runs against a temp database and lock dir
//! - `CsvBuilder` for writing source files programmatically

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::TestHarness;
