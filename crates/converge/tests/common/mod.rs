//! Shared test utilities for converge integration tests.
//!
//! This module provides:
//! - `TestHarness`: one application reconciled from a temp manifest
//!   directory against an in-memory cluster
//! - Builders for manifest YAML and controller configs

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::{TestHarness, APP, NAMESPACE};
