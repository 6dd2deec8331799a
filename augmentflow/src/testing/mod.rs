//! Test support: scripted fetchers, an in-process batch compute, and
//! fixture helpers.
//!
//! Compiled into the crate (not behind `cfg(test)`) so downstream crates
//! can drive the engine in their own tests.

mod mocks;

pub use mocks::{FailingFetcher, InProcessBatchCompute, ScriptedFetcher, StaticFetcher};

use crate::work::WorkItem;

/// Builds `n` items keyed `item-0 .. item-{n-1}`.
#[must_use]
pub fn items(n: usize) -> Vec<WorkItem> {
    (0..n).map(|i| WorkItem::new(format!("item-{i}"))).collect()
}

/// Builds items from explicit keys.
#[must_use]
pub fn keyed_items(keys: &[&str]) -> Vec<WorkItem> {
    keys.iter().map(|k| WorkItem::new(*k)).collect()
}
