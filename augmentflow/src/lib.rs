//! # Augmentflow
//!
//! An orchestration engine for data-augmentation runs.
//!
//! Augmentflow takes a set of work items, partitions them into chunks, and
//! resolves each item against an external fetch source with:
//!
//! - **Concurrent chunk execution**: a bounded number of chunks in flight,
//!   items strictly ordered within each chunk
//! - **Classified retries**: transient failures back off exponentially,
//!   permanent failures fail one item, fatal failures abort the run
//! - **Fetch caching**: successful values are reused across chunks and runs,
//!   with TTL expiry and LRU eviction
//! - **Provenance**: every terminal item outcome leaves an append-only record
//! - **Batch compute**: chunks can ride an external batch system instead of
//!   fetching item by item
//! - **Run control**: failure-ratio abort, cooperative cancellation, and an
//!   overall run timeout
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use augmentflow::prelude::*;
//! use std::sync::Arc;
//!
//! let orchestrator = Orchestrator::new(RunConfig::new().with_chunk_size(16))?;
//!
//! let fetcher = Arc::new(FnFetcher::new("geo", |key: String| async move {
//!     Ok(serde_json::json!({ "resolved": key }))
//! }));
//!
//! let items: Vec<WorkItem> = keys.into_iter().map(WorkItem::new).collect();
//! let result = orchestrator.run(items, fetcher).await?;
//! println!("{}: {} values", result.status, result.values.len());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod batch;
pub mod cache;
pub mod cancellation;
pub mod config;
pub mod errors;
pub mod events;
pub mod executor;
pub mod fetch;
pub mod observability;
pub mod orchestrator;
pub mod provenance;
pub mod retry;
pub mod testing;
pub mod work;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::batch::{BatchCompute, BatchJobAdapter, BatchJobOutput, JobHandle, JobStatus};
    pub use crate::cache::{CacheConfig, CacheStats, FetchCache};
    pub use crate::cancellation::CancelToken;
    pub use crate::config::RunConfig;
    pub use crate::errors::{AugmentError, ConfigError, ErrorClass, FetchError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::executor::ChunkExecutor;
    pub use crate::fetch::{Fetcher, FnFetcher};
    pub use crate::orchestrator::Orchestrator;
    pub use crate::provenance::{InMemoryProvenanceStore, ProvenanceRecord, ProvenanceStore};
    pub use crate::retry::{RetryDecision, RetryPolicy, RetryState};
    pub use crate::work::{
        partition_items, AbortReason, Chunk, ChunkResult, FailureKind, ItemFailure, RunResult,
        RunStatus, WorkItem,
    };
}
