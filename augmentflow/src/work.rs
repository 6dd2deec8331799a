//! Work items, chunk partitioning, and run/chunk result types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// An opaque unit of augmentable data, identified by a stable key.
///
/// The engine never looks inside an item: fetch sources interpret the key,
/// the engine only moves the resulting values around.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItem {
    /// Stable identifier understood by fetch sources.
    pub key: String,
}

impl WorkItem {
    /// Creates an item from its key.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl From<&str> for WorkItem {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for WorkItem {
    fn from(key: String) -> Self {
        Self::new(key)
    }
}

impl std::fmt::Display for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key)
    }
}

/// An ordered slice of the input, executed as one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Position of this chunk in the partition, starting at 0.
    pub index: usize,
    /// The items assigned to this chunk, in input order.
    pub items: Vec<WorkItem>,
}

impl Chunk {
    /// Creates a chunk.
    #[must_use]
    pub fn new(index: usize, items: Vec<WorkItem>) -> Self {
        Self { index, items }
    }

    /// Returns the number of items in the chunk.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true when the chunk holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Splits items into consecutive chunks of at most `chunk_size`.
///
/// Chunks are non-overlapping, preserve input order, and concatenate back
/// to the input. Every chunk except possibly the last holds exactly
/// `chunk_size` items; empty input yields no chunks.
#[must_use]
pub fn partition_items(items: Vec<WorkItem>, chunk_size: usize) -> Vec<Chunk> {
    // chunk_size is validated upstream; guard anyway so the slice API
    // cannot panic on 0.
    let size = chunk_size.max(1);
    items
        .chunks(size)
        .enumerate()
        .map(|(index, window)| Chunk::new(index, window.to_vec()))
        .collect()
}

/// How an item came to fail terminally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The error was permanent; no retry was attempted.
    Permanent,
    /// Transient errors persisted until the retry budget ran out.
    RetriesExhausted,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Permanent => write!(f, "permanent"),
            Self::RetriesExhausted => write!(f, "retries_exhausted"),
        }
    }
}

/// A terminally failed item, reported without failing its chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    /// Key of the failed item.
    pub item_id: String,
    /// Human-readable description of the final error.
    pub error: String,
    /// Whether the failure was permanent or a demoted transient.
    pub kind: FailureKind,
}

impl ItemFailure {
    /// Records a permanent failure.
    #[must_use]
    pub fn permanent(item_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            error: error.into(),
            kind: FailureKind::Permanent,
        }
    }

    /// Records a transient failure demoted after the retry budget ran out.
    #[must_use]
    pub fn exhausted(item_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            error: error.into(),
            kind: FailureKind::RetriesExhausted,
        }
    }
}

/// Outcome of executing a single chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkResult {
    /// Index of the chunk this result belongs to.
    pub chunk_index: usize,
    /// Fetched values keyed by item id.
    pub values: HashMap<String, serde_json::Value>,
    /// Items that failed terminally.
    pub failures: Vec<ItemFailure>,
    /// Retries performed per item; items with zero retries are absent.
    pub retry_counts: HashMap<String, u32>,
    /// Items served from the cache.
    pub cache_hits: u64,
    /// External fetch calls actually made (retries included).
    pub fetches: u64,
    /// True when the chunk stopped early on cancellation.
    pub cancelled: bool,
}

impl ChunkResult {
    /// Creates an empty result for the given chunk.
    #[must_use]
    pub fn new(chunk_index: usize) -> Self {
        Self {
            chunk_index,
            ..Self::default()
        }
    }

    /// Number of items that reached a terminal outcome.
    #[must_use]
    pub fn resolved_items(&self) -> usize {
        self.values.len() + self.failures.len()
    }

    /// Number of items that failed terminally.
    #[must_use]
    pub fn failed_items(&self) -> usize {
        self.failures.len()
    }
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Every item resolved with a value.
    Completed,
    /// The run finished, but some items failed terminally.
    PartiallyCompleted,
    /// The run stopped before resolving every chunk.
    Aborted,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::PartiallyCompleted => write!(f, "partially_completed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Why a run aborted before resolving every chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    /// Terminal failures crossed the configured ratio.
    FailureRatioExceeded {
        /// Items failed when the threshold tripped.
        failed: usize,
        /// Items resolved when the threshold tripped.
        resolved: usize,
    },
    /// A fatal collaborator error poisoned the run.
    Fatal {
        /// Description of the fatal error.
        error: String,
    },
    /// The run was cancelled, by a caller or by the run timeout.
    Cancelled {
        /// The reason recorded on the cancellation token.
        reason: String,
    },
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FailureRatioExceeded { failed, resolved } => {
                write!(f, "failure ratio exceeded ({failed}/{resolved} items failed)")
            }
            Self::Fatal { error } => write!(f, "fatal error: {error}"),
            Self::Cancelled { reason } => write!(f, "cancelled: {reason}"),
        }
    }
}

/// Merged outcome of a whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// Unique id assigned to the run.
    pub run_id: Uuid,
    /// Terminal status.
    pub status: RunStatus,
    /// Fetched values keyed by item id, merged across chunks.
    pub values: HashMap<String, serde_json::Value>,
    /// Terminal item failures, merged across chunks.
    pub failures: Vec<ItemFailure>,
    /// Retries performed per item, merged across chunks.
    pub retry_counts: HashMap<String, u32>,
    /// Cache hits across the run.
    pub cache_hits: u64,
    /// External fetch calls across the run.
    pub fetches: u64,
    /// Chunks the input was partitioned into.
    pub chunks_total: usize,
    /// Chunks that ran to a terminal outcome.
    pub chunks_resolved: usize,
    /// Wall-clock duration of the run, in milliseconds.
    pub duration_ms: u64,
    /// Present when the run aborted.
    pub abort: Option<AbortReason>,
}

impl RunResult {
    /// True when every item resolved with a value.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// True when the run stopped early.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.status == RunStatus::Aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn items(n: usize) -> Vec<WorkItem> {
        (0..n).map(|i| WorkItem::new(format!("item-{i}"))).collect()
    }

    #[test]
    fn test_partition_uneven_tail() {
        let chunks = partition_items(items(25), 10);

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 10);
        assert_eq!(chunks[1].len(), 10);
        assert_eq!(chunks[2].len(), 5);
        assert_eq!(
            chunks.iter().map(|c| c.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn test_partition_concatenates_to_input() {
        let input = items(25);
        let chunks = partition_items(input.clone(), 10);

        let rejoined: Vec<WorkItem> = chunks.into_iter().flat_map(|c| c.items).collect();
        assert_eq!(rejoined, input);
    }

    #[test]
    fn test_partition_chunks_do_not_overlap() {
        let chunks = partition_items(items(23), 7);

        let mut seen = std::collections::HashSet::new();
        for chunk in &chunks {
            for item in &chunk.items {
                assert!(seen.insert(item.key.clone()), "duplicate item {item}");
            }
        }
        assert_eq!(seen.len(), 23);
    }

    #[test]
    fn test_partition_exact_multiple() {
        let chunks = partition_items(items(20), 10);

        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.len() == 10));
    }

    #[test]
    fn test_partition_empty_input() {
        assert!(partition_items(Vec::new(), 10).is_empty());
    }

    #[test]
    fn test_partition_oversized_chunk() {
        let chunks = partition_items(items(3), 100);

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 3);
    }

    #[test]
    fn test_work_item_conversions() {
        let a: WorkItem = "key-1".into();
        let b: WorkItem = String::from("key-1").into();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "key-1");
    }

    #[test]
    fn test_chunk_result_counts() {
        let mut result = ChunkResult::new(3);
        result.values.insert("a".into(), serde_json::json!(1));
        result.values.insert("b".into(), serde_json::json!(2));
        result.failures.push(ItemFailure::permanent("c", "bad key"));

        assert_eq!(result.chunk_index, 3);
        assert_eq!(result.resolved_items(), 3);
        assert_eq!(result.failed_items(), 1);
    }

    #[test]
    fn test_failure_constructors() {
        let permanent = ItemFailure::permanent("x", "nope");
        assert_eq!(permanent.kind, FailureKind::Permanent);

        let exhausted = ItemFailure::exhausted("y", "timed out");
        assert_eq!(exhausted.kind, FailureKind::RetriesExhausted);
    }

    #[test]
    fn test_abort_reason_display() {
        let reason = AbortReason::FailureRatioExceeded {
            failed: 6,
            resolved: 10,
        };
        assert_eq!(
            reason.to_string(),
            "failure ratio exceeded (6/10 items failed)"
        );

        let cancelled = AbortReason::Cancelled {
            reason: "run timeout after 30000ms".into(),
        };
        assert!(cancelled.to_string().contains("run timeout"));
    }

    #[test]
    fn test_run_status_display() {
        assert_eq!(RunStatus::Completed.to_string(), "completed");
        assert_eq!(
            RunStatus::PartiallyCompleted.to_string(),
            "partially_completed"
        );
        assert_eq!(RunStatus::Aborted.to_string(), "aborted");
    }
}
