//! Event sink trait and implementations.
//!
//! The orchestrator, chunk executors, and batch adapters report lifecycle
//! events through an [`EventSink`] so callers can wire up observability
//! without the engine depending on any particular backend.

use async_trait::async_trait;
use tracing::{debug, info, Level};

/// Event names emitted by the engine.
pub mod names {
    /// A run began.
    pub const RUN_STARTED: &str = "run.started";
    /// A run finished with every chunk resolved.
    pub const RUN_COMPLETED: &str = "run.completed";
    /// A run stopped early.
    pub const RUN_ABORTED: &str = "run.aborted";
    /// A chunk was dispatched.
    pub const CHUNK_STARTED: &str = "chunk.started";
    /// A chunk resolved.
    pub const CHUNK_COMPLETED: &str = "chunk.completed";
    /// A chunk failed outright.
    pub const CHUNK_FAILED: &str = "chunk.failed";
    /// An item was served from the cache.
    pub const ITEM_CACHE_HIT: &str = "item.cache_hit";
    /// An item was fetched from its source.
    pub const ITEM_FETCHED: &str = "item.fetched";
    /// An item fetch is being retried.
    pub const ITEM_RETRIED: &str = "item.retried";
    /// An item reached a terminal failure.
    pub const ITEM_FAILED: &str = "item.failed";
    /// A batch job was submitted.
    pub const JOB_SUBMITTED: &str = "job.submitted";
    /// A batch job reported a status change.
    pub const JOB_STATUS: &str = "job.status";
    /// A batch job was cancelled.
    pub const JOB_CANCELLED: &str = "job.cancelled";
}

/// Trait for event sinks that receive engine lifecycle events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event asynchronously.
    ///
    /// `event_type` is one of the [`names`] constants; `data` carries
    /// event-specific fields.
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>);

    /// Emits an event without awaiting.
    ///
    /// Must never fail; sinks log and swallow their own errors.
    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>);
}

/// A no-op sink that discards all events.
///
/// Used as the default when no sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event_type: &str, _data: Option<serde_json::Value>) {}

    fn try_emit(&self, _event_type: &str, _data: Option<serde_json::Value>) {}
}

/// A sink that logs events through the tracing framework.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a logging sink at the given level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    /// Creates an info-level sink.
    #[must_use]
    pub fn info() -> Self {
        Self::new(Level::INFO)
    }

    fn log_event(&self, event_type: &str, data: &Option<serde_json::Value>) {
        // tracing macros need a const level, hence the branch.
        if self.level == Level::DEBUG {
            debug!(event_type = %event_type, event_data = ?data, "Event: {}", event_type);
        } else {
            info!(event_type = %event_type, event_data = ?data, "Event: {}", event_type);
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.log_event(event_type, &data);
    }

    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.log_event(event_type, &data);
    }
}

/// A sink that records events in memory, for tests and diagnostics.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<(String, Option<serde_json::Value>)>>,
}

impl CollectingEventSink {
    /// Creates an empty collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<(String, Option<serde_json::Value>)> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Returns events whose type starts with the given prefix.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<(String, Option<serde_json::Value>)> {
        self.events
            .read()
            .iter()
            .filter(|(t, _)| t.starts_with(type_prefix))
            .cloned()
            .collect()
    }

    /// Counts events of an exact type.
    #[must_use]
    pub fn count_of(&self, event_type: &str) -> usize {
        self.events
            .read()
            .iter()
            .filter(|(t, _)| t == event_type)
            .count()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.events.write().push((event_type.to_string(), data));
    }

    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.events.write().push((event_type.to_string(), data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_sink() {
        let sink = NoOpEventSink;
        sink.emit(names::RUN_STARTED, None).await;
        sink.try_emit(names::RUN_COMPLETED, Some(serde_json::json!({"x": 1})));
        // Should not panic
    }

    #[tokio::test]
    async fn test_logging_sink() {
        let sink = LoggingEventSink::default();
        sink.emit(names::CHUNK_STARTED, Some(serde_json::json!({"chunk_index": 0})))
            .await;
        sink.try_emit(names::CHUNK_COMPLETED, None);
        // Should not panic
    }

    #[tokio::test]
    async fn test_collecting_sink() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit(names::ITEM_FETCHED, None).await;
        sink.try_emit(names::ITEM_FAILED, Some(serde_json::json!({"item_id": "a"})));

        assert_eq!(sink.len(), 2);

        let events = sink.events();
        assert_eq!(events[0].0, names::ITEM_FETCHED);
        assert_eq!(events[1].0, names::ITEM_FAILED);
    }

    #[tokio::test]
    async fn test_collecting_sink_filter() {
        let sink = CollectingEventSink::new();
        sink.emit(names::CHUNK_STARTED, None).await;
        sink.emit(names::CHUNK_COMPLETED, None).await;
        sink.emit(names::JOB_SUBMITTED, None).await;

        assert_eq!(sink.events_of_type("chunk.").len(), 2);
        assert_eq!(sink.events_of_type("job.").len(), 1);
        assert_eq!(sink.count_of(names::CHUNK_STARTED), 1);
    }

    #[tokio::test]
    async fn test_collecting_sink_clear() {
        let sink = CollectingEventSink::new();
        sink.emit(names::RUN_STARTED, None).await;
        assert_eq!(sink.len(), 1);

        sink.clear();
        assert!(sink.is_empty());
    }
}
