//! Run orchestration.
//!
//! The [`Orchestrator`] owns the shared collaborators of a run (cache,
//! provenance store, event sink, cancellation token) and drives chunk
//! execution: it partitions the input, keeps at most `max_concurrency`
//! chunk tasks in flight, merges their results as they land, and enforces
//! the failure-ratio and timeout policies that can abort a run early.

use crate::batch::{BatchCompute, BatchJobAdapter};
use crate::cache::FetchCache;
use crate::cancellation::CancelToken;
use crate::config::RunConfig;
use crate::errors::{AugmentError, ConfigError};
use crate::events::{names, EventSink, NoOpEventSink};
use crate::executor::ChunkExecutor;
use crate::fetch::Fetcher;
use crate::provenance::{InMemoryProvenanceStore, ProvenanceStore};
use crate::work::{partition_items, AbortReason, Chunk, ChunkResult, RunResult, RunStatus, WorkItem};
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Coordinates chunked, concurrent augmentation runs.
///
/// Collaborators are injected up front and shared by every run; the
/// cancellation token in particular outlives individual runs, so a token
/// cancelled once stays cancelled for the orchestrator's lifetime.
pub struct Orchestrator {
    config: RunConfig,
    cache: Arc<FetchCache>,
    provenance: Arc<dyn ProvenanceStore>,
    events: Arc<dyn EventSink>,
    batch_compute: Option<Arc<dyn BatchCompute>>,
    cancel: Arc<CancelToken>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("batch_compute", &self.batch_compute.is_some())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl Orchestrator {
    /// Creates an orchestrator after validating the configuration.
    ///
    /// The fetch cache is sized from `config.cache`; provenance defaults to
    /// the in-memory store and events to a no-op sink until overridden.
    pub fn new(config: RunConfig) -> Result<Self, AugmentError> {
        config.validate()?;
        let cache = Arc::new(FetchCache::new(config.cache.clone()));
        Ok(Self {
            config,
            cache,
            provenance: Arc::new(InMemoryProvenanceStore::new()),
            events: Arc::new(NoOpEventSink),
            batch_compute: None,
            cancel: CancelToken::new(),
        })
    }

    /// Replaces the fetch cache, e.g. to share one across orchestrators.
    #[must_use]
    pub fn with_cache(mut self, cache: FetchCache) -> Self {
        self.cache = Arc::new(cache);
        self
    }

    /// Replaces the provenance store.
    #[must_use]
    pub fn with_provenance(mut self, store: Arc<dyn ProvenanceStore>) -> Self {
        self.provenance = store;
        self
    }

    /// Replaces the event sink.
    #[must_use]
    pub fn with_events(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    /// Attaches a batch compute backend for `use_batch_compute` runs.
    #[must_use]
    pub fn with_batch_compute(mut self, compute: Arc<dyn BatchCompute>) -> Self {
        self.batch_compute = Some(compute);
        self
    }

    /// Returns the cancellation token shared with running chunks.
    #[must_use]
    pub fn cancel_token(&self) -> Arc<CancelToken> {
        self.cancel.clone()
    }

    /// Requests cancellation of the current run.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.cancel.cancel(reason);
    }

    /// Returns the shared fetch cache.
    #[must_use]
    pub fn cache(&self) -> &FetchCache {
        &self.cache
    }

    /// Returns the provenance store.
    #[must_use]
    pub fn provenance(&self) -> Arc<dyn ProvenanceStore> {
        self.provenance.clone()
    }

    /// Runs one augmentation pass over `items` against `fetcher`.
    ///
    /// Items are partitioned into chunks which execute concurrently, each
    /// either fetching directly or riding the batch backend per the
    /// configuration. The returned [`RunResult`] merges every resolved
    /// chunk, even when the run aborted partway.
    pub async fn run(
        &self,
        items: Vec<WorkItem>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<RunResult, AugmentError> {
        let run_id = Uuid::new_v4();
        let started = Instant::now();

        let adapter = if self.config.use_batch_compute {
            let compute = self.batch_compute.clone().ok_or_else(|| {
                AugmentError::Config(ConfigError::new(
                    "use_batch_compute",
                    "requires a batch compute backend",
                ))
            })?;
            Some(BatchJobAdapter::new(compute, self.config.poll_interval()))
        } else {
            None
        };

        let item_count = items.len();
        let chunks = partition_items(items, self.config.chunk_size);
        let chunks_total = chunks.len();

        self.events
            .emit(
                names::RUN_STARTED,
                Some(json!({
                    "run_id": run_id,
                    "items": item_count,
                    "chunks": chunks_total,
                    "source": fetcher.source(),
                    "batch": adapter.is_some(),
                })),
            )
            .await;
        tracing::info!(
            run_id = %run_id,
            items = item_count,
            chunks = chunks_total,
            source = fetcher.source(),
            "run started"
        );

        let executor = Arc::new(ChunkExecutor::new(
            run_id,
            fetcher,
            self.cache.clone(),
            self.provenance.clone(),
            self.config.retry.clone(),
            self.events.clone(),
            self.cancel.clone(),
        ));

        // The deadline is disarmed once it fires so draining the in-flight
        // chunks does not spin on an already-elapsed timer.
        let mut deadline = self
            .config
            .run_timeout()
            .map(|timeout| tokio::time::Instant::now() + timeout);

        let mut pending = chunks.into_iter();
        let mut active: FuturesUnordered<
            tokio::task::JoinHandle<Result<ChunkResult, AugmentError>>,
        > = FuturesUnordered::new();

        let mut values = HashMap::new();
        let mut failures = Vec::new();
        let mut retry_counts: HashMap<String, u32> = HashMap::new();
        let mut cache_hits = 0u64;
        let mut fetches = 0u64;
        let mut chunks_resolved = 0usize;
        let mut abort: Option<AbortReason> = None;

        loop {
            // Top up the dispatch window; a cancelled token or an abort
            // decision stops dispatching while in-flight chunks drain.
            while active.len() < self.config.max_concurrency
                && abort.is_none()
                && !self.cancel.is_cancelled()
            {
                let Some(chunk) = pending.next() else { break };
                active.push(self.spawn_chunk(&executor, adapter.clone(), chunk));
            }

            if active.is_empty() {
                break;
            }

            let joined = if let Some(at) = deadline {
                match tokio::time::timeout_at(at, active.next()).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        let timeout_ms = self.config.run_timeout_ms.unwrap_or(0);
                        tracing::warn!(run_id = %run_id, timeout_ms, "run timed out");
                        self.cancel.cancel(format!("run timeout after {timeout_ms}ms"));
                        deadline = None;
                        continue;
                    }
                }
            } else {
                active.next().await
            };

            match joined {
                Some(Ok(Ok(chunk_result))) => {
                    if !chunk_result.cancelled {
                        chunks_resolved += 1;
                    }
                    cache_hits += chunk_result.cache_hits;
                    fetches += chunk_result.fetches;
                    retry_counts.extend(chunk_result.retry_counts);
                    values.extend(chunk_result.values);
                    failures.extend(chunk_result.failures);

                    if abort.is_none() {
                        let failed = failures.len();
                        let resolved = values.len() + failed;
                        if resolved > 0
                            && failed as f64 / resolved as f64 > self.config.max_failure_ratio
                        {
                            let reason = AbortReason::FailureRatioExceeded { failed, resolved };
                            tracing::warn!(
                                run_id = %run_id,
                                failed,
                                resolved,
                                "failure ratio exceeded, aborting run"
                            );
                            self.cancel.cancel(reason.to_string());
                            abort = Some(reason);
                        }
                    }
                }
                Some(Ok(Err(e))) => {
                    if abort.is_none() {
                        tracing::error!(run_id = %run_id, error = %e, "chunk failed, aborting run");
                        self.cancel.cancel(format!("fatal error: {e}"));
                        abort = Some(AbortReason::Fatal {
                            error: e.to_string(),
                        });
                    }
                }
                Some(Err(join_err)) => {
                    if abort.is_none() {
                        tracing::error!(run_id = %run_id, error = %join_err, "chunk task panicked");
                        self.cancel.cancel("chunk task panicked");
                        abort = Some(AbortReason::Fatal {
                            error: format!("chunk task failed: {join_err}"),
                        });
                    }
                }
                None => break,
            }
        }

        // A cancellation that stopped work before every chunk resolved is
        // an abort in its own right; one that landed after the last chunk
        // finished changes nothing.
        if abort.is_none() && self.cancel.is_cancelled() && chunks_resolved < chunks_total {
            abort = Some(AbortReason::Cancelled {
                reason: self
                    .cancel
                    .reason()
                    .unwrap_or_else(|| "cancelled".to_string()),
            });
        }

        let status = if abort.is_some() {
            RunStatus::Aborted
        } else if failures.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::PartiallyCompleted
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match &abort {
            Some(reason) => {
                self.events
                    .emit(
                        names::RUN_ABORTED,
                        Some(json!({
                            "run_id": run_id,
                            "reason": reason.to_string(),
                            "chunks_resolved": chunks_resolved,
                            "chunks_total": chunks_total,
                            "duration_ms": duration_ms,
                        })),
                    )
                    .await;
                tracing::warn!(run_id = %run_id, reason = %reason, duration_ms, "run aborted");
            }
            None => {
                self.events
                    .emit(
                        names::RUN_COMPLETED,
                        Some(json!({
                            "run_id": run_id,
                            "status": status.to_string(),
                            "values": values.len(),
                            "failures": failures.len(),
                            "cache_hits": cache_hits,
                            "fetches": fetches,
                            "duration_ms": duration_ms,
                        })),
                    )
                    .await;
                tracing::info!(
                    run_id = %run_id,
                    status = %status,
                    values = values.len(),
                    failures = failures.len(),
                    duration_ms,
                    "run finished"
                );
            }
        }

        Ok(RunResult {
            run_id,
            status,
            values,
            failures,
            retry_counts,
            cache_hits,
            fetches,
            chunks_total,
            chunks_resolved,
            duration_ms,
            abort,
        })
    }

    fn spawn_chunk(
        &self,
        executor: &Arc<ChunkExecutor>,
        adapter: Option<BatchJobAdapter>,
        chunk: Chunk,
    ) -> tokio::task::JoinHandle<Result<ChunkResult, AugmentError>> {
        let executor = executor.clone();
        tokio::spawn(async move {
            match adapter {
                Some(adapter) => executor.run_batch(&chunk, &adapter).await,
                None => executor.run(&chunk).await,
            }
        })
    }
}
