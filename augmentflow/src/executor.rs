//! Chunk execution.
//!
//! A [`ChunkExecutor`] resolves one chunk at a time: items strictly in
//! order, each served from the cache when possible and fetched with
//! retry/backoff otherwise. The same executor drives batch-backed chunks
//! by splitting off cache hits and delegating the remainder to a
//! [`BatchJobAdapter`]. Executors are built once per run and shared across
//! chunk tasks; all per-chunk state lives in the result being built.

use crate::batch::{BatchJobAdapter, BatchJobOutput, JobHandle, JobStatus};
use crate::cache::FetchCache;
use crate::cancellation::CancelToken;
use crate::errors::{AugmentError, FetchError};
use crate::events::{names, EventSink};
use crate::fetch::Fetcher;
use crate::provenance::{detail_keys, details, ProvenanceStore};
use crate::retry::{RetryDecision, RetryPolicy, RetryState};
use crate::work::{Chunk, ChunkResult, FailureKind, ItemFailure, WorkItem};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

enum ItemOutcome {
    Done,
    Cancelled,
}

/// Resolves chunks against a fetch source, cache, and provenance store.
pub struct ChunkExecutor {
    run_id: Uuid,
    fetcher: Arc<dyn Fetcher>,
    cache: Arc<FetchCache>,
    provenance: Arc<dyn ProvenanceStore>,
    policy: RetryPolicy,
    events: Arc<dyn EventSink>,
    cancel: Arc<CancelToken>,
}

impl std::fmt::Debug for ChunkExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkExecutor")
            .field("run_id", &self.run_id)
            .field("source", &self.fetcher.source())
            .finish()
    }
}

impl ChunkExecutor {
    /// Creates an executor for one run.
    #[must_use]
    pub fn new(
        run_id: Uuid,
        fetcher: Arc<dyn Fetcher>,
        cache: Arc<FetchCache>,
        provenance: Arc<dyn ProvenanceStore>,
        policy: RetryPolicy,
        events: Arc<dyn EventSink>,
        cancel: Arc<CancelToken>,
    ) -> Self {
        Self {
            run_id,
            fetcher,
            cache,
            provenance,
            policy,
            events,
            cancel,
        }
    }

    /// Resolves a chunk item by item against the fetch source.
    ///
    /// Terminal item failures are collected, not propagated; only fatal
    /// errors fail the chunk. Cancellation observed between items or during
    /// a backoff returns the partial result with `cancelled` set.
    pub async fn run(&self, chunk: &Chunk) -> Result<ChunkResult, AugmentError> {
        self.emit_chunk_started(chunk, false).await;
        let outcome = self.run_local(chunk).await;
        self.emit_chunk_outcome(chunk, &outcome).await;
        outcome
    }

    /// Resolves a chunk through the batch compute backend.
    ///
    /// Cache hits are served locally; remaining items ride a batch job
    /// whose submission, polling, and output read-back all flow through the
    /// retry policy.
    pub async fn run_batch(
        &self,
        chunk: &Chunk,
        adapter: &BatchJobAdapter,
    ) -> Result<ChunkResult, AugmentError> {
        self.emit_chunk_started(chunk, true).await;
        let outcome = self.run_batch_inner(chunk, adapter).await;
        self.emit_chunk_outcome(chunk, &outcome).await;
        outcome
    }

    async fn run_local(&self, chunk: &Chunk) -> Result<ChunkResult, AugmentError> {
        let mut result = ChunkResult::new(chunk.index);

        for item in &chunk.items {
            if self.cancel.is_cancelled() {
                result.cancelled = true;
                break;
            }
            match self.resolve_item(item, &mut result).await? {
                ItemOutcome::Done => {}
                ItemOutcome::Cancelled => {
                    result.cancelled = true;
                    break;
                }
            }
        }
        Ok(result)
    }

    async fn resolve_item(
        &self,
        item: &WorkItem,
        result: &mut ChunkResult,
    ) -> Result<ItemOutcome, AugmentError> {
        let source = self.fetcher.source();

        if let Some(value) = self.cache.get(source, &item.key) {
            self.serve_cache_hit(item, value, result).await?;
            return Ok(ItemOutcome::Done);
        }

        let started = Instant::now();
        let mut state = RetryState::new();
        loop {
            result.fetches += 1;
            match self.fetcher.fetch(&item.key).await {
                Ok(value) => {
                    self.cache.put(source, &item.key, value.clone());
                    let retries = state.attempt();
                    if retries > 0 {
                        result.retry_counts.insert(item.key.clone(), retries);
                    }
                    self.provenance
                        .append(
                            &item.key,
                            source,
                            details([
                                (detail_keys::ATTEMPTS, json!(retries + 1)),
                                (detail_keys::RETRIES, json!(retries)),
                                (
                                    detail_keys::ELAPSED_MS,
                                    json!(started.elapsed().as_millis() as u64),
                                ),
                            ]),
                        )
                        .await?;
                    self.events
                        .emit(
                            names::ITEM_FETCHED,
                            Some(json!({
                                "run_id": self.run_id,
                                "chunk_index": result.chunk_index,
                                "item_id": item.key,
                                "attempts": retries + 1,
                            })),
                        )
                        .await;
                    result.values.insert(item.key.clone(), value);
                    return Ok(ItemOutcome::Done);
                }
                Err(e) => match self.policy.decide(&mut state, e.class()) {
                    RetryDecision::Retry(delay) => {
                        tracing::debug!(
                            item_id = %item.key,
                            attempt = state.attempt(),
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "retrying fetch"
                        );
                        self.events
                            .emit(
                                names::ITEM_RETRIED,
                                Some(json!({
                                    "run_id": self.run_id,
                                    "chunk_index": result.chunk_index,
                                    "item_id": item.key,
                                    "attempt": state.attempt(),
                                    "delay_ms": delay.as_millis() as u64,
                                    "error": e.to_string(),
                                })),
                            )
                            .await;
                        if !self.sleep_unless_cancelled(delay).await {
                            return Ok(ItemOutcome::Cancelled);
                        }
                    }
                    RetryDecision::NotRetryable => {
                        self.record_item_failure(
                            item,
                            ItemFailure::permanent(&item.key, e.to_string()),
                            &state,
                            result,
                        )
                        .await?;
                        return Ok(ItemOutcome::Done);
                    }
                    RetryDecision::GiveUp => {
                        self.record_item_failure(
                            item,
                            ItemFailure::exhausted(&item.key, e.to_string()),
                            &state,
                            result,
                        )
                        .await?;
                        return Ok(ItemOutcome::Done);
                    }
                    RetryDecision::Abort => {
                        tracing::error!(item_id = %item.key, error = %e, "fatal fetch error");
                        return Err(AugmentError::Fatal(e));
                    }
                },
            }
        }
    }

    async fn run_batch_inner(
        &self,
        chunk: &Chunk,
        adapter: &BatchJobAdapter,
    ) -> Result<ChunkResult, AugmentError> {
        let mut result = ChunkResult::new(chunk.index);
        let source = self.fetcher.source();

        // Serve cache hits locally; only misses travel to the batch system.
        let mut misses: Vec<WorkItem> = Vec::new();
        for item in &chunk.items {
            if self.cancel.is_cancelled() {
                result.cancelled = true;
                return Ok(result);
            }
            match self.cache.get(source, &item.key) {
                Some(value) => self.serve_cache_hit(item, value, &mut result).await?,
                None => misses.push(item.clone()),
            }
        }
        if misses.is_empty() {
            return Ok(result);
        }

        let miss_chunk = Chunk::new(chunk.index, misses.clone());
        let mut state = RetryState::new();

        'lifecycle: loop {
            if self.cancel.is_cancelled() {
                result.cancelled = true;
                break 'lifecycle;
            }

            let mut handle = match adapter.submit(&miss_chunk).await {
                Ok(handle) => handle,
                Err(e) => match self.policy.decide(&mut state, e.class()) {
                    RetryDecision::Retry(delay) => {
                        tracing::debug!(
                            chunk_index = chunk.index,
                            attempt = state.attempt(),
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "retrying batch submission"
                        );
                        if !self.sleep_unless_cancelled(delay).await {
                            result.cancelled = true;
                            break 'lifecycle;
                        }
                        continue 'lifecycle;
                    }
                    RetryDecision::GiveUp => {
                        self.fail_misses(
                            &misses,
                            FailureKind::RetriesExhausted,
                            &e.to_string(),
                            &state,
                            &mut result,
                        )
                        .await?;
                        break 'lifecycle;
                    }
                    RetryDecision::NotRetryable => {
                        self.fail_misses(
                            &misses,
                            FailureKind::Permanent,
                            &e.to_string(),
                            &state,
                            &mut result,
                        )
                        .await?;
                        break 'lifecycle;
                    }
                    RetryDecision::Abort => return Err(AugmentError::Fatal(e)),
                },
            };
            self.events
                .emit(
                    names::JOB_SUBMITTED,
                    Some(json!({
                        "run_id": self.run_id,
                        "chunk_index": chunk.index,
                        "job_id": handle.job_id,
                        "items": miss_chunk.len(),
                    })),
                )
                .await;

            // Drive the job to a terminal status, one poll per interval.
            let terminal = loop {
                match adapter.poll(&mut handle).await {
                    Ok(status) => {
                        self.events
                            .emit(
                                names::JOB_STATUS,
                                Some(json!({
                                    "run_id": self.run_id,
                                    "chunk_index": chunk.index,
                                    "job_id": handle.job_id,
                                    "status": status.to_string(),
                                })),
                            )
                            .await;
                        if status.is_terminal() {
                            break status;
                        }
                        if !self.sleep_unless_cancelled(adapter.poll_interval()).await {
                            adapter.cancel(&mut handle).await;
                            self.emit_job_cancelled(&handle, chunk.index).await;
                            result.cancelled = true;
                            break 'lifecycle;
                        }
                    }
                    Err(e) => match self.policy.decide(&mut state, e.class()) {
                        RetryDecision::Retry(delay) => {
                            tracing::debug!(
                                job_id = %handle.job_id,
                                attempt = state.attempt(),
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "retrying job status check"
                            );
                            if !self.sleep_unless_cancelled(delay).await {
                                adapter.cancel(&mut handle).await;
                                self.emit_job_cancelled(&handle, chunk.index).await;
                                result.cancelled = true;
                                break 'lifecycle;
                            }
                        }
                        RetryDecision::GiveUp => {
                            self.fail_misses(
                                &misses,
                                FailureKind::RetriesExhausted,
                                &e.to_string(),
                                &state,
                                &mut result,
                            )
                            .await?;
                            break 'lifecycle;
                        }
                        RetryDecision::NotRetryable => {
                            self.fail_misses(
                                &misses,
                                FailureKind::Permanent,
                                &e.to_string(),
                                &state,
                                &mut result,
                            )
                            .await?;
                            break 'lifecycle;
                        }
                        RetryDecision::Abort => return Err(AugmentError::Fatal(e)),
                    },
                }
            };

            match terminal {
                JobStatus::Succeeded => loop {
                    match adapter.fetch_result(&handle).await {
                        Ok(output) => {
                            self.merge_job_output(&misses, &handle, output, &state, &mut result)
                                .await?;
                            break 'lifecycle;
                        }
                        Err(e) => match self.policy.decide(&mut state, e.class()) {
                            RetryDecision::Retry(delay) => {
                                tracing::debug!(
                                    job_id = %handle.job_id,
                                    attempt = state.attempt(),
                                    error = %e,
                                    "retrying job output read"
                                );
                                if !self.sleep_unless_cancelled(delay).await {
                                    result.cancelled = true;
                                    break 'lifecycle;
                                }
                            }
                            RetryDecision::GiveUp => {
                                self.fail_misses(
                                    &misses,
                                    FailureKind::RetriesExhausted,
                                    &e.to_string(),
                                    &state,
                                    &mut result,
                                )
                                .await?;
                                break 'lifecycle;
                            }
                            RetryDecision::NotRetryable => {
                                self.fail_misses(
                                    &misses,
                                    FailureKind::Permanent,
                                    &e.to_string(),
                                    &state,
                                    &mut result,
                                )
                                .await?;
                                break 'lifecycle;
                            }
                            RetryDecision::Abort => return Err(AugmentError::Fatal(e)),
                        },
                    }
                },
                JobStatus::Failed => {
                    // A failed job commonly means preemption; classify
                    // transient and resubmit under the same retry state.
                    let err = FetchError::preempted(format!("batch job {} failed", handle.job_id));
                    match self.policy.decide(&mut state, err.class()) {
                        RetryDecision::Retry(delay) => {
                            tracing::debug!(
                                job_id = %handle.job_id,
                                attempt = state.attempt(),
                                delay_ms = delay.as_millis() as u64,
                                "resubmitting failed batch job"
                            );
                            if !self.sleep_unless_cancelled(delay).await {
                                result.cancelled = true;
                                break 'lifecycle;
                            }
                        }
                        // Transient decisions are Retry or GiveUp.
                        _ => {
                            self.fail_misses(
                                &misses,
                                FailureKind::RetriesExhausted,
                                &err.to_string(),
                                &state,
                                &mut result,
                            )
                            .await?;
                            break 'lifecycle;
                        }
                    }
                }
                JobStatus::Cancelled => {
                    self.fail_misses(
                        &misses,
                        FailureKind::Permanent,
                        &format!("batch job {} cancelled externally", handle.job_id),
                        &state,
                        &mut result,
                    )
                    .await?;
                    break 'lifecycle;
                }
                // The poll loop breaks only on terminal statuses.
                JobStatus::Submitted | JobStatus::Running => break 'lifecycle,
            }
        }

        Ok(result)
    }

    async fn serve_cache_hit(
        &self,
        item: &WorkItem,
        value: serde_json::Value,
        result: &mut ChunkResult,
    ) -> Result<(), AugmentError> {
        result.cache_hits += 1;
        self.events
            .emit(
                names::ITEM_CACHE_HIT,
                Some(json!({
                    "run_id": self.run_id,
                    "chunk_index": result.chunk_index,
                    "item_id": item.key,
                })),
            )
            .await;
        self.provenance
            .append(
                &item.key,
                self.fetcher.source(),
                details([(detail_keys::CACHE_HIT, json!(true))]),
            )
            .await?;
        result.values.insert(item.key.clone(), value);
        Ok(())
    }

    async fn record_item_failure(
        &self,
        item: &WorkItem,
        failure: ItemFailure,
        state: &RetryState,
        result: &mut ChunkResult,
    ) -> Result<(), AugmentError> {
        let retries = state.attempt().saturating_sub(1);
        if retries > 0 {
            result.retry_counts.insert(item.key.clone(), retries);
        }
        self.provenance
            .append(
                &item.key,
                self.fetcher.source(),
                details([
                    (detail_keys::ERROR, json!(failure.error)),
                    (detail_keys::FAILURE_KIND, json!(failure.kind.to_string())),
                    (detail_keys::ATTEMPTS, json!(state.attempt())),
                    (detail_keys::RETRIES, json!(retries)),
                ]),
            )
            .await?;
        self.events
            .emit(
                names::ITEM_FAILED,
                Some(json!({
                    "run_id": self.run_id,
                    "chunk_index": result.chunk_index,
                    "item_id": item.key,
                    "kind": failure.kind.to_string(),
                    "error": failure.error,
                })),
            )
            .await;
        tracing::warn!(
            item_id = %item.key,
            kind = %failure.kind,
            error = %failure.error,
            "item failed"
        );
        result.failures.push(failure);
        Ok(())
    }

    async fn fail_misses(
        &self,
        misses: &[WorkItem],
        kind: FailureKind,
        error: &str,
        state: &RetryState,
        result: &mut ChunkResult,
    ) -> Result<(), AugmentError> {
        for item in misses {
            let failure = match kind {
                FailureKind::Permanent => ItemFailure::permanent(&item.key, error),
                FailureKind::RetriesExhausted => ItemFailure::exhausted(&item.key, error),
            };
            self.record_item_failure(item, failure, state, result).await?;
        }
        Ok(())
    }

    async fn merge_job_output(
        &self,
        misses: &[WorkItem],
        handle: &JobHandle,
        output: BatchJobOutput,
        state: &RetryState,
        result: &mut ChunkResult,
    ) -> Result<(), AugmentError> {
        let BatchJobOutput {
            values,
            failures,
            retry_counts,
            fetches,
            provenance,
        } = output;
        let source = self.fetcher.source();

        result.fetches += fetches;

        // Job-level retries (resubmissions) re-ran every miss item; fold
        // them into each item's count on top of the job's own tally.
        let job_retries = state.attempt();
        for item in misses {
            let inside = retry_counts.get(&item.key).copied().unwrap_or(0);
            let total = inside + job_retries;
            if total > 0 {
                result.retry_counts.insert(item.key.clone(), total);
            }
        }

        for (key, value) in &values {
            self.cache.put(source, key, value.clone());
            self.events
                .emit(
                    names::ITEM_FETCHED,
                    Some(json!({
                        "run_id": self.run_id,
                        "chunk_index": result.chunk_index,
                        "item_id": key,
                        "job_id": handle.job_id,
                    })),
                )
                .await;
        }
        for failure in &failures {
            self.events
                .emit(
                    names::ITEM_FAILED,
                    Some(json!({
                        "run_id": self.run_id,
                        "chunk_index": result.chunk_index,
                        "item_id": failure.item_id,
                        "kind": failure.kind.to_string(),
                        "error": failure.error,
                        "job_id": handle.job_id,
                    })),
                )
                .await;
        }

        self.provenance.extend(provenance).await?;
        result.values.extend(values);
        result.failures.extend(failures);
        Ok(())
    }

    /// Sleeps for `delay` unless cancellation lands first.
    async fn sleep_unless_cancelled(&self, delay: Duration) -> bool {
        tokio::select! {
            () = tokio::time::sleep(delay) => true,
            () = self.cancel.cancelled() => false,
        }
    }

    async fn emit_chunk_started(&self, chunk: &Chunk, batch: bool) {
        self.events
            .emit(
                names::CHUNK_STARTED,
                Some(json!({
                    "run_id": self.run_id,
                    "chunk_index": chunk.index,
                    "items": chunk.len(),
                    "batch": batch,
                })),
            )
            .await;
    }

    async fn emit_chunk_outcome(&self, chunk: &Chunk, outcome: &Result<ChunkResult, AugmentError>) {
        match outcome {
            Ok(result) => {
                self.events
                    .emit(
                        names::CHUNK_COMPLETED,
                        Some(json!({
                            "run_id": self.run_id,
                            "chunk_index": chunk.index,
                            "resolved": result.resolved_items(),
                            "failed": result.failed_items(),
                            "cancelled": result.cancelled,
                        })),
                    )
                    .await;
            }
            Err(e) => {
                self.events
                    .emit(
                        names::CHUNK_FAILED,
                        Some(json!({
                            "run_id": self.run_id,
                            "chunk_index": chunk.index,
                            "error": e.to_string(),
                        })),
                    )
                    .await;
            }
        }
    }

    async fn emit_job_cancelled(&self, handle: &JobHandle, chunk_index: usize) {
        self.events
            .emit(
                names::JOB_CANCELLED,
                Some(json!({
                    "run_id": self.run_id,
                    "chunk_index": chunk_index,
                    "job_id": handle.job_id,
                    "reason": self.cancel.reason(),
                })),
            )
            .await;
    }
}
