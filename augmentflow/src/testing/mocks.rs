//! Mock fetchers and an in-process batch compute backend.

use crate::batch::{BatchCompute, BatchJobOutput, JobStatus};
use crate::errors::FetchError;
use crate::fetch::Fetcher;
use crate::provenance::{detail_keys, ProvenanceRecord};
use crate::retry::{RetryDecision, RetryPolicy, RetryState};
use crate::work::{Chunk, ItemFailure};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Fetcher driven by per-key outcome scripts.
///
/// Each call for a key consumes the next scripted outcome; once a key's
/// script is exhausted (or was never set) the fetcher succeeds with a
/// deterministic value. Calls are counted per key.
pub struct ScriptedFetcher {
    source: String,
    scripts: Mutex<HashMap<String, VecDeque<Result<serde_json::Value, FetchError>>>>,
    calls: Mutex<HashMap<String, u32>>,
}

impl ScriptedFetcher {
    /// Creates a fetcher under the given source name.
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Queues outcomes for a key, consumed in order.
    pub fn script<I>(&self, key: impl Into<String>, outcomes: I)
    where
        I: IntoIterator<Item = Result<serde_json::Value, FetchError>>,
    {
        self.scripts
            .lock()
            .entry(key.into())
            .or_default()
            .extend(outcomes);
    }

    /// Number of fetch calls made for a key.
    #[must_use]
    pub fn call_count(&self, key: &str) -> u32 {
        self.calls.lock().get(key).copied().unwrap_or(0)
    }

    /// Number of fetch calls made across all keys.
    #[must_use]
    pub fn total_calls(&self) -> u64 {
        self.calls.lock().values().map(|&c| u64::from(c)).sum()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    fn source(&self) -> &str {
        &self.source
    }

    async fn fetch(&self, key: &str) -> Result<serde_json::Value, FetchError> {
        *self.calls.lock().entry(key.to_string()).or_insert(0) += 1;

        if let Some(queue) = self.scripts.lock().get_mut(key) {
            if let Some(outcome) = queue.pop_front() {
                return outcome;
            }
        }
        Ok(json!({ "key": key, "source": self.source }))
    }
}

/// Fetcher that returns the same value for every key.
pub struct StaticFetcher {
    source: String,
    value: serde_json::Value,
    calls: AtomicU64,
}

impl StaticFetcher {
    /// Creates a fetcher returning `value` for any key.
    #[must_use]
    pub fn new(source: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            source: source.into(),
            value,
            calls: AtomicU64::new(0),
        }
    }

    /// Number of fetch calls made.
    #[must_use]
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for StaticFetcher {
    fn source(&self) -> &str {
        &self.source
    }

    async fn fetch(&self, _key: &str) -> Result<serde_json::Value, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.value.clone())
    }
}

/// Fetcher that fails every call with a caller-supplied error.
pub struct FailingFetcher {
    source: String,
    make_error: Box<dyn Fn() -> FetchError + Send + Sync>,
    calls: AtomicU64,
}

impl FailingFetcher {
    /// Creates a fetcher whose every call fails with `make_error()`.
    pub fn new<F>(source: impl Into<String>, make_error: F) -> Self
    where
        F: Fn() -> FetchError + Send + Sync + 'static,
    {
        Self {
            source: source.into(),
            make_error: Box::new(make_error),
            calls: AtomicU64::new(0),
        }
    }

    /// Number of fetch calls made.
    #[must_use]
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for FailingFetcher {
    fn source(&self) -> &str {
        &self.source
    }

    async fn fetch(&self, _key: &str) -> Result<serde_json::Value, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err((self.make_error)())
    }
}

struct InProcessJob {
    polls_left: u32,
    terminal: JobStatus,
    output: Option<String>,
    cancelled: bool,
}

/// Batch compute that executes submitted chunks in process.
///
/// Submitted payloads are decoded as chunks and resolved against the wrapped
/// fetcher immediately; polling then walks the job through `Running` for a
/// configurable number of polls before reporting the terminal status. Fault
/// injection covers rejected submissions, failed jobs, and externally
/// cancelled jobs.
pub struct InProcessBatchCompute {
    fetcher: Arc<dyn Fetcher>,
    policy: RetryPolicy,
    running_polls: u32,
    jobs: Mutex<HashMap<String, InProcessJob>>,
    next_job: AtomicU64,
    submissions: AtomicU64,
    cancel_requests: AtomicU64,
    fail_submissions: AtomicU32,
    fail_jobs: AtomicU32,
    cancel_jobs: AtomicU32,
}

impl InProcessBatchCompute {
    /// Creates a compute backend resolving jobs against `fetcher`.
    #[must_use]
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            fetcher,
            policy: RetryPolicy::new().with_jitter(false),
            running_polls: 1,
            jobs: Mutex::new(HashMap::new()),
            next_job: AtomicU64::new(0),
            submissions: AtomicU64::new(0),
            cancel_requests: AtomicU64::new(0),
            fail_submissions: AtomicU32::new(0),
            fail_jobs: AtomicU32::new(0),
            cancel_jobs: AtomicU32::new(0),
        }
    }

    /// Sets the retry policy jobs apply internally.
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets how many polls report `Running` before the terminal status.
    #[must_use]
    pub fn with_running_polls(mut self, polls: u32) -> Self {
        self.running_polls = polls;
        self
    }

    /// Rejects the next `n` submissions with a transient error.
    pub fn fail_next_submissions(&self, n: u32) {
        self.fail_submissions.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` jobs finish `Failed` without output.
    pub fn fail_next_jobs(&self, n: u32) {
        self.fail_jobs.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` jobs finish `Cancelled` (externally) without output.
    pub fn cancel_next_jobs(&self, n: u32) {
        self.cancel_jobs.store(n, Ordering::SeqCst);
    }

    /// Total submit calls, rejected ones included.
    #[must_use]
    pub fn submissions(&self) -> u64 {
        self.submissions.load(Ordering::SeqCst)
    }

    /// Jobs actually created.
    #[must_use]
    pub fn jobs_created(&self) -> u64 {
        self.next_job.load(Ordering::SeqCst)
    }

    /// Cancel calls received.
    #[must_use]
    pub fn cancel_requests(&self) -> u64 {
        self.cancel_requests.load(Ordering::SeqCst)
    }

    fn take_injection(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn run_chunk(&self, chunk: &Chunk) -> Option<BatchJobOutput> {
        let mut output = BatchJobOutput::default();
        let source = self.fetcher.source().to_string();

        for item in &chunk.items {
            let mut state = RetryState::new();
            loop {
                output.fetches += 1;
                match self.fetcher.fetch(&item.key).await {
                    Ok(value) => {
                        let retries = state.attempt();
                        if retries > 0 {
                            output.retry_counts.insert(item.key.clone(), retries);
                        }
                        output.provenance.push(
                            ProvenanceRecord::new(&item.key, &source)
                                .with_detail(detail_keys::ATTEMPTS, json!(retries + 1))
                                .with_detail(detail_keys::RETRIES, json!(retries)),
                        );
                        output.values.insert(item.key.clone(), value);
                        break;
                    }
                    Err(e) => match self.policy.decide(&mut state, e.class()) {
                        // Jobs run detached; retries apply no backoff here.
                        RetryDecision::Retry(_) => {}
                        RetryDecision::GiveUp => {
                            let retries = state.attempt().saturating_sub(1);
                            if retries > 0 {
                                output.retry_counts.insert(item.key.clone(), retries);
                            }
                            output.provenance.push(
                                ProvenanceRecord::new(&item.key, &source)
                                    .with_detail(detail_keys::ERROR, json!(e.to_string()))
                                    .with_detail(detail_keys::FAILURE_KIND, json!("retries_exhausted")),
                            );
                            output
                                .failures
                                .push(ItemFailure::exhausted(&item.key, e.to_string()));
                            break;
                        }
                        RetryDecision::NotRetryable => {
                            output.provenance.push(
                                ProvenanceRecord::new(&item.key, &source)
                                    .with_detail(detail_keys::ERROR, json!(e.to_string()))
                                    .with_detail(detail_keys::FAILURE_KIND, json!("permanent")),
                            );
                            output
                                .failures
                                .push(ItemFailure::permanent(&item.key, e.to_string()));
                            break;
                        }
                        // A fatal error fails the whole job.
                        RetryDecision::Abort => return None,
                    },
                }
            }
        }
        Some(output)
    }
}

#[async_trait]
impl BatchCompute for InProcessBatchCompute {
    async fn submit(&self, input: &str) -> Result<String, FetchError> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        if Self::take_injection(&self.fail_submissions) {
            return Err(FetchError::network("injected submission failure"));
        }

        let chunk: Chunk = serde_json::from_str(input)
            .map_err(|e| FetchError::malformed(format!("undecodable job input: {e}")))?;

        let (terminal, output) = if Self::take_injection(&self.fail_jobs) {
            (JobStatus::Failed, None)
        } else if Self::take_injection(&self.cancel_jobs) {
            (JobStatus::Cancelled, None)
        } else {
            match self.run_chunk(&chunk).await {
                Some(output) => (JobStatus::Succeeded, Some(output.to_json()?)),
                None => (JobStatus::Failed, None),
            }
        };

        let job_id = format!("job-{}", self.next_job.fetch_add(1, Ordering::SeqCst));
        self.jobs.lock().insert(
            job_id.clone(),
            InProcessJob {
                polls_left: self.running_polls,
                terminal,
                output,
                cancelled: false,
            },
        );
        Ok(job_id)
    }

    async fn status(&self, job_id: &str) -> Result<JobStatus, FetchError> {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| FetchError::invalid_key(job_id, "unknown job"))?;

        if job.cancelled {
            return Ok(JobStatus::Cancelled);
        }
        if job.polls_left > 0 {
            job.polls_left -= 1;
            return Ok(JobStatus::Running);
        }
        Ok(job.terminal)
    }

    async fn fetch_output(&self, job_id: &str) -> Result<String, FetchError> {
        let jobs = self.jobs.lock();
        let job = jobs
            .get(job_id)
            .ok_or_else(|| FetchError::invalid_key(job_id, "unknown job"))?;
        job.output
            .clone()
            .ok_or_else(|| FetchError::malformed(format!("job {job_id} has no output")))
    }

    async fn cancel(&self, job_id: &str) -> Result<(), FetchError> {
        self.cancel_requests.fetch_add(1, Ordering::SeqCst);
        if let Some(job) = self.jobs.lock().get_mut(job_id) {
            job.cancelled = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::keyed_items;

    #[tokio::test]
    async fn test_scripted_fetcher_consumes_script_then_defaults() {
        let fetcher = ScriptedFetcher::new("geo");
        fetcher.script(
            "a",
            [
                Err(FetchError::timeout("slow")),
                Ok(json!(1)),
            ],
        );

        assert!(fetcher.fetch("a").await.is_err());
        assert_eq!(fetcher.fetch("a").await.unwrap(), json!(1));
        // Script exhausted: deterministic default success.
        assert!(fetcher.fetch("a").await.is_ok());
        assert_eq!(fetcher.call_count("a"), 3);
        assert_eq!(fetcher.call_count("b"), 0);
    }

    #[tokio::test]
    async fn test_static_and_failing_fetchers_count_calls() {
        let ok = StaticFetcher::new("geo", json!(7));
        ok.fetch("x").await.unwrap();
        ok.fetch("y").await.unwrap();
        assert_eq!(ok.calls(), 2);

        let bad = FailingFetcher::new("geo", || FetchError::not_found("gone"));
        assert!(bad.fetch("x").await.unwrap_err().is_permanent());
        assert_eq!(bad.calls(), 1);
    }

    #[tokio::test]
    async fn test_in_process_compute_round_trip() {
        let fetcher = Arc::new(StaticFetcher::new("geo", json!({"ok": true})));
        let compute = InProcessBatchCompute::new(fetcher);

        let chunk = Chunk::new(0, keyed_items(&["a", "b"]));
        let payload = serde_json::to_string(&chunk).unwrap();
        let job_id = compute.submit(&payload).await.unwrap();

        assert_eq!(compute.status(&job_id).await.unwrap(), JobStatus::Running);
        assert_eq!(compute.status(&job_id).await.unwrap(), JobStatus::Succeeded);

        let raw = compute.fetch_output(&job_id).await.unwrap();
        let output = BatchJobOutput::from_json(&raw).unwrap();
        assert_eq!(output.values.len(), 2);
        assert_eq!(output.fetches, 2);
        assert_eq!(output.provenance.len(), 2);
    }

    #[tokio::test]
    async fn test_in_process_compute_fault_injection() {
        let fetcher = Arc::new(StaticFetcher::new("geo", json!(1)));
        let compute = InProcessBatchCompute::new(fetcher).with_running_polls(0);
        let chunk = Chunk::new(0, keyed_items(&["a"]));
        let payload = serde_json::to_string(&chunk).unwrap();

        compute.fail_next_submissions(1);
        assert!(compute.submit(&payload).await.unwrap_err().is_transient());

        compute.fail_next_jobs(1);
        let failed = compute.submit(&payload).await.unwrap();
        assert_eq!(compute.status(&failed).await.unwrap(), JobStatus::Failed);

        compute.cancel_next_jobs(1);
        let cancelled = compute.submit(&payload).await.unwrap();
        assert_eq!(
            compute.status(&cancelled).await.unwrap(),
            JobStatus::Cancelled
        );

        assert_eq!(compute.submissions(), 3);
        assert_eq!(compute.jobs_created(), 2);
    }

    #[tokio::test]
    async fn test_in_process_compute_cancel_marks_job() {
        let fetcher = Arc::new(StaticFetcher::new("geo", json!(1)));
        let compute = InProcessBatchCompute::new(fetcher).with_running_polls(5);
        let chunk = Chunk::new(0, keyed_items(&["a"]));
        let job_id = compute
            .submit(&serde_json::to_string(&chunk).unwrap())
            .await
            .unwrap();

        compute.cancel(&job_id).await.unwrap();
        assert_eq!(
            compute.status(&job_id).await.unwrap(),
            JobStatus::Cancelled
        );
        assert_eq!(compute.cancel_requests(), 1);
    }
}
