//! Batch-job submission and polling.
//!
//! When a run is configured for batch compute, each chunk is serialized and
//! handed to an external [`BatchCompute`] system instead of being fetched
//! item by item. The engine never interprets job content; it only drives
//! the job lifecycle: submit, poll at a fixed interval, read back output,
//! cancel best-effort.

use crate::errors::FetchError;
use crate::provenance::ProvenanceRecord;
use crate::work::{Chunk, ItemFailure};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle states of a batch job.
///
/// Transitions are forward-only: `Submitted -> Running -> terminal`, where
/// terminal is `Succeeded`, `Failed`, or `Cancelled`. `Running` may be
/// skipped when a job finishes between polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Accepted by the compute system, not yet running.
    Submitted,
    /// Executing.
    Running,
    /// Finished with output available.
    Succeeded,
    /// Finished unsuccessfully.
    Failed,
    /// Stopped before finishing.
    Cancelled,
}

impl JobStatus {
    /// Returns true for `Succeeded`, `Failed`, and `Cancelled`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Returns true when `next` is a legal report after `self`.
    ///
    /// Repeating the current status is legal (polls are idempotent);
    /// leaving a terminal state or moving back to `Submitted` is not.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }
        match self {
            Self::Submitted => true,
            Self::Running => next.is_terminal(),
            Self::Succeeded | Self::Failed | Self::Cancelled => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Submitted => write!(f, "submitted"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Handle to one submitted batch job, owned by a single chunk execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    /// Identifier assigned by the compute system.
    pub job_id: String,
    /// When the job was submitted.
    pub submitted_at: DateTime<Utc>,
    /// Last observed status.
    pub status: JobStatus,
    /// Where the output lives, when the compute system reports one.
    pub result_location: Option<String>,
}

impl JobHandle {
    /// Creates a handle for a freshly submitted job.
    #[must_use]
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            submitted_at: Utc::now(),
            status: JobStatus::Submitted,
            result_location: None,
        }
    }
}

/// External batch compute system.
///
/// Payloads are opaque strings in both directions; errors carry the usual
/// classification so submission and polling plug into the retry policy.
#[async_trait]
pub trait BatchCompute: Send + Sync {
    /// Submits a job and returns its id.
    async fn submit(&self, input: &str) -> Result<String, FetchError>;

    /// Reports the current status of a job.
    async fn status(&self, job_id: &str) -> Result<JobStatus, FetchError>;

    /// Returns the output of a succeeded job.
    async fn fetch_output(&self, job_id: &str) -> Result<String, FetchError>;

    /// Requests cancellation of a job.
    async fn cancel(&self, job_id: &str) -> Result<(), FetchError>;
}

/// What a batch job writes as its output: the chunk outcome plus the
/// provenance records produced while the job ran detached from the shared
/// store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchJobOutput {
    /// Fetched values keyed by item id.
    pub values: HashMap<String, serde_json::Value>,
    /// Items that failed terminally inside the job.
    pub failures: Vec<ItemFailure>,
    /// Retries performed per item inside the job.
    pub retry_counts: HashMap<String, u32>,
    /// Fetch calls the job made, retries included.
    pub fetches: u64,
    /// Chunk-local provenance, to be unioned into the shared store.
    pub provenance: Vec<ProvenanceRecord>,
}

impl BatchJobOutput {
    /// Serializes the output for the job transport.
    pub fn to_json(&self) -> Result<String, FetchError> {
        serde_json::to_string(self)
            .map_err(|e| FetchError::malformed(format!("failed to serialize job output: {e}")))
    }

    /// Parses output read back from the job transport.
    ///
    /// Undecodable output is a permanent protocol error.
    pub fn from_json(raw: &str) -> Result<Self, FetchError> {
        serde_json::from_str(raw)
            .map_err(|e| FetchError::malformed(format!("undecodable job output: {e}")))
    }
}

/// Drives the lifecycle of batch jobs over a [`BatchCompute`] backend.
#[derive(Clone)]
pub struct BatchJobAdapter {
    compute: Arc<dyn BatchCompute>,
    poll_interval: Duration,
}

impl std::fmt::Debug for BatchJobAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchJobAdapter")
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl BatchJobAdapter {
    /// Creates an adapter polling at the given fixed interval.
    #[must_use]
    pub fn new(compute: Arc<dyn BatchCompute>, poll_interval: Duration) -> Self {
        Self {
            compute,
            poll_interval,
        }
    }

    /// Returns the configured poll spacing.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Serializes a chunk and submits it as a job.
    pub async fn submit(&self, chunk: &Chunk) -> Result<JobHandle, FetchError> {
        let payload = serde_json::to_string(chunk)
            .map_err(|e| FetchError::malformed(format!("failed to serialize chunk: {e}")))?;
        let job_id = self.compute.submit(&payload).await?;
        tracing::debug!(
            job_id = %job_id,
            chunk_index = chunk.index,
            items = chunk.len(),
            "submitted batch job"
        );
        Ok(JobHandle::new(job_id))
    }

    /// Performs one status check and advances the handle.
    ///
    /// A backward report from the compute system violates the job protocol
    /// and surfaces as a permanent error.
    pub async fn poll(&self, handle: &mut JobHandle) -> Result<JobStatus, FetchError> {
        let reported = self.compute.status(&handle.job_id).await?;
        if !handle.status.can_transition_to(reported) {
            return Err(FetchError::malformed(format!(
                "job {} reported illegal transition {} -> {}",
                handle.job_id, handle.status, reported
            )));
        }
        if reported != handle.status {
            tracing::debug!(
                job_id = %handle.job_id,
                from = %handle.status,
                to = %reported,
                "batch job status changed"
            );
        }
        handle.status = reported;
        Ok(reported)
    }

    /// Reads back the output of a succeeded job.
    pub async fn fetch_result(&self, handle: &JobHandle) -> Result<BatchJobOutput, FetchError> {
        if handle.status != JobStatus::Succeeded {
            return Err(FetchError::malformed(format!(
                "result requested for job {} in status {}",
                handle.job_id, handle.status
            )));
        }
        let raw = self.compute.fetch_output(&handle.job_id).await?;
        BatchJobOutput::from_json(&raw)
    }

    /// Requests cancellation, swallowing backend errors.
    ///
    /// The handle is marked `Cancelled` either way; a job already terminal
    /// is left untouched.
    pub async fn cancel(&self, handle: &mut JobHandle) {
        if handle.status.is_terminal() {
            return;
        }
        if let Err(e) = self.compute.cancel(&handle.job_id).await {
            tracing::warn!(job_id = %handle.job_id, error = %e, "batch job cancel failed");
        }
        handle.status = JobStatus::Cancelled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::WorkItem;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    struct SeqCompute {
        statuses: Mutex<VecDeque<JobStatus>>,
        output: String,
        fail_cancel: bool,
    }

    impl SeqCompute {
        fn new(statuses: Vec<JobStatus>, output: &str) -> Self {
            Self {
                statuses: Mutex::new(statuses.into()),
                output: output.to_string(),
                fail_cancel: false,
            }
        }
    }

    #[async_trait]
    impl BatchCompute for SeqCompute {
        async fn submit(&self, _input: &str) -> Result<String, FetchError> {
            Ok("job-1".to_string())
        }

        async fn status(&self, _job_id: &str) -> Result<JobStatus, FetchError> {
            Ok(self
                .statuses
                .lock()
                .pop_front()
                .unwrap_or(JobStatus::Succeeded))
        }

        async fn fetch_output(&self, _job_id: &str) -> Result<String, FetchError> {
            Ok(self.output.clone())
        }

        async fn cancel(&self, _job_id: &str) -> Result<(), FetchError> {
            if self.fail_cancel {
                Err(FetchError::network("cancel endpoint down"))
            } else {
                Ok(())
            }
        }
    }

    fn chunk() -> Chunk {
        Chunk::new(0, vec![WorkItem::new("a"), WorkItem::new("b")])
    }

    #[test]
    fn test_forward_only_transitions() {
        use JobStatus::*;

        assert!(Submitted.can_transition_to(Running));
        assert!(Submitted.can_transition_to(Succeeded));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Running));
        assert!(!Running.can_transition_to(Submitted));
        assert!(!Succeeded.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Succeeded));
        assert!(!Cancelled.can_transition_to(Running));
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobStatus::Submitted.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[tokio::test]
    async fn test_submit_yields_submitted_handle() {
        let adapter = BatchJobAdapter::new(
            Arc::new(SeqCompute::new(vec![], "{}")),
            Duration::from_millis(10),
        );

        let handle = adapter.submit(&chunk()).await.unwrap();
        assert_eq!(handle.job_id, "job-1");
        assert_eq!(handle.status, JobStatus::Submitted);
    }

    #[tokio::test]
    async fn test_poll_advances_handle() {
        let compute = SeqCompute::new(
            vec![JobStatus::Running, JobStatus::Running, JobStatus::Succeeded],
            "{}",
        );
        let adapter = BatchJobAdapter::new(Arc::new(compute), Duration::from_millis(10));
        let mut handle = adapter.submit(&chunk()).await.unwrap();

        assert_eq!(adapter.poll(&mut handle).await.unwrap(), JobStatus::Running);
        assert_eq!(adapter.poll(&mut handle).await.unwrap(), JobStatus::Running);
        assert_eq!(
            adapter.poll(&mut handle).await.unwrap(),
            JobStatus::Succeeded
        );
        assert_eq!(handle.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_poll_rejects_backward_transition() {
        let compute = SeqCompute::new(vec![JobStatus::Running, JobStatus::Submitted], "{}");
        let adapter = BatchJobAdapter::new(Arc::new(compute), Duration::from_millis(10));
        let mut handle = adapter.submit(&chunk()).await.unwrap();

        adapter.poll(&mut handle).await.unwrap();
        let err = adapter.poll(&mut handle).await.unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn test_fetch_result_requires_success() {
        let adapter = BatchJobAdapter::new(
            Arc::new(SeqCompute::new(vec![], "{}")),
            Duration::from_millis(10),
        );
        let handle = adapter.submit(&chunk()).await.unwrap();

        let err = adapter.fetch_result(&handle).await.unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn test_fetch_result_round_trip() {
        let mut output = BatchJobOutput::default();
        output.values.insert("a".into(), serde_json::json!(1));
        output.retry_counts.insert("a".into(), 2);
        let raw = output.to_json().unwrap();

        let compute = SeqCompute::new(vec![JobStatus::Succeeded], &raw);
        let adapter = BatchJobAdapter::new(Arc::new(compute), Duration::from_millis(10));
        let mut handle = adapter.submit(&chunk()).await.unwrap();
        adapter.poll(&mut handle).await.unwrap();

        let read_back = adapter.fetch_result(&handle).await.unwrap();
        assert_eq!(read_back.values["a"], serde_json::json!(1));
        assert_eq!(read_back.retry_counts["a"], 2);
    }

    #[tokio::test]
    async fn test_malformed_output_is_permanent() {
        let compute = SeqCompute::new(vec![JobStatus::Succeeded], "not json");
        let adapter = BatchJobAdapter::new(Arc::new(compute), Duration::from_millis(10));
        let mut handle = adapter.submit(&chunk()).await.unwrap();
        adapter.poll(&mut handle).await.unwrap();

        let err = adapter.fetch_result(&handle).await.unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn test_cancel_swallows_backend_errors() {
        let mut compute = SeqCompute::new(vec![], "{}");
        compute.fail_cancel = true;
        let adapter = BatchJobAdapter::new(Arc::new(compute), Duration::from_millis(10));
        let mut handle = adapter.submit(&chunk()).await.unwrap();

        adapter.cancel(&mut handle).await;
        assert_eq!(handle.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_leaves_terminal_jobs_alone() {
        let compute = SeqCompute::new(vec![JobStatus::Succeeded], "{}");
        let adapter = BatchJobAdapter::new(Arc::new(compute), Duration::from_millis(10));
        let mut handle = adapter.submit(&chunk()).await.unwrap();
        adapter.poll(&mut handle).await.unwrap();

        adapter.cancel(&mut handle).await;
        assert_eq!(handle.status, JobStatus::Succeeded);
    }
}
