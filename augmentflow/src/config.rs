//! Run configuration.

use crate::cache::CacheConfig;
use crate::errors::ConfigError;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a single orchestration run.
///
/// All fields have sensible defaults; construct with [`RunConfig::new`] and
/// override per run with the `with_*` builders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Maximum number of items per chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Maximum number of chunks resolved concurrently.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Route chunks through the batch compute backend instead of direct fetches.
    #[serde(default)]
    pub use_batch_compute: bool,
    /// Fraction of failed items (over resolved items) that aborts the run.
    #[serde(default = "default_max_failure_ratio")]
    pub max_failure_ratio: f64,
    /// Retry policy applied to transient fetch failures.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Fetch cache sizing and expiry.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Overall wall-clock budget for the run, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_timeout_ms: Option<u64>,
    /// Interval between batch job status polls, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_chunk_size() -> usize {
    32
}

fn default_max_concurrency() -> usize {
    4
}

fn default_max_failure_ratio() -> f64 {
    0.5
}

fn default_poll_interval_ms() -> u64 {
    2000
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_concurrency: default_max_concurrency(),
            use_batch_compute: false,
            max_failure_ratio: default_max_failure_ratio(),
            retry: RetryPolicy::default(),
            cache: CacheConfig::default(),
            run_timeout_ms: None,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl RunConfig {
    /// Creates a configuration with the documented defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the chunk size.
    #[must_use]
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    /// Sets the chunk concurrency limit.
    #[must_use]
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = limit;
        self
    }

    /// Routes chunks through the batch compute backend.
    #[must_use]
    pub fn with_batch_compute(mut self, enabled: bool) -> Self {
        self.use_batch_compute = enabled;
        self
    }

    /// Sets the failure ratio beyond which the run aborts.
    #[must_use]
    pub fn with_max_failure_ratio(mut self, ratio: f64) -> Self {
        self.max_failure_ratio = ratio;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the cache configuration.
    #[must_use]
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Sets the overall run timeout.
    #[must_use]
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Sets the batch job poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Returns the run timeout as a [`Duration`], if configured.
    #[must_use]
    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_ms.map(Duration::from_millis)
    }

    /// Returns the poll interval as a [`Duration`].
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Validates the configuration, including nested policies.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::new("chunk_size", "must be >= 1"));
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::new("max_concurrency", "must be >= 1"));
        }
        if !(0.0..=1.0).contains(&self.max_failure_ratio) {
            return Err(ConfigError::new("max_failure_ratio", "must be in [0, 1]"));
        }
        if self.run_timeout_ms == Some(0) {
            return Err(ConfigError::new("run_timeout_ms", "must be > 0 when set"));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::new("poll_interval_ms", "must be > 0"));
        }
        self.retry.validate()?;
        self.cache.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RunConfig::default();
        assert_eq!(config.chunk_size, 32);
        assert_eq!(config.max_concurrency, 4);
        assert!(!config.use_batch_compute);
        assert!((config.max_failure_ratio - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.run_timeout(), None);
        assert_eq!(config.poll_interval(), Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_chain() {
        let config = RunConfig::new()
            .with_chunk_size(10)
            .with_max_concurrency(2)
            .with_batch_compute(true)
            .with_max_failure_ratio(0.25)
            .with_run_timeout(Duration::from_secs(30))
            .with_poll_interval(Duration::from_millis(50));

        assert_eq!(config.chunk_size, 10);
        assert_eq!(config.max_concurrency, 2);
        assert!(config.use_batch_compute);
        assert!((config.max_failure_ratio - 0.25).abs() < f64::EPSILON);
        assert_eq!(config.run_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.poll_interval(), Duration::from_millis(50));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_chunk_size() {
        let err = RunConfig::new().with_chunk_size(0).validate();
        assert!(err.is_err());
    }

    #[test]
    fn test_validation_rejects_zero_concurrency() {
        assert!(RunConfig::new().with_max_concurrency(0).validate().is_err());
    }

    #[test]
    fn test_validation_rejects_out_of_range_ratio() {
        assert!(RunConfig::new()
            .with_max_failure_ratio(1.5)
            .validate()
            .is_err());
        assert!(RunConfig::new()
            .with_max_failure_ratio(-0.1)
            .validate()
            .is_err());
    }

    #[test]
    fn test_validation_covers_nested_retry() {
        let config = RunConfig::new().with_retry(RetryPolicy::new().with_max_attempts(0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: RunConfig = serde_json::from_str(r#"{"chunk_size": 8}"#)
            .unwrap_or_else(|e| panic!("deserialization failed: {e}"));
        assert_eq!(config.chunk_size, 8);
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.retry.max_attempts, 5);
    }
}
