//! Error types for the augmentflow engine.
//!
//! Failures form a three-way taxonomy that drives retry behavior:
//! transient failures are retried with backoff, permanent failures fail
//! only the owning work item, and fatal failures abort the entire run.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a fetch failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Retryable with backoff (timeouts, rate limits, job preemption).
    Transient,
    /// Not retryable; fails the owning work item and nothing else.
    Permanent,
    /// Aborts the whole run (credentials, unavailable collaborator).
    Fatal,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// A classified failure raised by a fetch collaborator or the batch
/// transport.
///
/// The variant fixes the classification; there is no runtime inspection
/// of error causes anywhere downstream. Collaborators construct the
/// variant that matches what actually happened.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The fetch did not complete in time.
    #[error("fetch timed out: {0}")]
    Timeout(String),

    /// Network-level failure between the engine and the collaborator.
    #[error("network error: {0}")]
    Network(String),

    /// The collaborator asked the engine to slow down.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// An externally executed job was preempted before finishing.
    #[error("job preempted: {0}")]
    Preempted(String),

    /// The key is not something the collaborator can ever serve.
    #[error("invalid key '{key}': {message}")]
    InvalidKey {
        /// The rejected key.
        key: String,
        /// Why the key was rejected.
        message: String,
    },

    /// The collaborator has no value for this key.
    #[error("not found: {0}")]
    NotFound(String),

    /// The collaborator answered with something the engine cannot read.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Credential acquisition or validation failed.
    #[error("credential failure: {0}")]
    Credential(String),

    /// The collaborator itself is unreachable or misconfigured.
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
}

impl FetchError {
    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    /// Creates a rate-limit error.
    #[must_use]
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::RateLimited(message.into())
    }

    /// Creates a preemption error.
    #[must_use]
    pub fn preempted(message: impl Into<String>) -> Self {
        Self::Preempted(message.into())
    }

    /// Creates an invalid-key error.
    #[must_use]
    pub fn invalid_key(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Creates a malformed-response error.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedResponse(message.into())
    }

    /// Creates a credential error.
    #[must_use]
    pub fn credential(message: impl Into<String>) -> Self {
        Self::Credential(message.into())
    }

    /// Creates a collaborator-unavailable error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    /// Returns the retry classification of this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout(_) | Self::Network(_) | Self::RateLimited(_) | Self::Preempted(_) => {
                ErrorClass::Transient
            }
            Self::InvalidKey { .. } | Self::NotFound(_) | Self::MalformedResponse(_) => {
                ErrorClass::Permanent
            }
            Self::Credential(_) | Self::Unavailable(_) => ErrorClass::Fatal,
        }
    }

    /// Returns true if the error is retryable.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Returns true if the error fails only the owning item.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        self.class() == ErrorClass::Permanent
    }

    /// Returns true if the error aborts the run.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }
}

/// Error raised when a run configuration fails validation.
#[derive(Debug, Clone, Error)]
#[error("invalid config: {field} {message}")]
pub struct ConfigError {
    /// The offending field.
    pub field: &'static str,
    /// What is wrong with it.
    pub message: String,
}

impl ConfigError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// The top-level error type for engine operations.
#[derive(Debug, Error)]
pub enum AugmentError {
    /// Configuration rejected by validation.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A fatal collaborator failure that aborts the run.
    #[error("fatal fetch failure: {0}")]
    Fatal(FetchError),

    /// The provenance store became unavailable.
    #[error("provenance store unavailable: {0}")]
    Provenance(String),
}
