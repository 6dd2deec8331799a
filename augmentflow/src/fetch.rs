//! The fetch-source seam.
//!
//! A [`Fetcher`] turns an item key into an augmentation value. Sources are
//! external collaborators (HTTP APIs, databases, model endpoints); the
//! engine only sees this trait and the classified errors it returns.

use crate::errors::FetchError;
use async_trait::async_trait;
use std::future::Future;

/// A named source of augmentation values.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Stable name of the source, used for cache scoping and provenance.
    fn source(&self) -> &str;

    /// Fetches the value for one item key.
    ///
    /// Errors carry their own classification; the engine never inspects
    /// anything beyond [`FetchError::class`].
    async fn fetch(&self, key: &str) -> Result<serde_json::Value, FetchError>;
}

/// Adapter turning an async closure into a [`Fetcher`].
pub struct FnFetcher<F> {
    source: String,
    func: F,
}

impl<F, Fut> FnFetcher<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, FetchError>> + Send,
{
    /// Wraps a closure under a source name.
    pub fn new(source: impl Into<String>, func: F) -> Self {
        Self {
            source: source.into(),
            func,
        }
    }
}

impl<F> std::fmt::Debug for FnFetcher<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnFetcher")
            .field("source", &self.source)
            .finish()
    }
}

#[async_trait]
impl<F, Fut> Fetcher for FnFetcher<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, FetchError>> + Send,
{
    fn source(&self) -> &str {
        &self.source
    }

    async fn fetch(&self, key: &str) -> Result<serde_json::Value, FetchError> {
        (self.func)(key.to_string()).await
    }
}
