//! Remote store collaborators: per-directory listing and single-file fetch.
//!
//! The snapshot engine only sees the [`RemoteStore`] trait. The production
//! implementation talks to the Dropbox HTTP API; tests use an in-memory fake.

pub mod dropbox;
pub mod error;
#[cfg(test)]
pub mod fake;
pub mod types;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::retry::{self, Pacer, RetryConfig};

pub use error::RemoteError;
pub use types::{FetchedFile, RemoteEntry};

/// Remote lister and fetcher.
///
/// This trait is object-safe and is shared as `Arc<dyn RemoteStore>` across
/// transfer workers.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// List the immediate children of a directory, in no particular order.
    ///
    /// An inaccessible path is an error, never an empty listing.
    async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError>;

    /// Download one file into `destination`, replacing any existing content.
    async fn fetch(&self, path: &str, destination: &Path) -> Result<FetchedFile, RemoteError>;
}

/// A [`RemoteStore`] wrapped in the retry policy and shared pacer.
#[derive(Clone)]
pub struct RetryingRemote {
    store: Arc<dyn RemoteStore>,
    retry: RetryConfig,
    pacer: Arc<Pacer>,
}

impl RetryingRemote {
    pub fn new(store: Arc<dyn RemoteStore>, retry: RetryConfig, pacer: Arc<Pacer>) -> Self {
        Self {
            store,
            retry,
            pacer,
        }
    }

    pub fn store(&self) -> &dyn RemoteStore {
        self.store.as_ref()
    }

    /// List with bounded retry; the last error escalates.
    pub async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        retry::retry_with_backoff(
            &self.retry,
            &self.pacer,
            RemoteError::retry_action,
            || self.store.list(path),
        )
        .await
    }

    /// Run an arbitrary remote operation under the same retry policy.
    pub async fn with_retry<F, Fut, T>(&self, operation: F) -> Result<T, RemoteError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, RemoteError>>,
    {
        retry::retry_with_backoff(&self.retry, &self.pacer, RemoteError::retry_action, operation)
            .await
    }
}
