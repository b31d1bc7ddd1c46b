//! In-memory remote tree for tests, with scripted failures and call logs.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use super::types::{join_remote, normalize_remote_path, parent_remote};
use super::{FetchedFile, RemoteEntry, RemoteError, RemoteStore, RetryingRemote};
use crate::retry::{Pacer, RetryConfig};

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File {
        data: Vec<u8>,
        modified: DateTime<Utc>,
    },
}

/// Failure kinds a test can inject.
#[derive(Debug, Clone, Copy)]
pub enum Failure {
    Server,
    RateLimited(Option<Duration>),
    /// Fetch reports more bytes than it writes.
    Truncate,
}

impl Failure {
    fn to_error(self, path: &str) -> RemoteError {
        match self {
            Failure::Server => RemoteError::Server {
                status: 503,
                path: path.to_string(),
                retry_after: None,
            },
            Failure::RateLimited(retry_after) => RemoteError::RateLimited {
                path: path.to_string(),
                retry_after,
            },
            Failure::Truncate => RemoteError::Truncated {
                path: path.to_string(),
                expected: 1,
                received: 0,
            },
        }
    }
}

pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap()
}

/// Wrap a fake in a retry policy with no delays and no pacing.
pub fn retrying(fake: &Arc<FakeRemote>, max_attempts: u32) -> RetryingRemote {
    RetryingRemote::new(
        fake.clone(),
        RetryConfig {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        },
        Arc::new(Pacer::new(Duration::ZERO)),
    )
}

#[derive(Default)]
pub struct FakeRemote {
    nodes: Mutex<BTreeMap<String, Node>>,
    fetch_failures: Mutex<HashMap<String, (Failure, usize)>>,
    list_failures: Mutex<HashMap<String, (Failure, usize)>>,
    fetch_log: Mutex<Vec<String>>,
    list_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
}

impl FakeRemote {
    pub fn new() -> Self {
        let remote = Self::default();
        remote.nodes.lock().unwrap().insert("/".into(), Node::Dir);
        remote
    }

    pub fn add_dir(&self, path: &str) -> &Self {
        let path = normalize_remote_path(path);
        let mut nodes = self.nodes.lock().unwrap();
        let mut cur = path.as_str();
        while cur != "/" {
            nodes.entry(cur.to_string()).or_insert(Node::Dir);
            cur = parent_remote(cur);
        }
        self
    }

    pub fn add_file(&self, path: &str, data: &[u8], modified: DateTime<Utc>) -> &Self {
        let path = normalize_remote_path(path);
        self.add_dir(parent_remote(&path));
        self.nodes.lock().unwrap().insert(
            path,
            Node::File {
                data: data.to_vec(),
                modified,
            },
        );
        self
    }

    pub fn remove(&self, path: &str) -> &Self {
        let path = normalize_remote_path(path);
        let prefix = format!("{}/", path);
        self.nodes
            .lock()
            .unwrap()
            .retain(|k, _| *k != path && !k.starts_with(&prefix));
        self
    }

    pub fn fail_fetch(&self, path: &str, failure: Failure, times: usize) {
        self.fetch_failures
            .lock()
            .unwrap()
            .insert(path.to_string(), (failure, times));
    }

    pub fn fail_list(&self, path: &str, failure: Failure, times: usize) {
        self.list_failures
            .lock()
            .unwrap()
            .insert(path.to_string(), (failure, times));
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetch_log.lock().unwrap().clone()
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    fn take_failure(
        table: &Mutex<HashMap<String, (Failure, usize)>>,
        path: &str,
    ) -> Option<Failure> {
        let mut table = table.lock().unwrap();
        let slot = table.get_mut(path)?;
        if slot.1 == 0 {
            return None;
        }
        slot.1 -= 1;
        Some(slot.0)
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let path = normalize_remote_path(path);
        if let Some(failure) = Self::take_failure(&self.list_failures, &path) {
            return Err(failure.to_error(&path));
        }
        let nodes = self.nodes.lock().unwrap();
        match nodes.get(&path) {
            Some(Node::Dir) => {}
            _ => return Err(RemoteError::NotFound(path)),
        }
        // Reverse order: callers must not rely on listing order.
        let mut entries: Vec<RemoteEntry> = nodes
            .iter()
            .filter(|(k, _)| k.as_str() != "/" && parent_remote(k) == path)
            .map(|(k, node)| {
                let name = k.rsplit('/').next().unwrap_or_default();
                let full = join_remote(&path, name);
                match node {
                    Node::Dir => RemoteEntry::directory(full),
                    Node::File { data, modified } => {
                        RemoteEntry::file(full, data.len() as u64, *modified)
                    }
                }
            })
            .collect();
        entries.reverse();
        Ok(entries)
    }

    async fn fetch(&self, path: &str, destination: &Path) -> Result<FetchedFile, RemoteError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let failure = Self::take_failure(&self.fetch_failures, path);
        let node = self.nodes.lock().unwrap().get(path).cloned();
        let (data, modified) = match node {
            Some(Node::File { data, modified }) => (data, modified),
            _ => return Err(RemoteError::NotFound(path.to_string())),
        };
        match failure {
            Some(Failure::Truncate) => {
                // Leave a short body behind and claim the full size.
                let half = &data[..data.len() / 2];
                tokio::fs::write(destination, half)
                    .await
                    .map_err(|source| RemoteError::Io {
                        path: destination.to_path_buf(),
                        source,
                    })?;
                return Ok(FetchedFile {
                    size: data.len() as u64,
                    modified_at: Some(modified),
                });
            }
            Some(f) => return Err(f.to_error(path)),
            None => {}
        }
        tokio::fs::write(destination, &data)
            .await
            .map_err(|source| RemoteError::Io {
                path: destination.to_path_buf(),
                source,
            })?;
        self.fetch_log.lock().unwrap().push(path.to_string());
        Ok(FetchedFile {
            size: data.len() as u64,
            modified_at: Some(modified),
        })
    }
}
