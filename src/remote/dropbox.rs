//! Dropbox HTTP API v2 implementation of [`RemoteStore`].

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use super::types::{join_remote, normalize_remote_path};
use super::{FetchedFile, RemoteEntry, RemoteError, RemoteStore};

const API_URL: &str = "https://api.dropboxapi.com/2";
const CONTENT_URL: &str = "https://content.dropboxapi.com/2";

/// Dropbox hashes content in 4 MiB blocks, then hashes the concatenated block digests.
const HASH_BLOCK_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct ListFolderResponse {
    entries: Vec<DropboxEntry>,
    cursor: String,
    has_more: bool,
}

#[derive(Debug, Deserialize)]
#[serde(tag = ".tag", rename_all = "lowercase")]
enum DropboxEntry {
    File {
        name: String,
        size: u64,
        server_modified: DateTime<Utc>,
    },
    Folder {
        name: String,
    },
    Deleted {
        #[allow(dead_code)]
        name: String,
    },
}

impl DropboxEntry {
    /// Convert to a [`RemoteEntry`] rooted at the listed parent.
    fn into_remote(self, parent: &str) -> Option<RemoteEntry> {
        match self {
            DropboxEntry::File {
                name,
                size,
                server_modified,
            } => Some(RemoteEntry::file(
                join_remote(parent, &name),
                size,
                server_modified,
            )),
            DropboxEntry::Folder { name } => Some(RemoteEntry::directory(join_remote(parent, &name))),
            DropboxEntry::Deleted { .. } => None,
        }
    }
}

/// Metadata carried in the `Dropbox-API-Result` header of a download.
#[derive(Debug, Deserialize)]
struct DownloadResult {
    size: u64,
    server_modified: Option<DateTime<Utc>>,
    content_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AccountName {
    pub display_name: String,
}

#[derive(Debug, Deserialize)]
pub struct Account {
    pub email: String,
    pub name: AccountName,
}

/// Authenticated Dropbox API client.
pub struct DropboxClient {
    client: Client,
    token: String,
    api_url: String,
    content_url: String,
}

impl std::fmt::Debug for DropboxClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DropboxClient")
            .field("token", &"<redacted>")
            .field("api_url", &self.api_url)
            .finish_non_exhaustive()
    }
}

impl DropboxClient {
    pub fn new(token: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .read_timeout(timeout)
            .user_agent(concat!("dsnapshot/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            token: token.to_string(),
            api_url: API_URL.to_string(),
            content_url: CONTENT_URL.to_string(),
        })
    }

    /// Fetch the account the token belongs to.
    pub async fn current_account(&self) -> Result<Account, RemoteError> {
        let resp = self
            .client
            .post(format!("{}/users/get_current_account", self.api_url))
            .bearer_auth(&self.token)
            .header(CONTENT_TYPE, "application/json")
            .body("null")
            .send()
            .await
            .map_err(|e| transport_error("/", e))?;
        parse_json(resp, "/").await
    }

    async fn rpc<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        path: &str,
        body: &Value,
    ) -> Result<T, RemoteError> {
        let resp = self
            .client
            .post(format!("{}/{}", self.api_url, endpoint))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(path, e))?;
        parse_json(resp, path).await
    }
}

#[async_trait]
impl RemoteStore for DropboxClient {
    async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        let path = normalize_remote_path(path);
        // The API addresses the root as the empty string.
        let api_path = if path == "/" { "" } else { path.as_str() };

        let mut page: ListFolderResponse = self
            .rpc(
                "files/list_folder",
                &path,
                &json!({ "path": api_path, "recursive": false, "include_deleted": false }),
            )
            .await?;

        let mut entries = Vec::new();
        loop {
            entries.extend(page.entries.into_iter().filter_map(|e| e.into_remote(&path)));
            if !page.has_more {
                break;
            }
            page = self
                .rpc(
                    "files/list_folder/continue",
                    &path,
                    &json!({ "cursor": page.cursor }),
                )
                .await?;
        }

        tracing::debug!(path = %path, count = entries.len(), "listed remote folder");
        Ok(entries)
    }

    async fn fetch(&self, path: &str, destination: &Path) -> Result<FetchedFile, RemoteError> {
        let arg = header_safe_json(&json!({ "path": path }).to_string());
        let resp = self
            .client
            .post(format!("{}/files/download", self.content_url))
            .bearer_auth(&self.token)
            .header("Dropbox-API-Arg", arg)
            .send()
            .await
            .map_err(|e| transport_error(path, e))?;

        if !resp.status().is_success() {
            return Err(error_from_response(resp, path).await);
        }

        let meta: DownloadResult = resp
            .headers()
            .get("Dropbox-API-Result")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| RemoteError::InvalidResponse {
                path: path.to_string(),
                message: "missing Dropbox-API-Result header".into(),
            })
            .and_then(|raw| {
                serde_json::from_str(raw).map_err(|e| RemoteError::InvalidResponse {
                    path: path.to_string(),
                    message: e.to_string(),
                })
            })?;

        let io_err = |source| RemoteError::Io {
            path: destination.to_path_buf(),
            source,
        };
        let mut file = tokio::fs::File::create(destination).await.map_err(io_err)?;

        let mut hasher = ContentHasher::new();
        let mut received: u64 = 0;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| transport_error(path, e))?;
            hasher.update(&chunk);
            file.write_all(&chunk).await.map_err(io_err)?;
            received += chunk.len() as u64;
        }
        file.flush().await.map_err(io_err)?;
        drop(file);

        if received != meta.size {
            return Err(RemoteError::Truncated {
                path: path.to_string(),
                expected: meta.size,
                received,
            });
        }
        if let Some(expected) = &meta.content_hash {
            if !hasher.finish().eq_ignore_ascii_case(expected) {
                return Err(RemoteError::HashMismatch(path.to_string()));
            }
        }

        Ok(FetchedFile {
            size: received,
            modified_at: meta.server_modified,
        })
    }
}

async fn parse_json<T: DeserializeOwned>(resp: Response, path: &str) -> Result<T, RemoteError> {
    if !resp.status().is_success() {
        return Err(error_from_response(resp, path).await);
    }
    resp.json::<T>()
        .await
        .map_err(|e| RemoteError::InvalidResponse {
            path: path.to_string(),
            message: e.to_string(),
        })
}

fn transport_error(path: &str, source: reqwest::Error) -> RemoteError {
    if source.is_timeout() {
        RemoteError::Timeout {
            path: path.to_string(),
        }
    } else {
        RemoteError::Transport {
            path: path.to_string(),
            source,
        }
    }
}

async fn error_from_response(resp: Response, path: &str) -> RemoteError {
    let status = resp.status().as_u16();
    let header_hint = retry_after_header(resp.headers());
    let body = resp.text().await.unwrap_or_default();
    classify_status(status, path, header_hint, &body)
}

fn retry_after_header(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Map an HTTP error status and body onto the remote error taxonomy.
fn classify_status(
    status: u16,
    path: &str,
    header_hint: Option<Duration>,
    body: &str,
) -> RemoteError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let body_hint = parsed
        .as_ref()
        .and_then(|v| v.pointer("/error/retry_after"))
        .and_then(Value::as_u64)
        .map(Duration::from_secs);
    let summary = parsed
        .as_ref()
        .and_then(|v| v.get("error_summary"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body.trim().chars().take(200).collect());

    match status {
        429 => RemoteError::RateLimited {
            path: path.to_string(),
            retry_after: header_hint.or(body_hint),
        },
        500..=599 => RemoteError::Server {
            status,
            path: path.to_string(),
            retry_after: header_hint,
        },
        401 | 403 => RemoteError::Unauthorized(format!("{}: {}", path, summary)),
        409 if summary.contains("not_found") => RemoteError::NotFound(path.to_string()),
        _ => RemoteError::Api {
            status,
            path: path.to_string(),
            message: summary,
        },
    }
}

/// `Dropbox-API-Arg` must be ASCII; escape everything else as JSON `\uXXXX`.
fn header_safe_json(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii() && c != '\x7f' {
            out.push(c);
        } else {
            let mut buf = [0u16; 2];
            for unit in c.encode_utf16(&mut buf) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}

/// Incremental Dropbox content hash.
struct ContentHasher {
    overall: Sha256,
    block: Sha256,
    block_len: usize,
}

impl ContentHasher {
    fn new() -> Self {
        Self {
            overall: Sha256::new(),
            block: Sha256::new(),
            block_len: 0,
        }
    }

    fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let take = (HASH_BLOCK_SIZE - self.block_len).min(data.len());
            self.block.update(&data[..take]);
            self.block_len += take;
            data = &data[take..];
            if self.block_len == HASH_BLOCK_SIZE {
                let digest = std::mem::replace(&mut self.block, Sha256::new()).finalize();
                self.overall.update(digest);
                self.block_len = 0;
            }
        }
    }

    fn finish(mut self) -> String {
        if self.block_len > 0 {
            let digest = self.block.finalize();
            self.overall.update(digest);
        }
        self.overall
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}
