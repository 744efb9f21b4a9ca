//! Module fetchers — resolve a CID to Wasm module bytes.
//!
//! Two interchangeable implementations: `GatewayFetcher` pulls from an IPFS
//! HTTP gateway under a request timeout and a hard size cap, `MirrorFetcher`
//! reads from a local directory. Failures are reported to the caller; neither
//! layer retries.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;

/// Request timeout applied to every gateway fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
/// Largest module the gateway fetcher will accept.
pub const DEFAULT_MAX_MODULE_BYTES: u64 = 64 << 20;

/// How many bytes of a non-200 response body end up in the error.
const ERROR_BODY_PREVIEW: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("ipfs gateway base url is empty")]
    EmptyBaseUrl,
    #[error("cid is empty")]
    EmptyCid,
    #[error("build http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("fetch {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("gateway {url} status {status}: {body}")]
    Status {
        url: String,
        status: StatusCode,
        body: String,
    },
    #[error("module larger than {limit} bytes")]
    Oversize { limit: u64 },
    #[error("module mirror directory not configured")]
    MirrorNotConfigured,
    #[error("read module {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Capability to fetch bytes addressed by a content identifier.
#[async_trait]
pub trait ModuleFetcher: Send + Sync {
    async fn fetch_module(&self, cid: &str) -> Result<Bytes, FetchError>;
}

// ── Gateway fetcher ───────────────────────────────────────────────────────────

/// Pulls modules through an IPFS HTTP gateway.
pub struct GatewayFetcher {
    base_url: String,
    client: reqwest::Client,
    max_bytes: u64,
}

impl GatewayFetcher {
    pub fn new(base_url: &str) -> Result<Self, FetchError> {
        Self::with_limits(base_url, DEFAULT_FETCH_TIMEOUT, DEFAULT_MAX_MODULE_BYTES)
    }

    /// Construct with explicit timeout and size cap.
    pub fn with_limits(
        base_url: &str,
        timeout: Duration,
        max_bytes: u64,
    ) -> Result<Self, FetchError> {
        let trimmed = base_url.trim();
        if trimmed.is_empty() {
            return Err(FetchError::EmptyBaseUrl);
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(FetchError::Client)?;
        Ok(Self {
            base_url: trimmed.trim_end_matches('/').to_string(),
            client,
            max_bytes,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl ModuleFetcher for GatewayFetcher {
    async fn fetch_module(&self, cid: &str) -> Result<Bytes, FetchError> {
        if cid.is_empty() {
            return Err(FetchError::EmptyCid);
        }
        let url = format!("{}/{}", self.base_url, cid.trim_start_matches('/'));

        let mut resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: url.clone(),
                source,
            })?;

        let status = resp.status();
        if status != StatusCode::OK {
            let body = read_body_preview(&mut resp).await;
            return Err(FetchError::Status { url, status, body });
        }

        let mut data: Vec<u8> = Vec::new();
        loop {
            let chunk = match resp.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(source) => return Err(FetchError::Request { url, source }),
            };
            if data.len() as u64 + chunk.len() as u64 > self.max_bytes {
                return Err(FetchError::Oversize {
                    limit: self.max_bytes,
                });
            }
            data.extend_from_slice(&chunk);
        }

        tracing::info!(cid, bytes = data.len(), "downloaded wasm module via ipfs gateway");
        Ok(Bytes::from(data))
    }
}

/// Read at most `ERROR_BODY_PREVIEW` bytes of a failed response's body.
async fn read_body_preview(resp: &mut reqwest::Response) -> String {
    let mut preview: Vec<u8> = Vec::with_capacity(ERROR_BODY_PREVIEW);
    while preview.len() < ERROR_BODY_PREVIEW {
        match resp.chunk().await {
            Ok(Some(chunk)) => {
                let take = chunk.len().min(ERROR_BODY_PREVIEW - preview.len());
                preview.extend_from_slice(&chunk[..take]);
            }
            Ok(None) | Err(_) => break,
        }
    }
    String::from_utf8_lossy(&preview).trim().to_string()
}

// ── Mirror fetcher ────────────────────────────────────────────────────────────

/// Reads modules from a local directory, one file per CID.
pub struct MirrorFetcher {
    dir: PathBuf,
}

impl MirrorFetcher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl ModuleFetcher for MirrorFetcher {
    async fn fetch_module(&self, cid: &str) -> Result<Bytes, FetchError> {
        if self.dir.as_os_str().is_empty() {
            return Err(FetchError::MirrorNotConfigured);
        }
        if cid.is_empty() {
            return Err(FetchError::EmptyCid);
        }
        let path = self.dir.join(cid);
        let data = tokio::fs::read(&path)
            .await
            .map_err(|source| FetchError::Read {
                path: path.clone(),
                source,
            })?;
        tracing::info!(cid, bytes = data.len(), "loaded wasm module from mirror");
        Ok(Bytes::from(data))
    }
}
