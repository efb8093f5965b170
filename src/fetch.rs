use std::collections::HashMap;
use std::io::Read as _;
use std::path::Path;
use std::sync::Mutex;

use crate::foundation::error::RenderError;

/// Why a single fetch failed, before it is attributed to a named resource.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    /// The server answered with a non-2xx status.
    #[error("HTTP {0}")]
    Status(u16),
    /// Connection, I/O or local file failure.
    #[error("{0}")]
    Transport(String),
}

impl FetchFailure {
    /// Attach the resource name (e.g. `"track 2 (https://..)"`) to produce the caller-facing error.
    pub fn into_render_error(self, resource: impl Into<String>) -> RenderError {
        let resource = resource.into();
        match self {
            FetchFailure::Status(status) => RenderError::Network { resource, status },
            FetchFailure::Transport(msg) => {
                RenderError::fetch(format!("failed to fetch {resource}: {msg}"))
            }
        }
    }
}

/// Source of raw bytes for cover images and audio tracks.
///
/// Implementations must be shareable across threads: audio tracks are fetched in parallel.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchFailure>;
}

/// Fetches `http(s)://` URLs with `ureq`; `file://` URLs and bare paths are read from disk.
pub struct HttpFetcher {
    agent: ureq::Agent,
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpFetcher {
    pub fn new() -> Self {
        // Status codes are inspected by `fetch`, so 4xx/5xx must not turn into transport errors.
        let config = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .build();
        Self {
            agent: config.into(),
        }
    }

    fn fetch_http(&self, url: &str) -> Result<Vec<u8>, FetchFailure> {
        let resp = self
            .agent
            .get(url)
            .call()
            .map_err(|e| FetchFailure::Transport(format!("HTTP request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchFailure::Status(status.as_u16()));
        }

        let mut bytes = Vec::new();
        resp.into_body()
            .into_reader()
            .read_to_end(&mut bytes)
            .map_err(|e| FetchFailure::Transport(format!("failed to read response body: {e}")))?;
        tracing::debug!(url, bytes = bytes.len(), "fetched");
        Ok(bytes)
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchFailure> {
        if is_http_url(url) {
            return self.fetch_http(url);
        }
        let path = url.strip_prefix("file://").unwrap_or(url);
        read_local(Path::new(path))
    }
}

fn is_http_url(url: &str) -> bool {
    let lower = url.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn read_local(path: &Path) -> Result<Vec<u8>, FetchFailure> {
    std::fs::read(path)
        .map_err(|e| FetchFailure::Transport(format!("failed to read '{}': {e}", path.display())))
}

/// In-memory fetcher for tests and embedding. Unknown URLs answer `404`.
#[derive(Debug, Default)]
pub struct MemoryFetcher {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    failures: Mutex<HashMap<String, FetchFailure>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the payload served for `url`.
    pub fn insert(&self, url: impl Into<String>, bytes: Vec<u8>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(url.into(), bytes);
        }
    }

    /// Make `url` fail with `failure`.
    pub fn fail(&self, url: impl Into<String>, failure: FetchFailure) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(url.into(), failure);
        }
    }
}

impl Fetcher for MemoryFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchFailure> {
        let failures = self
            .failures
            .lock()
            .map_err(|_| FetchFailure::Transport("memory fetcher lock poisoned".to_string()))?;
        if let Some(f) = failures.get(url) {
            return Err(f.clone());
        }
        drop(failures);

        let entries = self
            .entries
            .lock()
            .map_err(|_| FetchFailure::Transport("memory fetcher lock poisoned".to_string()))?;
        entries.get(url).cloned().ok_or(FetchFailure::Status(404))
    }
}
