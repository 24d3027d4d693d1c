use std::path::PathBuf;
use std::time::Duration;

use reqwest::StatusCode;
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, info, warn};

use crate::error::{GateError, Result};
use crate::manifest::source::{ManifestDoc, SourceConfig, SourceKind, SyncMetadata};

/// The identifier every client can fall back to.
pub const DEFAULT_MANIFEST_IDENTIFIER: &str = "default";

const SYNC_METADATA_FILE: &str = "last-sync.json";

#[derive(Debug)]
enum FetchFailure {
    NotFound,
    Unauthorized,
    Http(StatusCode),
    Network(String),
    Parse(String),
}

impl From<FetchFailure> for GateError {
    fn from(failure: FetchFailure) -> Self {
        match failure {
            FetchFailure::NotFound => GateError::ManifestFetch("not found (404)".to_string()),
            FetchFailure::Unauthorized => {
                GateError::ManifestFetch("unauthorized (401)".to_string())
            }
            FetchFailure::Http(status) => {
                GateError::ManifestFetch(format!("HTTP error {}", status))
            }
            FetchFailure::Network(msg) => GateError::ManifestFetch(msg),
            FetchFailure::Parse(msg) => GateError::ManifestParse(msg),
        }
    }
}

/// Build the manifest URL for an identifier. A `{identifier}` placeholder
/// in the base is substituted; otherwise the identifier is appended as a
/// path segment.
pub fn manifest_url(base: &str, identifier: &str) -> String {
    if base.contains("{identifier}") {
        base.replace("{identifier}", identifier)
    } else {
        format!("{}/{}", base.trim_end_matches('/'), identifier)
    }
}

/// HTTPS/file fetcher with a per-source disk cache of the last good fetch.
pub struct Fetcher {
    client: reqwest::Client,
    cache_dir: Option<PathBuf>,
}

impl Fetcher {
    pub fn new(cache_dir: Option<PathBuf>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("dnsgate")
            .build()
            .unwrap_or_default();
        Self { client, cache_dir }
    }

    /// Fetch the manifest for `identifier`. A 404 or 401 on a non-default
    /// identifier retries exactly once against `default`; other statuses
    /// never fall back. Returns the document and whether fallback was used.
    pub async fn fetch_manifest(
        &self,
        base: &str,
        identifier: &str,
        credentials: Option<&str>,
    ) -> Result<(ManifestDoc, bool)> {
        match self
            .get_manifest_once(&manifest_url(base, identifier), credentials)
            .await
        {
            Ok(doc) => Ok((doc, false)),
            Err(failure @ (FetchFailure::NotFound | FetchFailure::Unauthorized))
                if identifier != DEFAULT_MANIFEST_IDENTIFIER =>
            {
                info!(
                    identifier,
                    reason = ?failure,
                    "primary manifest unavailable; falling back to default"
                );
                let doc = self
                    .get_manifest_once(
                        &manifest_url(base, DEFAULT_MANIFEST_IDENTIFIER),
                        credentials,
                    )
                    .await
                    .map_err(GateError::from)?;
                Ok((doc, true))
            }
            Err(failure) => Err(failure.into()),
        }
    }

    async fn get_manifest_once(
        &self,
        url: &str,
        credentials: Option<&str>,
    ) -> std::result::Result<ManifestDoc, FetchFailure> {
        let bytes = self.get_bytes(url, credentials, None).await?;
        serde_json::from_slice(&bytes).map_err(|e| FetchFailure::Parse(e.to_string()))
    }

    /// Fetch an included sub-manifest. No identifier fallback: that applies
    /// only to the primary load.
    pub async fn fetch_included(
        &self,
        base: &str,
        identifier: &str,
        credentials: Option<&str>,
    ) -> Result<ManifestDoc> {
        self.get_manifest_once(&manifest_url(base, identifier), credentials)
            .await
            .map_err(GateError::from)
    }

    /// GET with bearer credentials and transient-network retry. Non-success
    /// statuses are reported, never retried here. `timeout` overrides the
    /// client default when a source configures its own.
    async fn get_bytes(
        &self,
        url: &str,
        credentials: Option<&str>,
        timeout: Option<Duration>,
    ) -> std::result::Result<Vec<u8>, FetchFailure> {
        let strategy = ExponentialBackoff::from_millis(2).factor(125).take(2);
        let response = Retry::spawn(strategy, || {
            let mut request = self.client.get(url);
            if let Some(token) = credentials {
                request = request.bearer_auth(token);
            }
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }
            async move { request.send().await }
        })
        .await
        .map_err(|e| FetchFailure::Network(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(FetchFailure::NotFound),
            StatusCode::UNAUTHORIZED => Err(FetchFailure::Unauthorized),
            status if !status.is_success() => Err(FetchFailure::Http(status)),
            _ => response
                .bytes()
                .await
                .map(|b| b.to_vec())
                .map_err(|e| FetchFailure::Network(e.to_string())),
        }
    }

    /// Fetch a rule list's raw bytes: from disk for `File` sources, over
    /// HTTPS with disk-cache reuse for `Https` sources. A fresh-enough
    /// cached copy (younger than the source's update interval) is used
    /// without touching the network; a failed fetch falls back to the
    /// cached copy regardless of age.
    pub async fn fetch_rule_list(&self, source: &SourceConfig) -> Result<Vec<u8>> {
        match source.kind {
            SourceKind::File => tokio::fs::read(&source.location).await.map_err(|e| {
                GateError::ManifestFetch(format!("{}: {}", source.location, e))
            }),
            SourceKind::Https => {
                if let Some(cached) = self.load_cached(&source.identifier, Some(source.update_interval)) {
                    debug!(source = %source.identifier, "using fresh cached rule list");
                    return Ok(cached);
                }
                match self
                    .get_bytes(
                        &source.location,
                        source.credentials.as_deref(),
                        Some(source.timeout),
                    )
                    .await
                {
                    Ok(bytes) => {
                        self.store_cached(&source.identifier, &bytes);
                        Ok(bytes)
                    }
                    Err(failure) => {
                        let err = GateError::from(failure);
                        match self.load_cached(&source.identifier, None) {
                            Some(stale) => {
                                warn!(
                                    source = %source.identifier,
                                    error = %err,
                                    "fetch failed; using last known good rule list"
                                );
                                Ok(stale)
                            }
                            None => Err(err),
                        }
                    }
                }
            }
        }
    }

    fn cache_path(&self, identifier: &str) -> Option<PathBuf> {
        let sanitized: String = identifier
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        self.cache_dir
            .as_ref()
            .map(|dir| dir.join(format!("source-{}.cache", sanitized)))
    }

    /// Cached bytes for a source, optionally only when younger than
    /// `max_age`.
    pub fn load_cached(&self, identifier: &str, max_age: Option<Duration>) -> Option<Vec<u8>> {
        let path = self.cache_path(identifier)?;
        if let Some(max_age) = max_age {
            let modified = std::fs::metadata(&path).ok()?.modified().ok()?;
            if modified.elapsed().map(|age| age > max_age).unwrap_or(true) {
                return None;
            }
        }
        std::fs::read(&path).ok()
    }

    pub fn store_cached(&self, identifier: &str, bytes: &[u8]) {
        let Some(path) = self.cache_path(identifier) else {
            return;
        };
        if let Some(parent) = path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return;
            }
        }
        let tmp = path.with_extension("tmp");
        if std::fs::write(&tmp, bytes).is_ok() {
            let _ = std::fs::rename(&tmp, &path);
        }
    }

    pub fn write_sync_metadata(&self, metadata: &SyncMetadata) {
        let Some(dir) = &self.cache_dir else {
            return;
        };
        let _ = std::fs::create_dir_all(dir);
        if let Ok(data) = serde_json::to_vec(metadata) {
            let path = dir.join(SYNC_METADATA_FILE);
            let tmp = path.with_extension("tmp");
            if std::fs::write(&tmp, data).is_ok() {
                let _ = std::fs::rename(&tmp, &path);
            }
        }
    }

    pub fn read_sync_metadata(&self) -> Option<SyncMetadata> {
        let dir = self.cache_dir.as_ref()?;
        let data = std::fs::read(dir.join(SYNC_METADATA_FILE)).ok()?;
        serde_json::from_slice(&data).ok()
    }
}
