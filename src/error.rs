use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GateError>;

/// Unified error type for the dnsgate proxy.
///
/// Data-plane failures (packet format, upstream, flow) are converted into a
/// DNS response or an explicit drop before they reach a caller; control-plane
/// failures (store, manifest, config) are reported and logged.
#[derive(Debug, Clone, Error)]
pub enum GateError {
    // IO
    #[error("IO error: {0}")]
    Io(String),
    #[error("IO error: {0}")]
    IoError(Arc<std::io::Error>),

    // Packet codec
    #[error("malformed packet: {0}")]
    PacketFormat(String),

    // Upstream
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("upstream transient failure: {0}")]
    UpstreamTransient(String),

    // Flows
    #[error("flow is closed")]
    FlowClosed,

    // Rule store
    #[error("rule store open failed: {0}")]
    RuleStoreOpen(String),
    #[error("rule store write failed: {0}")]
    RuleStoreWrite(String),

    // Manifest / rule updates
    #[error("manifest fetch failed: {0}")]
    ManifestFetch(String),
    #[error("manifest parse failed: {0}")]
    ManifestParse(String),

    // Configuration
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    // Runtime conditions
    #[error("network unreachable")]
    NetworkUnreachable,
    #[error("operation timed out")]
    Timeout,
    #[error("cache error: {0}")]
    Cache(String),
    #[error("invalid command: {0}")]
    CommandInvalid(String),
    #[error("engine is shutting down")]
    Shutdown,
}

impl From<std::io::Error> for GateError {
    fn from(err: std::io::Error) -> Self {
        GateError::IoError(Arc::new(err))
    }
}

impl From<serde_json::Error> for GateError {
    fn from(err: serde_json::Error) -> Self {
        GateError::ManifestParse(err.to_string())
    }
}

impl GateError {
    /// Whether a write failure means the peer flow is gone.
    ///
    /// The OS flow API reports a torn-down flow with one of these strings;
    /// the engine marks the flow closed and drops the write.
    pub fn indicates_flow_closed(msg: &str) -> bool {
        msg.contains("flow is closed") || msg.contains("not connected")
    }
}
