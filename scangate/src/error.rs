use reqwest::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ScanError>;

/// Failure of a single lifecycle step.
///
/// The orchestrator recovers from `NotFound` during project lookup and from
/// `Transient` while polling. Every other variant ends the run.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The identity endpoint or the vendor API rejected the credentials (401/403).
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A project, scan or team lookup came back empty (404).
    #[error("not found: {0}")]
    NotFound(String),

    /// 5xx, throttling, timeouts and dropped connections. Worth another try.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The vendor answered with a status or body shape we cannot use.
    #[error("unexpected response: {0}")]
    Protocol(String),

    #[error("packaging failed: {0}")]
    Packaging(String),

    #[error("scan {scan_id} did not reach a terminal status after {attempts} status checks")]
    Timeout { scan_id: String, attempts: u32 },

    #[error("run cancelled while waiting for scan {scan_id}")]
    Cancelled { scan_id: String },

    #[error("{vendor} does not produce {format} reports")]
    UnsupportedFormat { vendor: String, format: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ScanError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Classify a non-success HTTP status.
    pub(crate) fn from_status(status: StatusCode, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Self::Auth(detail),
            StatusCode::NOT_FOUND => Self::NotFound(detail),
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => Self::Transient(detail),
            s if s.is_server_error() => Self::Transient(detail),
            _ => Self::Protocol(detail),
        }
    }

    /// Classify an error raised by reqwest before a usable response existed.
    pub(crate) fn from_transport(err: reqwest::Error, what: &str) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status, format!("{what}: {err}"));
        }
        if err.is_decode() || err.is_builder() {
            return Self::Protocol(format!("{what}: {err}"));
        }
        // timeouts, refused/reset connections, truncated bodies
        Self::Transient(format!("{what}: {err}"))
    }
}
