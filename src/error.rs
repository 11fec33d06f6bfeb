use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Connection reset, timeout, truncated body. Retried with backoff.
    #[error("network error: {0}")]
    Network(String),

    #[error("server answered HTTP {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("server ignored the range request for offset {offset}")]
    RangeUnsupported { offset: u64 },

    #[error("size mismatch: expected {expected} bytes, found {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("unsupported checksum {0:?}, expected md5:<hex> or sha256:<hex>")]
    InvalidChecksum(String),

    #[error("checksum verification required but none is known for {0}")]
    MissingChecksum(String),

    #[error("extraction of {archive} failed: {message}")]
    Extraction { archive: PathBuf, message: String },

    #[error("disk error on {path}: {source}")]
    Disk {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("resume record {path} is unusable: {message}")]
    StateCorrupt { path: PathBuf, message: String },

    #[error("transfer cancelled")]
    Cancelled,

    #[error("transfer {0} is running")]
    Busy(String),

    #[error("unknown transfer {0}")]
    UnknownTransfer(String),

    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl EngineError {
    pub fn disk(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Disk {
            path: path.into(),
            source,
        }
    }

    pub fn extraction(archive: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::Extraction {
            archive: archive.into(),
            message: message.to_string(),
        }
    }

    /// Whether a segment should retry the remaining sub-range after this error.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::HttpStatus { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => Self::HttpStatus {
                url: e.url().map(|u| u.to_string()).unwrap_or_default(),
                status: status.as_u16(),
            },
            None => Self::Network(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_transient() {
        let err = EngineError::HttpStatus {
            url: "http://x".into(),
            status: 503,
        };
        assert!(err.is_transient());
        assert!(EngineError::Network("reset".into()).is_transient());
    }

    #[test]
    fn client_and_disk_errors_are_fatal() {
        let err = EngineError::HttpStatus {
            url: "http://x".into(),
            status: 404,
        };
        assert!(!err.is_transient());
        let disk = EngineError::disk(
            "/nope",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(!disk.is_transient());
        assert!(!EngineError::RangeUnsupported { offset: 10 }.is_transient());
    }
}
