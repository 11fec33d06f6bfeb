use std::fmt;
use std::path::Path;

use md5::Md5;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::info;

use crate::config::VerifyMode;
use crate::error::{EngineError, Result};

/// Expected digest of an archive, as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Checksum {
    Md5(String),
    Sha256(String),
}

impl Checksum {
    /// Accepts `md5:<hex>`, `sha256:<hex>`, or bare hex told apart by length.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let (algorithm, hex) = match value.split_once(':') {
            Some((algorithm, hex)) => (Some(algorithm.to_ascii_lowercase()), hex),
            None => (None, value),
        };
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        let hex = hex.to_ascii_lowercase();
        match (algorithm.as_deref(), hex.len()) {
            (Some("md5") | None, 32) => Some(Self::Md5(hex)),
            (Some("sha256") | None, 64) => Some(Self::Sha256(hex)),
            _ => None,
        }
    }

    pub fn hex(&self) -> &str {
        match self {
            Self::Md5(hex) | Self::Sha256(hex) => hex,
        }
    }

    /// Digest of the file at `path` with the same algorithm.
    pub async fn compute(&self, path: &Path) -> Result<String> {
        match self {
            Self::Md5(_) => digest_file::<Md5>(path).await,
            Self::Sha256(_) => digest_file::<Sha256>(path).await,
        }
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Md5(hex) => write!(f, "md5:{}", hex),
            Self::Sha256(hex) => write!(f, "sha256:{}", hex),
        }
    }
}

pub async fn digest_file<D: Digest>(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .await
        .map_err(|e| EngineError::disk(path, e))?;
    let mut hasher = D::new();
    let mut buffer = vec![0u8; 1024 * 1024];

    loop {
        let n = file
            .read(&mut buffer)
            .await
            .map_err(|e| EngineError::disk(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Checks the file against the expected size and, depending on `mode`, the
/// checksum. Read-only.
pub async fn verify_file(
    path: &Path,
    expected_size: Option<u64>,
    checksum: Option<&str>,
    mode: VerifyMode,
) -> Result<()> {
    let actual = tokio::fs::metadata(path)
        .await
        .map_err(|e| EngineError::disk(path, e))?
        .len();
    if let Some(expected) = expected_size {
        if actual != expected {
            return Err(EngineError::SizeMismatch { expected, actual });
        }
    }

    let checksum = match (mode, checksum) {
        (VerifyMode::Off, _) => return Ok(()),
        (VerifyMode::On, None) => return Err(EngineError::MissingChecksum(path.display().to_string())),
        (VerifyMode::Auto, None) => return Ok(()),
        (_, Some(c)) => Checksum::parse(c).ok_or_else(|| EngineError::InvalidChecksum(c.to_string()))?,
    };

    let hash = checksum.compute(path).await?;
    if checksum.hex() != hash {
        return Err(EngineError::ChecksumMismatch {
            expected: checksum.to_string(),
            actual: hash,
        });
    }
    info!(?path, %checksum, "checksum verified");
    Ok(())
}
