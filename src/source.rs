use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::{header, Client, StatusCode};
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::state::ByteRange;

pub type BodyStream = BoxStream<'static, Result<Bytes>>;

/// What a metadata request tells us about the remote file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteInfo {
    pub content_length: Option<u64>,
    /// `false` only when the server explicitly answers `Accept-Ranges: none`.
    pub accepts_ranges: bool,
}

impl RemoteInfo {
    /// Length usable for a segmented, resumable download.
    pub fn ranged_length(&self) -> Option<u64> {
        self.content_length.filter(|_| self.accepts_ranges)
    }
}

pub struct RangeResponse {
    /// `true` for `206 Partial Content`, `false` when the full body is returned.
    pub partial: bool,
    pub body: BodyStream,
}

/// Where transfers read bytes from.
#[async_trait]
pub trait RangeSource: Send + Sync {
    async fn probe(&self, url: &str) -> Result<RemoteInfo>;

    /// GET `url`, restricted to `range` when given.
    async fn fetch(&self, url: &str, range: Option<ByteRange>) -> Result<RangeResponse>;
}

/// First byte of a `Content-Range: bytes <start>-<end>/<total>` value.
fn content_range_start(value: &str) -> Option<u64> {
    let spec = value.trim().strip_prefix("bytes")?.trim_start();
    let (start, _) = spec.split_once('-')?;
    start.trim().parse().ok()
}

pub struct HttpSource {
    client: Client,
}

impl HttpSource {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(config.connect_timeout())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RangeSource for HttpSource {
    async fn probe(&self, url: &str) -> Result<RemoteInfo> {
        let response = self.client.head(url).send().await?.error_for_status()?;
        let content_length = response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|&len| len > 0);
        let accepts_ranges = response
            .headers()
            .get(header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| !v.trim().eq_ignore_ascii_case("none"))
            .unwrap_or(true);
        debug!(url, ?content_length, accepts_ranges, "probed");
        Ok(RemoteInfo {
            content_length,
            accepts_ranges,
        })
    }

    async fn fetch(&self, url: &str, range: Option<ByteRange>) -> Result<RangeResponse> {
        let mut request = self.client.get(url);
        if let Some(range) = range {
            request = request.header(header::RANGE, range.header_value());
        }
        let response = request.send().await?;
        let status = response.status();
        let partial = match status {
            StatusCode::PARTIAL_CONTENT => {
                if let Some(range) = range {
                    let start = response
                        .headers()
                        .get(header::CONTENT_RANGE)
                        .and_then(|v| v.to_str().ok())
                        .and_then(content_range_start);
                    if start != Some(range.start) {
                        debug!(url, requested = range.start, answered = ?start, "Content-Range does not match");
                        return Err(EngineError::RangeUnsupported {
                            offset: range.start,
                        });
                    }
                }
                true
            }
            StatusCode::OK => false,
            _ => {
                return Err(EngineError::HttpStatus {
                    url: url.to_string(),
                    status: status.as_u16(),
                })
            }
        };
        let body = response
            .bytes_stream()
            .map(|item| item.map_err(EngineError::from))
            .boxed();
        Ok(RangeResponse { partial, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_start_parses() {
        assert_eq!(content_range_start("bytes 250000-499999/1000000"), Some(250_000));
        assert_eq!(content_range_start("bytes 0-9/*"), Some(0));
        assert_eq!(content_range_start("bytes */1000"), None);
        assert_eq!(content_range_start("items 0-9/10"), None);
    }

    #[test]
    fn ranged_length_needs_range_support() {
        let info = RemoteInfo {
            content_length: Some(10),
            accepts_ranges: false,
        };
        assert_eq!(info.ranged_length(), None);
    }
}
