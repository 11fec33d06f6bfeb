use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::planner::{Segment, SegmentStatus};
use crate::source::{BodyStream, RangeResponse, RangeSource};
use crate::state::{ByteRange, CheckpointSender};

/// Global bandwidth cap shared by every fetcher.
pub struct Throttle {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    burst: NonZeroU32,
}

impl Throttle {
    pub fn new(bytes_per_sec: u32) -> Option<Arc<Self>> {
        let burst = NonZeroU32::new(bytes_per_sec)?;
        Some(Arc::new(Self {
            limiter: RateLimiter::direct(Quota::per_second(burst)),
            burst,
        }))
    }

    async fn acquire(&self, len: usize) -> Result<()> {
        let mut left = u32::try_from(len).unwrap_or(u32::MAX);
        while let Some(n) = NonZeroU32::new(left.min(self.burst.get())) {
            self.limiter
                .until_n_ready(n)
                .await
                .map_err(|e| EngineError::Network(e.to_string()))?;
            left -= n.get();
        }
        Ok(())
    }
}

/// Everything the workers of one transfer share.
#[derive(Clone)]
pub struct FetchContext {
    pub source: Arc<dyn RangeSource>,
    pub url: String,
    pub file: Arc<Mutex<File>>,
    pub path: PathBuf,
    pub progress: Arc<AtomicU64>,
    pub checkpoints: Option<CheckpointSender>,
    pub cancel: CancellationToken,
    pub throttle: Option<Arc<Throttle>>,
    pub config: Arc<EngineConfig>,
}

impl FetchContext {
    /// Sends the request; waiting for the response headers counts against the read timeout.
    async fn request(&self, range: Option<ByteRange>) -> Result<RangeResponse> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(EngineError::Cancelled),
            response = tokio::time::timeout(self.config.read_timeout(), self.source.fetch(&self.url, range)) => match response {
                Err(_) => Err(EngineError::Network(format!(
                    "no response within {:?}",
                    self.config.read_timeout()
                ))),
                Ok(response) => response,
            },
        }
    }

    async fn next_chunk(&self, body: &mut BodyStream) -> Result<Option<Bytes>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(EngineError::Cancelled),
            next = tokio::time::timeout(self.config.read_timeout(), body.next()) => match next {
                Err(_) => Err(EngineError::Network("read stalled".into())),
                Ok(None) => Ok(None),
                Ok(Some(chunk)) => chunk.map(Some),
            },
        }
    }

    async fn write_at(&self, offset: u64, chunk: &[u8]) -> Result<()> {
        if let Some(throttle) = &self.throttle {
            throttle.acquire(chunk.len()).await?;
        }
        let mut f = self.file.lock().await;
        f.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| EngineError::disk(&self.path, e))?;
        f.write_all(chunk)
            .await
            .map_err(|e| EngineError::disk(&self.path, e))?;
        // tokio completes file writes in the background; wait before the range is recorded.
        f.flush().await.map_err(|e| EngineError::disk(&self.path, e))?;
        Ok(())
    }
}

/// Fetches the rest of `segment`, retrying transient failures with backoff.
///
/// Every chunk written is reported to the checkpoint writer before the next read.
pub async fn fetch_segment(ctx: &FetchContext, segment: &mut Segment) -> Result<()> {
    segment.status = SegmentStatus::Fetching;
    loop {
        let result = fetch_once(ctx, segment).await;
        let err = match result {
            Ok(()) => {
                segment.status = SegmentStatus::Done;
                return Ok(());
            }
            Err(e) => e,
        };

        if matches!(err, EngineError::Cancelled) {
            segment.status = SegmentStatus::Pending;
            return Err(err);
        }
        if !err.is_transient() || segment.retries >= ctx.config.max_retries {
            segment.status = SegmentStatus::Errored;
            return Err(err);
        }

        let delay = ctx.config.retry_delay(segment.retries);
        segment.retries += 1;
        warn!(
            url = %ctx.url,
            segment = segment.index,
            attempt = segment.retries,
            written = segment.written,
            error = %err,
            "retrying segment in {:?}", delay
        );
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                segment.status = SegmentStatus::Pending;
                return Err(EngineError::Cancelled);
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn fetch_once(ctx: &FetchContext, segment: &mut Segment) -> Result<()> {
    let range = segment.remaining();
    if range.is_empty() {
        return Ok(());
    }
    if ctx.cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }

    let response = ctx.request(Some(range)).await?;
    // A full body is only usable when it starts where we want to write.
    if !response.partial && range.start != 0 {
        return Err(EngineError::RangeUnsupported {
            offset: range.start,
        });
    }
    let mut body = response.body;
    let mut pos = range.start;

    while pos < range.end {
        let Some(mut chunk) = ctx.next_chunk(&mut body).await? else {
            break;
        };
        let room = (range.end - pos) as usize;
        if chunk.len() > room {
            chunk.truncate(room);
        }
        if chunk.is_empty() {
            continue;
        }
        ctx.write_at(pos, &chunk).await?;

        let len = chunk.len() as u64;
        if let Some(checkpoints) = &ctx.checkpoints {
            checkpoints.record(ByteRange::new(pos, pos + len))?;
        }
        pos += len;
        segment.written += len;
        ctx.progress.fetch_add(len, Ordering::Relaxed);
    }

    if pos < range.end {
        return Err(EngineError::Network(format!(
            "connection closed at byte {} of segment [{}, {})",
            pos, segment.start, segment.end
        )));
    }
    debug!(url = %ctx.url, segment = segment.index, "segment done");
    Ok(())
}

/// Degraded mode: one plain GET written front to back. Returns the byte count.
pub async fn fetch_whole(ctx: &FetchContext) -> Result<u64> {
    let response = ctx.request(None).await?;
    let mut body = response.body;
    let mut pos = 0u64;
    while let Some(chunk) = ctx.next_chunk(&mut body).await? {
        if chunk.is_empty() {
            continue;
        }
        ctx.write_at(pos, &chunk).await?;
        pos += chunk.len() as u64;
        ctx.progress.fetch_add(chunk.len() as u64, Ordering::Relaxed);
    }
    let f = ctx.file.lock().await;
    f.set_len(pos)
        .await
        .map_err(|e| EngineError::disk(&ctx.path, e))?;
    Ok(pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::RemoteInfo;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    /// Serves `data`; the first `fail_times` requests die after `cut` bytes.
    struct Flaky {
        data: Vec<u8>,
        fail_times: u32,
        cut: usize,
        calls: AtomicU32,
        honour_ranges: bool,
    }

    #[async_trait]
    impl RangeSource for Flaky {
        async fn probe(&self, _url: &str) -> Result<RemoteInfo> {
            Ok(RemoteInfo {
                content_length: Some(self.data.len() as u64),
                accepts_ranges: self.honour_ranges,
            })
        }

        async fn fetch(&self, _url: &str, range: Option<ByteRange>) -> Result<RangeResponse> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let (partial, slice) = match range {
                Some(r) if self.honour_ranges => {
                    (true, self.data[r.start as usize..r.end as usize].to_vec())
                }
                _ => (false, self.data.clone()),
            };
            let mut items: Vec<Result<Bytes>> = Vec::new();
            if call < self.fail_times {
                items.push(Ok(Bytes::from(slice[..self.cut.min(slice.len())].to_vec())));
                items.push(Err(EngineError::Network("reset".into())));
            } else {
                for c in slice.chunks(7) {
                    items.push(Ok(Bytes::from(c.to_vec())));
                }
            }
            Ok(RangeResponse {
                partial,
                body: futures::stream::iter(items).boxed(),
            })
        }
    }

    /// The first `hang` requests never answer.
    struct Silent {
        data: Vec<u8>,
        hang: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl RangeSource for Silent {
        async fn probe(&self, _url: &str) -> Result<RemoteInfo> {
            Ok(RemoteInfo {
                content_length: Some(self.data.len() as u64),
                accepts_ranges: true,
            })
        }

        async fn fetch(&self, _url: &str, range: Option<ByteRange>) -> Result<RangeResponse> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.hang {
                futures::future::pending::<()>().await;
            }
            let r = range.unwrap_or(ByteRange::new(0, self.data.len() as u64));
            let body = Bytes::from(self.data[r.start as usize..r.end as usize].to_vec());
            Ok(RangeResponse {
                partial: range.is_some(),
                body: futures::stream::iter(vec![Ok(body)]).boxed(),
            })
        }
    }

    async fn context<S: RangeSource + 'static>(source: S, dir: &std::path::Path) -> FetchContext {
        let path = dir.join("out.bin");
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .await
            .unwrap();
        FetchContext {
            source: Arc::new(source),
            url: "http://example.com/f".into(),
            file: Arc::new(Mutex::new(file)),
            path,
            progress: Arc::new(AtomicU64::new(0)),
            checkpoints: None,
            cancel: CancellationToken::new(),
            throttle: None,
            config: Arc::new(EngineConfig {
                max_retries: 3,
                retry_base_delay_ms: 1,
                ..EngineConfig::default()
            }),
        }
    }

    fn data(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn retries_resume_from_written_offset() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(
            Flaky {
                data: data(100),
                fail_times: 2,
                cut: 10,
                calls: AtomicU32::new(0),
                honour_ranges: true,
            },
            dir.path(),
        )
        .await;
        let mut seg = Segment::new(0, 20, 80);
        fetch_segment(&ctx, &mut seg).await.unwrap();
        assert_eq!(seg.status, SegmentStatus::Done);
        assert_eq!(seg.retries, 2);
        assert_eq!(seg.written, 60);
        assert_eq!(ctx.progress.load(Ordering::Relaxed), 60);

        drop(ctx);
        let on_disk = std::fs::read(dir.path().join("out.bin")).unwrap();
        assert_eq!(&on_disk[20..80], &data(100)[20..80]);
    }

    #[tokio::test]
    async fn exhausted_retries_mark_errored() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(
            Flaky {
                data: data(50),
                fail_times: 10,
                cut: 5,
                calls: AtomicU32::new(0),
                honour_ranges: true,
            },
            dir.path(),
        )
        .await;
        let mut seg = Segment::new(0, 0, 50);
        let err = fetch_segment(&ctx, &mut seg).await.unwrap_err();
        assert!(matches!(err, EngineError::Network(_)));
        assert_eq!(seg.status, SegmentStatus::Errored);
        assert_eq!(seg.retries, 3);
        // 1 attempt + 3 retries, 5 bytes each.
        assert_eq!(seg.written, 20);
    }

    #[tokio::test]
    async fn ignored_range_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(
            Flaky {
                data: data(50),
                fail_times: 0,
                cut: 0,
                calls: AtomicU32::new(0),
                honour_ranges: false,
            },
            dir.path(),
        )
        .await;
        let mut seg = Segment::new(1, 25, 50);
        let err = fetch_segment(&ctx, &mut seg).await.unwrap_err();
        assert!(matches!(err, EngineError::RangeUnsupported { offset: 25 }));
        assert_eq!(seg.written, 0);
    }

    #[tokio::test]
    async fn full_body_from_zero_is_clipped_to_segment() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(
            Flaky {
                data: data(50),
                fail_times: 0,
                cut: 0,
                calls: AtomicU32::new(0),
                honour_ranges: false,
            },
            dir.path(),
        )
        .await;
        let mut seg = Segment::new(0, 0, 20);
        fetch_segment(&ctx, &mut seg).await.unwrap();
        drop(ctx);
        let on_disk = std::fs::read(dir.path().join("out.bin")).unwrap();
        assert_eq!(on_disk.len(), 20);
    }

    #[tokio::test]
    async fn cancelled_segment_stops_before_reading() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(
            Flaky {
                data: data(50),
                fail_times: 0,
                cut: 0,
                calls: AtomicU32::new(0),
                honour_ranges: true,
            },
            dir.path(),
        )
        .await;
        ctx.cancel.cancel();
        let mut seg = Segment::new(0, 0, 50);
        let err = fetch_segment(&ctx, &mut seg).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert_eq!(seg.status, SegmentStatus::Pending);
        assert_eq!(seg.written, 0);
    }

    #[tokio::test]
    async fn whole_body_is_written_sequentially() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(
            Flaky {
                data: data(64),
                fail_times: 0,
                cut: 0,
                calls: AtomicU32::new(0),
                honour_ranges: false,
            },
            dir.path(),
        )
        .await;
        assert_eq!(fetch_whole(&ctx).await.unwrap(), 64);
        drop(ctx);
        assert_eq!(std::fs::read(dir.path().join("out.bin")).unwrap(), data(64));
    }

    #[tokio::test]
    async fn unanswered_request_times_out_and_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(
            Silent {
                data: data(40),
                hang: 1,
                calls: AtomicU32::new(0),
            },
            dir.path(),
        )
        .await;
        ctx.config = Arc::new(EngineConfig {
            read_timeout_secs: 1,
            ..(*ctx.config).clone()
        });
        let mut seg = Segment::new(0, 0, 40);
        tokio::time::timeout(std::time::Duration::from_secs(10), fetch_segment(&ctx, &mut seg))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seg.retries, 1);
        assert_eq!(seg.status, SegmentStatus::Done);
    }

    #[tokio::test]
    async fn cancel_interrupts_unanswered_request() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(
            Silent {
                data: data(40),
                hang: u32::MAX,
                calls: AtomicU32::new(0),
            },
            dir.path(),
        )
        .await;
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let mut seg = Segment::new(0, 0, 40);
        let err = tokio::time::timeout(std::time::Duration::from_secs(5), fetch_segment(&ctx, &mut seg))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert_eq!(seg.status, SegmentStatus::Pending);
    }
}
