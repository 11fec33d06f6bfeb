use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::{self, File, OpenOptions};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::dataset::DatasetFile;
use crate::error::{EngineError, Result};
use crate::extract::extract_archive;
use crate::fetcher::{fetch_segment, fetch_whole, FetchContext, Throttle};
use crate::planner::{self, Plan, Segment};
use crate::progress::{ProgressReporter, TransferId, TransferState};
use crate::source::{RangeSource, RemoteInfo};
use crate::state::{part_path, ResumeRecord, ResumeStore};
use crate::verify::verify_file;

/// Final outcome of one transfer run.
#[derive(Debug, Clone)]
pub struct TransferReport {
    pub id: TransferId,
    pub state: TransferState,
    pub reason: Option<String>,
    /// Bytes pulled from the network in this run.
    pub bytes_fetched: u64,
    /// Retry events per segment, keyed by segment start offset.
    pub segment_retries: BTreeMap<u64, u32>,
}

#[derive(Default)]
struct RunStats {
    initial_bytes: u64,
    segment_retries: BTreeMap<u64, u32>,
}

/// Drives one dataset file from probe to extracted tree.
pub struct TransferCoordinator {
    file: DatasetFile,
    root: PathBuf,
    source: Arc<dyn RangeSource>,
    config: Arc<EngineConfig>,
    reporter: Arc<ProgressReporter>,
    cancel: CancellationToken,
    throttle: Option<Arc<Throttle>>,
}

impl TransferCoordinator {
    pub fn new(
        file: DatasetFile,
        root: PathBuf,
        source: Arc<dyn RangeSource>,
        config: Arc<EngineConfig>,
        reporter: Arc<ProgressReporter>,
        cancel: CancellationToken,
        throttle: Option<Arc<Throttle>>,
    ) -> Self {
        Self {
            file,
            root,
            source,
            config,
            reporter,
            cancel,
            throttle,
        }
    }

    pub async fn run(self) -> TransferReport {
        let mut stats = RunStats::default();
        let result = self.drive(&mut stats).await;
        let (state, reason) = match result {
            Ok(reason) => (TransferState::Completed, reason),
            Err(EngineError::Cancelled) => (
                TransferState::Cancelled,
                "cancelled, partial data kept for resume".to_string(),
            ),
            Err(e) => (TransferState::Failed, e.to_string()),
        };
        match state {
            TransferState::Completed => info!(id = %self.file.id, %reason, "transfer completed"),
            _ => warn!(id = %self.file.id, ?state, %reason, "transfer stopped"),
        }
        self.reporter.set_state(state, Some(reason.clone()));
        TransferReport {
            id: self.file.id.clone(),
            state,
            reason: Some(reason),
            bytes_fetched: self.reporter.bytes_done().saturating_sub(stats.initial_bytes),
            segment_retries: stats.segment_retries,
        }
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }

    async fn drive(&self, stats: &mut RunStats) -> Result<String> {
        let archive = self.file.archive_path(&self.root);
        let store = ResumeStore::for_archive(&archive);
        let part = part_path(&archive);
        self.reporter.set_state(TransferState::Planned, None);

        if self.file.is_extracted(&self.root) {
            return Ok("already extracted".to_string());
        }
        self.check_cancel()?;

        let info = self.probe().await?;
        self.reporter.set_total(info.content_length);

        // Archive from an earlier run that was verified but never unpacked.
        if fs::try_exists(&archive).await.unwrap_or(false) && !fs::try_exists(store.path()).await.unwrap_or(false) {
            info!(?archive, "archive already present, re-verifying");
            self.reporter.set_bytes_done(info.content_length.unwrap_or(0));
            stats.initial_bytes = self.reporter.bytes_done();
            self.reporter.set_state(TransferState::Verifying, None);
            self.verify(&archive, info.content_length).await?;
            return self.unpack(&archive).await;
        }

        let Some(total) = info.ranged_length() else {
            return self.degraded(&store, &part, &archive, info, stats).await;
        };

        let mut record = self.load_record(&store, &part, total).await?;
        stats.initial_bytes = record.completed_bytes();
        self.reporter.set_bytes_done(stats.initial_bytes);

        let segments = match planner::plan(Some(total), &record, self.config.max_segments, self.config.min_chunk_size) {
            Plan::Ranged(segments) => segments,
            Plan::SingleStream => return self.degraded(&store, &part, &archive, info, stats).await,
        };

        if !segments.is_empty() {
            self.check_cancel()?;
            let file = Arc::new(Mutex::new(open_part(&part, Some(total), false).await?));
            self.reporter.set_state(TransferState::InProgress, None);
            info!(
                id = %self.file.id,
                segments = segments.len(),
                resumed = stats.initial_bytes,
                total,
                "downloading"
            );

            // Stops every segment on cancel or when a checkpoint cannot be saved.
            let fetch_cancel = self.cancel.child_token();
            let writer = store.clone().spawn_writer(record, file.clone(), fetch_cancel.clone());
            let stop_ticker = CancellationToken::new();
            let ticker = self.reporter.spawn_ticker(&self.config, stop_ticker.clone());

            let ctx = FetchContext {
                source: self.source.clone(),
                url: self.file.url.clone(),
                file,
                path: part.clone(),
                progress: self.reporter.counter(),
                checkpoints: Some(writer.sender()),
                cancel: fetch_cancel,
                throttle: self.throttle.clone(),
                config: self.config.clone(),
            };
            let fetched = self.run_segments(ctx, segments, stats).await;

            stop_ticker.cancel();
            let _ = ticker.await;
            // Every range reported before this point is on disk once finish returns.
            record = writer.finish().await?;

            match fetched {
                Ok(()) => {}
                Err(EngineError::RangeUnsupported { offset }) if !self.cancel.is_cancelled() => {
                    warn!(id = %self.file.id, offset, "server ignored a range request, restarting as a single stream");
                    return self.degraded(&store, &part, &archive, info, stats).await;
                }
                Err(e) => return Err(e),
            }
        }

        if !record.is_complete() {
            return Err(EngineError::StateCorrupt {
                path: store.path().to_path_buf(),
                message: format!(
                    "{} of {} bytes recorded after all segments finished",
                    record.completed_bytes(),
                    total
                ),
            });
        }
        self.check_cancel()?;

        self.reporter.set_state(TransferState::Verifying, None);
        // On mismatch the record and partial bytes stay for the next run.
        self.verify(&part, Some(total)).await?;

        fs::rename(&part, &archive)
            .await
            .map_err(|e| EngineError::disk(&archive, e))?;
        store.clear().await?;
        self.unpack(&archive).await
    }

    async fn probe(&self) -> Result<RemoteInfo> {
        let mut attempt = 0;
        loop {
            let probed = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
                probed = tokio::time::timeout(self.config.read_timeout(), self.source.probe(&self.file.url)) => {
                    probed.unwrap_or_else(|_| {
                        Err(EngineError::Network(format!(
                            "no response within {:?}",
                            self.config.read_timeout()
                        )))
                    })
                }
            };
            match probed {
                Ok(info) => return Ok(info),
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    let delay = self.config.retry_delay(attempt);
                    attempt += 1;
                    warn!(url = %self.file.url, error = %e, attempt, "probe failed, retrying in {:?}", delay);
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Loads the record, discarding it when it no longer describes the remote file
    /// or the partial bytes it refers to are gone.
    async fn load_record(&self, store: &ResumeStore, part: &Path, total: u64) -> Result<ResumeRecord> {
        let fresh = || ResumeRecord::new(self.file.url.clone(), total, self.file.checksum.clone());
        let Some(mut record) = store.load().await? else {
            return Ok(fresh());
        };

        let part_present = fs::try_exists(part).await.unwrap_or(false);
        if record.url != self.file.url || record.total_size != total || !part_present {
            warn!(
                id = %self.file.id,
                recorded_size = record.total_size,
                remote_size = total,
                part_present,
                "resume record is stale, starting over"
            );
            store.clear().await?;
            remove_if_exists(part).await?;
            return Ok(fresh());
        }
        record.checksum = self.file.checksum.clone();
        info!(
            id = %self.file.id,
            done = record.completed_bytes(),
            total,
            "resuming from record"
        );
        Ok(record)
    }

    /// Runs the planned segments on a bounded pool; errored sub-ranges are
    /// re-planned up to `replan_limit` times.
    async fn run_segments(&self, ctx: FetchContext, segments: Vec<Segment>, stats: &mut RunStats) -> Result<()> {
        let pool = Arc::new(Semaphore::new(self.config.max_segments));
        let mut pending = segments;
        let mut round = 0;

        loop {
            let mut set = JoinSet::new();
            for mut segment in pending.drain(..) {
                let ctx = ctx.clone();
                let pool = pool.clone();
                set.spawn(async move {
                    let Ok(_permit) = pool.acquire().await else {
                        return (segment, Err(EngineError::Cancelled));
                    };
                    let result = fetch_segment(&ctx, &mut segment).await;
                    (segment, result)
                });
            }

            let mut errored: Vec<(Segment, EngineError)> = Vec::new();
            let mut fatal: Option<EngineError> = None;
            let mut cancelled = false;
            while let Some(joined) = set.join_next().await {
                let (segment, result) = joined?;
                *stats.segment_retries.entry(segment.start).or_default() += segment.retries;
                match result {
                    Ok(()) => {}
                    Err(EngineError::Cancelled) => cancelled = true,
                    Err(e) if e.is_transient() => errored.push((segment, e)),
                    Err(e) => {
                        // Stop the siblings at their next chunk boundary.
                        ctx.cancel.cancel();
                        fatal.get_or_insert(e);
                    }
                }
            }

            if let Some(e) = fatal {
                return Err(e);
            }
            if cancelled {
                return Err(EngineError::Cancelled);
            }
            let Some((segment, last_error)) = errored.last() else {
                return Ok(());
            };
            if round >= self.config.replan_limit {
                return Err(EngineError::Network(format!(
                    "segment [{}, {}) failed after {} retries: {}",
                    segment.start, segment.end, segment.retries, last_error
                )));
            }

            round += 1;
            let remaining: Vec<_> = errored.iter().map(|(s, _)| s.remaining()).collect();
            warn!(
                id = %self.file.id,
                ranges = remaining.len(),
                round,
                "re-planning errored segments"
            );
            pending = planner::split_ranges(&remaining, self.config.max_segments, self.config.min_chunk_size);
        }
    }

    /// Single-stream download without range support or resume.
    async fn degraded(
        &self,
        store: &ResumeStore,
        part: &Path,
        archive: &Path,
        info: RemoteInfo,
        stats: &mut RunStats,
    ) -> Result<String> {
        warn!(id = %self.file.id, "length or range support unknown, downloading as a single stream without resume");
        store.clear().await?;
        self.check_cancel()?;
        let file = open_part(part, None, true).await?;
        stats.initial_bytes = 0;
        self.reporter.set_bytes_done(0);
        self.reporter.set_state(TransferState::InProgress, None);

        let stop_ticker = CancellationToken::new();
        let ticker = self.reporter.spawn_ticker(&self.config, stop_ticker.clone());
        let ctx = FetchContext {
            source: self.source.clone(),
            url: self.file.url.clone(),
            file: Arc::new(Mutex::new(file)),
            path: part.to_path_buf(),
            progress: self.reporter.counter(),
            checkpoints: None,
            cancel: self.cancel.child_token(),
            throttle: self.throttle.clone(),
            config: self.config.clone(),
        };
        let received = fetch_whole(&ctx).await;
        stop_ticker.cancel();
        let _ = ticker.await;
        let received = received?;
        drop(ctx);

        if info.content_length.is_none() {
            self.reporter.set_total(Some(received));
        }
        self.reporter.set_state(TransferState::Verifying, None);
        self.verify(part, info.content_length).await?;
        fs::rename(part, archive)
            .await
            .map_err(|e| EngineError::disk(archive, e))?;
        self.unpack(archive).await
    }

    async fn verify(&self, path: &Path, expected_size: Option<u64>) -> Result<()> {
        verify_file(
            path,
            expected_size,
            self.file.checksum.as_deref(),
            self.config.verify_mode,
        )
        .await
    }

    async fn unpack(&self, archive: &Path) -> Result<String> {
        if !self.config.extract {
            return Ok(format!("downloaded to {}", archive.display()));
        }
        self.check_cancel()?;
        self.reporter.set_state(TransferState::Extracting, None);
        let files = extract_archive(archive, &self.root).await?;
        Ok(format!("downloaded and extracted {} files", files))
    }
}

async fn open_part(part: &Path, total: Option<u64>, truncate: bool) -> Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(truncate)
        .open(part)
        .await
        .map_err(|e| EngineError::disk(part, e))?;
    if let Some(total) = total {
        let len = file
            .metadata()
            .await
            .map_err(|e| EngineError::disk(part, e))?
            .len();
        if len != total {
            file.set_len(total)
                .await
                .map_err(|e| EngineError::disk(part, e))?;
        }
    }
    Ok(file)
}

pub(crate) async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(EngineError::disk(path, e)),
    }
}
