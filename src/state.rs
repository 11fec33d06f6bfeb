use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

/// Half-open byte interval `[start, end)`, persisted as a `[start, end]` pair.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(from = "(u64, u64)", into = "(u64, u64)")]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// `Range` header value; HTTP ranges are inclusive.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end.saturating_sub(1))
    }
}

impl From<(u64, u64)> for ByteRange {
    fn from((start, end): (u64, u64)) -> Self {
        Self { start, end }
    }
}

impl From<ByteRange> for (u64, u64) {
    fn from(r: ByteRange) -> Self {
        (r.start, r.end)
    }
}

/// Durable record of which bytes of a partial file are already on disk.
///
/// `completed` is kept sorted, non-overlapping and non-adjacent, and never
/// reaches past `total_size`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ResumeRecord {
    pub url: String,
    pub total_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default)]
    pub completed: Vec<ByteRange>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl ResumeRecord {
    pub fn new(url: impl Into<String>, total_size: u64, checksum: Option<String>) -> Self {
        Self {
            url: url.into(),
            total_size,
            checksum,
            completed: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Merges `range` into the completed set. Returns whether anything changed.
    pub fn insert(&mut self, range: ByteRange) -> bool {
        let range = ByteRange::new(range.start, range.end.min(self.total_size));
        if range.is_empty() {
            return false;
        }
        if self
            .completed
            .iter()
            .any(|r| r.start <= range.start && range.end <= r.end)
        {
            return false;
        }

        self.completed.push(range);
        self.completed.sort_unstable();
        let mut merged: Vec<ByteRange> = Vec::with_capacity(self.completed.len());
        for r in self.completed.drain(..) {
            match merged.last_mut() {
                Some(last) if r.start <= last.end => last.end = last.end.max(r.end),
                _ => merged.push(r),
            }
        }
        self.completed = merged;
        self.updated_at = Utc::now();
        true
    }

    pub fn completed_bytes(&self) -> u64 {
        self.completed.iter().map(ByteRange::len).sum()
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.completed.as_slice(), [only] if only.start == 0 && only.end == self.total_size)
            || self.total_size == 0
    }

    /// The parts of `[0, total_size)` not yet recorded, in order.
    pub fn gaps(&self) -> Vec<ByteRange> {
        let mut gaps = Vec::new();
        let mut cursor = 0;
        for r in &self.completed {
            if r.start > cursor {
                gaps.push(ByteRange::new(cursor, r.start));
            }
            cursor = cursor.max(r.end);
        }
        if cursor < self.total_size {
            gaps.push(ByteRange::new(cursor, self.total_size));
        }
        gaps
    }

    /// Rebuilds `completed` through `insert`, dropping anything out of bounds.
    fn normalize(&mut self) {
        let ranges = std::mem::take(&mut self.completed);
        for r in ranges {
            self.insert(r);
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Where the bytes of an in-progress download of `archive` are written.
pub fn part_path(archive: &Path) -> PathBuf {
    with_suffix(archive, ".part")
}

/// One store per destination file, at `<archive>.part.json`.
#[derive(Debug, Clone)]
pub struct ResumeStore {
    path: PathBuf,
}

impl ResumeStore {
    pub fn for_archive(archive: &Path) -> Self {
        Self {
            path: with_suffix(archive, ".part.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unreadable records load as `None`.
    pub async fn load(&self) -> Result<Option<ResumeRecord>> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(EngineError::disk(&self.path, e)),
        };
        match serde_json::from_str::<ResumeRecord>(&content) {
            Ok(mut record) => {
                record.normalize();
                Ok(Some(record))
            }
            Err(e) => {
                warn!(path = ?self.path, error = %e, "discarding unreadable resume record");
                Ok(None)
            }
        }
    }

    /// Replaces the record on disk in one rename so readers never see a torn file.
    pub async fn save(&self, record: &ResumeRecord) -> Result<()> {
        let content = serde_json::to_vec_pretty(record).map_err(|e| EngineError::StateCorrupt {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        let tmp = with_suffix(&self.path, ".tmp");
        let mut file = fs::File::create(&tmp)
            .await
            .map_err(|e| EngineError::disk(&tmp, e))?;
        file.write_all(&content)
            .await
            .map_err(|e| EngineError::disk(&tmp, e))?;
        file.sync_all().await.map_err(|e| EngineError::disk(&tmp, e))?;
        drop(file);
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| EngineError::disk(&self.path, e))?;
        Ok(())
    }

    /// Merges `range` into `record` and persists it if that changed anything.
    pub async fn record_range(&self, record: &mut ResumeRecord, range: ByteRange) -> Result<bool> {
        if !record.insert(range) {
            return Ok(false);
        }
        self.save(record).await?;
        Ok(true)
    }

    pub async fn clear(&self) -> Result<()> {
        for path in [self.path.clone(), with_suffix(&self.path, ".tmp")] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(EngineError::disk(path, e)),
            }
        }
        Ok(())
    }

    /// Hands the record to a single writer task that owns it for the rest of the run.
    ///
    /// Before each save the bytes of `data` are synced, so a saved range is never
    /// ahead of the partial file. If a save fails the writer cancels `abort` and
    /// stops accepting ranges; the error comes back from `finish`.
    pub fn spawn_writer(self, record: ResumeRecord, data: Arc<Mutex<fs::File>>, abort: CancellationToken) -> CheckpointWriter {
        let (tx, mut rx) = mpsc::unbounded_channel::<ByteRange>();
        let handle = tokio::spawn(async move {
            let mut record = record;
            while let Some(range) = rx.recv().await {
                let mut changed = record.insert(range);
                while let Ok(range) = rx.try_recv() {
                    changed |= record.insert(range);
                }
                if !changed {
                    continue;
                }
                if let Err(e) = self.checkpoint(&record, &data).await {
                    warn!(path = ?self.path, error = %e, "checkpoint failed, stopping transfer");
                    abort.cancel();
                    return Err(e);
                }
                debug!(
                    path = ?self.path,
                    done = record.completed_bytes(),
                    total = record.total_size,
                    "checkpoint"
                );
            }
            Ok::<_, EngineError>(record)
        });
        CheckpointWriter { tx, handle }
    }

    async fn checkpoint(&self, record: &ResumeRecord, data: &Mutex<fs::File>) -> Result<()> {
        data.lock()
            .await
            .sync_data()
            .await
            .map_err(|e| EngineError::disk(self.path.with_extension(""), e))?;
        self.save(record).await
    }
}

/// Cheap handle fetchers use to report written spans.
#[derive(Debug, Clone)]
pub struct CheckpointSender {
    tx: mpsc::UnboundedSender<ByteRange>,
}

impl CheckpointSender {
    /// Fails with `Cancelled` once the writer has stopped; its own error is
    /// reported by `CheckpointWriter::finish`.
    pub fn record(&self, range: ByteRange) -> Result<()> {
        self.tx.send(range).map_err(|_| EngineError::Cancelled)
    }
}

pub struct CheckpointWriter {
    tx: mpsc::UnboundedSender<ByteRange>,
    handle: JoinHandle<Result<ResumeRecord>>,
}

impl CheckpointWriter {
    pub fn sender(&self) -> CheckpointSender {
        CheckpointSender {
            tx: self.tx.clone(),
        }
    }

    /// Waits until every reported range is on disk and returns the final record.
    /// All senders must have been dropped.
    pub async fn finish(self) -> Result<ResumeRecord> {
        drop(self.tx);
        self.handle.await?
    }
}
