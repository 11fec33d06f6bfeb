use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;

#[derive(Serialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransferId(String);

impl TransferId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Planned,
    InProgress,
    Verifying,
    Extracting,
    Completed,
    Failed,
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planned => "Planned",
            Self::InProgress => "Downloading",
            Self::Verifying => "Verifying",
            Self::Extracting => "Extracting",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

/// One entry of the progress stream.
#[derive(Serialize, Debug, Clone)]
pub struct ProgressEvent {
    pub transfer_id: TransferId,
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
    pub rate_per_sec: f64,
    pub state: TransferState,
    /// Human-readable explanation, set on terminal states.
    pub reason: Option<String>,
}

/// Latest known state of a transfer, as returned by `Engine::status`.
#[derive(Serialize, Debug, Clone)]
pub struct TransferStatus {
    pub id: TransferId,
    pub state: TransferState,
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
    pub reason: Option<String>,
}

pub type StatusBoard = Arc<Mutex<BTreeMap<TransferId, TransferStatus>>>;

/// Publishes one transfer's progress to the event stream and the status board.
pub struct ProgressReporter {
    id: TransferId,
    tx: mpsc::UnboundedSender<ProgressEvent>,
    board: StatusBoard,
    bytes_done: Arc<AtomicU64>,
    bytes_total: AtomicU64,
    state: Mutex<TransferState>,
}

impl ProgressReporter {
    pub fn new(id: TransferId, tx: mpsc::UnboundedSender<ProgressEvent>, board: StatusBoard) -> Self {
        Self {
            id,
            tx,
            board,
            bytes_done: Arc::new(AtomicU64::new(0)),
            bytes_total: AtomicU64::new(0),
            state: Mutex::new(TransferState::Planned),
        }
    }

    pub fn id(&self) -> &TransferId {
        &self.id
    }

    /// Counter fetchers add written byte deltas to.
    pub fn counter(&self) -> Arc<AtomicU64> {
        self.bytes_done.clone()
    }

    pub fn bytes_done(&self) -> u64 {
        self.bytes_done.load(Ordering::Relaxed)
    }

    pub fn set_bytes_done(&self, done: u64) {
        self.bytes_done.store(done, Ordering::Relaxed);
    }

    pub fn set_total(&self, total: Option<u64>) {
        self.bytes_total.store(total.unwrap_or(0), Ordering::Relaxed);
    }

    fn total(&self) -> Option<u64> {
        Some(self.bytes_total.load(Ordering::Relaxed)).filter(|&t| t > 0)
    }

    pub fn state(&self) -> TransferState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_state(&self, state: TransferState, reason: Option<String>) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
        self.publish(0.0, reason);
    }

    fn publish(&self, rate_per_sec: f64, reason: Option<String>) {
        let event = ProgressEvent {
            transfer_id: self.id.clone(),
            bytes_done: self.bytes_done(),
            bytes_total: self.total(),
            rate_per_sec,
            state: self.state(),
            reason,
        };
        {
            let mut board = self.board.lock().unwrap_or_else(|e| e.into_inner());
            let entry = board.entry(self.id.clone()).or_insert_with(|| TransferStatus {
                id: self.id.clone(),
                state: event.state,
                bytes_done: 0,
                bytes_total: None,
                reason: None,
            });
            entry.state = event.state;
            entry.bytes_done = event.bytes_done;
            entry.bytes_total = event.bytes_total;
            if event.reason.is_some() || !event.state.is_terminal() {
                entry.reason = event.reason.clone();
            }
        }
        // Nobody listening is fine.
        let _ = self.tx.send(event);
    }

    /// Emits a snapshot every `progress_interval` until `stop` fires, however
    /// often the fetchers write.
    pub fn spawn_ticker(self: &Arc<Self>, config: &EngineConfig, stop: CancellationToken) -> JoinHandle<()> {
        let reporter = self.clone();
        let period = config.progress_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut last_bytes = reporter.bytes_done();
            let mut last_at = Instant::now();
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let now = Instant::now();
                let bytes = reporter.bytes_done();
                let elapsed = now.duration_since(last_at).as_secs_f64();
                let rate = if elapsed > 0.0 {
                    bytes.saturating_sub(last_bytes) as f64 / elapsed
                } else {
                    0.0
                };
                last_bytes = bytes;
                last_at = now;
                reporter.publish(rate, None);
            }
        })
    }
}
