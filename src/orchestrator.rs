use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::EngineConfig;
use crate::dataset::DatasetFile;
use crate::error::{EngineError, Result};
use crate::fetcher::Throttle;
use crate::progress::{ProgressEvent, ProgressReporter, StatusBoard, TransferId, TransferState, TransferStatus};
use crate::source::RangeSource;
use crate::state::{part_path, ResumeStore};
use crate::transfer::{remove_if_exists, TransferCoordinator, TransferReport};

/// Merged event stream of one `start_all` call.
pub struct ProgressStream {
    events: mpsc::UnboundedReceiver<ProgressEvent>,
    done: JoinHandle<Vec<TransferReport>>,
}

impl ProgressStream {
    /// Next event, or `None` once every transfer has reached a terminal state.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.events.recv().await
    }

    /// Waits for all transfers and returns their reports in dataset order.
    pub async fn wait(self) -> Result<Vec<TransferReport>> {
        drop(self.events);
        Ok(self.done.await?)
    }
}

#[derive(Debug, Clone)]
pub enum ClearTarget {
    One(TransferId),
    All,
}

/// Held by a transfer for its whole run, and by `clear_cache` while it deletes.
type Slot = Arc<AsyncMutex<()>>;

/// Runs the fixed list of dataset files through the download pipeline.
pub struct Engine {
    source: Arc<dyn RangeSource>,
    files: Vec<DatasetFile>,
    board: StatusBoard,
    tokens: Arc<Mutex<BTreeMap<TransferId, CancellationToken>>>,
    slots: BTreeMap<TransferId, Slot>,
}

impl Engine {
    pub fn new(source: Arc<dyn RangeSource>, files: Vec<DatasetFile>) -> Self {
        let board = StatusBoard::default();
        {
            let mut b = board.lock().unwrap_or_else(|e| e.into_inner());
            for file in &files {
                b.insert(
                    file.id.clone(),
                    TransferStatus {
                        id: file.id.clone(),
                        state: TransferState::Planned,
                        bytes_done: 0,
                        bytes_total: None,
                        reason: None,
                    },
                );
            }
        }
        let slots = files.iter().map(|f| (f.id.clone(), Slot::default())).collect();
        Self {
            source,
            files,
            board,
            tokens: Arc::default(),
            slots,
        }
    }

    pub fn files(&self) -> &[DatasetFile] {
        &self.files
    }

    /// Starts every transfer, at most `config.file_concurrency` at a time.
    /// A failed transfer never stops its siblings.
    pub fn start_all(&self, destination_root: &Path, config: EngineConfig) -> Result<ProgressStream> {
        std::fs::create_dir_all(destination_root).map_err(|e| EngineError::disk(destination_root, e))?;
        let config = Arc::new(config.normalized());
        let throttle = config.rate_limit.and_then(Throttle::new);
        let pool = Arc::new(Semaphore::new(config.file_concurrency));
        let (tx, rx) = mpsc::unbounded_channel();

        let mut handles = Vec::with_capacity(self.files.len());
        for file in &self.files {
            let token = CancellationToken::new();
            {
                let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(previous) = tokens.insert(file.id.clone(), token.clone()) {
                    previous.cancel();
                }
            }
            let reporter = Arc::new(ProgressReporter::new(file.id.clone(), tx.clone(), self.board.clone()));
            reporter.set_state(TransferState::Planned, None);
            let coordinator = TransferCoordinator::new(
                file.clone(),
                destination_root.to_path_buf(),
                self.source.clone(),
                config.clone(),
                reporter,
                token,
                throttle.clone(),
            );
            let pool = pool.clone();
            let slot = self.slot(&file.id);
            let id = file.id.clone();
            handles.push((
                id,
                tokio::spawn(async move {
                    let _permit = pool.acquire_owned().await.ok();
                    let _running = slot.lock_owned().await;
                    coordinator.run().await
                }),
            ));
        }
        drop(tx);

        let board = self.board.clone();
        let done = tokio::spawn(async move {
            let mut reports = Vec::with_capacity(handles.len());
            for (id, handle) in handles {
                match handle.await {
                    Ok(report) => reports.push(report),
                    Err(e) => {
                        error!(%id, error = %e, "transfer task panicked");
                        let reason = format!("internal error: {}", e);
                        if let Some(status) = board.lock().unwrap_or_else(|p| p.into_inner()).get_mut(&id) {
                            status.state = TransferState::Failed;
                            status.reason = Some(reason.clone());
                        }
                        reports.push(TransferReport {
                            id,
                            state: TransferState::Failed,
                            reason: Some(reason),
                            bytes_fetched: 0,
                            segment_retries: BTreeMap::new(),
                        });
                    }
                }
            }
            let failed = reports.iter().filter(|r| r.state == TransferState::Failed).count();
            info!(transfers = reports.len(), failed, "job finished");
            reports
        });

        Ok(ProgressStream { events: rx, done })
    }

    /// Asks a running transfer to stop at its next chunk boundary.
    pub fn cancel(&self, id: &TransferId) -> Result<()> {
        let tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        let token = tokens
            .get(id)
            .ok_or_else(|| EngineError::UnknownTransfer(id.to_string()))?;
        token.cancel();
        info!(%id, "cancel requested");
        Ok(())
    }

    pub fn cancel_all(&self) {
        for token in self.tokens.lock().unwrap_or_else(|e| e.into_inner()).values() {
            token.cancel();
        }
    }

    /// Deletes the resume record and partial bytes. Refuses with `Busy` while a
    /// transfer is running, from probe to its terminal state.
    pub async fn clear_cache(&self, destination_root: &Path, target: ClearTarget) -> Result<Vec<PathBuf>> {
        let files: Vec<&DatasetFile> = match &target {
            ClearTarget::All => self.files.iter().collect(),
            ClearTarget::One(id) => vec![self
                .files
                .iter()
                .find(|f| &f.id == id)
                .ok_or_else(|| EngineError::UnknownTransfer(id.to_string()))?],
        };

        // Holding every slot keeps transfers from starting until the files are gone.
        let mut held = Vec::with_capacity(files.len());
        for file in &files {
            match self.slot(&file.id).try_lock_owned() {
                Ok(guard) => held.push(guard),
                Err(_) => return Err(EngineError::Busy(file.id.to_string())),
            }
        }

        let mut removed = Vec::new();
        for file in files {
            let archive = file.archive_path(destination_root);
            let store = ResumeStore::for_archive(&archive);
            let part = part_path(&archive);
            for path in [store.path().to_path_buf(), part.clone()] {
                if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    removed.push(path);
                }
            }
            // Record first: a record without its partial file is discarded on the next run anyway.
            store.clear().await?;
            remove_if_exists(&part).await?;

            if let Some(status) = self.board.lock().unwrap_or_else(|e| e.into_inner()).get_mut(&file.id) {
                status.state = TransferState::Planned;
                status.bytes_done = 0;
                status.reason = None;
            }
            info!(id = %file.id, "cache cleared");
        }
        drop(held);
        Ok(removed)
    }

    fn slot(&self, id: &TransferId) -> Slot {
        self.slots.get(id).cloned().unwrap_or_default()
    }

    /// Snapshot of every transfer, in dataset order.
    pub fn status(&self) -> Vec<TransferStatus> {
        let board = self.board.lock().unwrap_or_else(|e| e.into_inner());
        self.files
            .iter()
            .filter_map(|f| board.get(&f.id).cloned())
            .collect()
    }
}
