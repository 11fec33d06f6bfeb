use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::fs;
use tracing::warn;

use coco_fetch::state::{part_path, ResumeStore};
use coco_fetch::{
    ClearTarget, DatasetFile, Engine, EngineConfig, HttpSource, ProgressEvent, TransferId, TransferState,
};

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes:>12}/{total_bytes:<12} {bytes_per_sec:>12} {eta:>4} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

struct Bars {
    multi: MultiProgress,
    header: ProgressBar,
    files: HashMap<TransferId, ProgressBar>,
    latest: HashMap<TransferId, (u64, Option<u64>, TransferState)>,
}

impl Bars {
    fn new(files: &[DatasetFile]) -> Self {
        let multi = MultiProgress::with_draw_target(ProgressDrawTarget::stderr_with_hz(5));
        let header = multi.add(ProgressBar::new_spinner());
        header.set_style(
            ProgressStyle::default_spinner()
                .template("{msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        let mut bars = HashMap::new();
        let mut latest = HashMap::new();
        for file in files {
            let pb = multi.add(ProgressBar::new(0));
            pb.set_style(bar_style());
            pb.set_message(format!("Waiting     {}", file.id));
            bars.insert(file.id.clone(), pb);
            latest.insert(file.id.clone(), (0, None, TransferState::Planned));
        }
        let bars = Self {
            multi,
            header,
            files: bars,
            latest,
        };
        bars.update_header();
        bars
    }

    fn apply(&mut self, event: &ProgressEvent) {
        let Some(pb) = self.files.get(&event.transfer_id) else {
            return;
        };
        if let Some(total) = event.bytes_total {
            pb.set_length(total);
        }
        pb.set_position(event.bytes_done);
        let id = &event.transfer_id;
        match event.state {
            TransferState::Planned => pb.set_message(format!("Probing     {}", id)),
            TransferState::InProgress => pb.set_message(format!("Downloading {}", id)),
            TransferState::Verifying => pb.set_message(format!("Verifying   {}", id)),
            TransferState::Extracting => pb.set_message(format!("Extracting  {}", id)),
            TransferState::Completed => pb.finish_with_message(format!("Completed   {}", id)),
            TransferState::Failed => pb.abandon_with_message(format!(
                "Failed      {}: {}",
                id,
                event.reason.as_deref().unwrap_or("unknown error")
            )),
            TransferState::Cancelled => pb.abandon_with_message(format!("Cancelled   {}", id)),
        }
        self.latest
            .insert(id.clone(), (event.bytes_done, event.bytes_total, event.state));
        self.update_header();
    }

    fn update_header(&self) {
        let finished = self
            .latest
            .values()
            .filter(|(_, _, state)| *state == TransferState::Completed)
            .count();
        let done: u64 = self.latest.values().map(|(d, _, _)| d).sum();
        let total: u64 = self.latest.values().filter_map(|(_, t, _)| *t).sum();
        self.header.set_message(format!(
            "Summary: Files: {}/{} | Downloaded: {} / {}",
            finished,
            self.latest.len(),
            HumanBytes(done),
            HumanBytes(total)
        ));
    }

    fn finish(&self) {
        self.header.finish();
        if let Err(e) = self.multi.clear() {
            warn!(error = %e, "failed to clear progress bars");
        }
    }
}

pub async fn run_downloads(root: PathBuf, files: Vec<DatasetFile>, config: EngineConfig) -> Result<()> {
    let source = Arc::new(HttpSource::new(&config).context("Failed to build HTTP client")?);
    let engine = Arc::new(Engine::new(source, files));
    let mut stream = engine
        .start_all(&root, config)
        .with_context(|| format!("Failed to start downloads into {:?}", root))?;

    let ctrl_c = {
        let engine = engine.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Interrupted, stopping transfers (progress is kept for resume)...");
                engine.cancel_all();
            }
        })
    };

    let mut bars = Bars::new(engine.files());
    while let Some(event) = stream.recv().await {
        bars.apply(&event);
    }
    bars.finish();
    ctrl_c.abort();

    let reports = stream.wait().await?;
    let mut failed = Vec::new();
    for report in &reports {
        println!(
            "{:<15} {:<12} {}",
            report.id.as_str(),
            report.state.to_string(),
            report.reason.as_deref().unwrap_or("")
        );
        if report.state == TransferState::Failed {
            failed.push(report.id.to_string());
        }
    }

    if reports.iter().any(|r| r.state == TransferState::Cancelled) {
        println!("Re-run the same command to resume.");
    }
    if !failed.is_empty() {
        bail!("{} transfer(s) failed: {}", failed.len(), failed.join(", "));
    }
    Ok(())
}

pub async fn list_downloads(root: &Path, files: &[DatasetFile]) -> Result<()> {
    if !root.exists() {
        println!("Download directory '{:?}' does not exist.", root);
        println!("Tip: If you used a custom directory, please specify it with --download-dir");
        return Ok(());
    }

    let mut rows = Vec::with_capacity(files.len());
    let mut finished = 0;
    let mut active = 0;
    let mut total_downloaded: u64 = 0;
    let mut total_known: u64 = 0;

    for file in files {
        let archive = file.archive_path(root);
        let store = ResumeStore::for_archive(&archive);
        let record = match store.load().await {
            Ok(record) => record,
            Err(e) => {
                warn!(id = %file.id, error = %e, "failed to read resume record");
                None
            }
        };

        let row = if file.is_extracted(root) {
            finished += 1;
            (file.id.to_string(), "Extracted".to_string(), "100.00%".to_string(), "-".to_string(), String::new())
        } else if let Some(record) = record.filter(|_| part_path(&archive).exists()) {
            active += 1;
            let done = record.completed_bytes();
            total_downloaded += done;
            total_known += record.total_size;
            let progress = if record.total_size > 0 {
                (done as f64 / record.total_size as f64) * 100.0
            } else {
                0.0
            };
            (
                file.id.to_string(),
                "Partial".to_string(),
                format!("{:.2}%", progress),
                format!("{}", HumanBytes(record.total_size)),
                record
                    .updated_at
                    .with_timezone(&chrono::Local)
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string(),
            )
        } else if let Ok(metadata) = fs::metadata(&archive).await {
            finished += 1;
            total_downloaded += metadata.len();
            total_known += metadata.len();
            (
                file.id.to_string(),
                "Downloaded".to_string(),
                "100.00%".to_string(),
                format!("{}", HumanBytes(metadata.len())),
                String::new(),
            )
        } else {
            (file.id.to_string(), "Missing".to_string(), "0.00%".to_string(), "-".to_string(), String::new())
        };
        rows.push(row);
    }

    println!(
        "Summary: Files: {}/{} | Active: {} | Downloaded: {} / {}",
        finished,
        files.len(),
        active,
        HumanBytes(total_downloaded),
        HumanBytes(total_known)
    );
    println!();

    println!("{:<50} {:<15} {:<15} {:<15} {}", "Filename", "Status", "Progress", "Size", "Updated");
    println!("{:-<50} {:-<15} {:-<15} {:-<15} {:-<19}", "", "", "", "", "");
    for (name, status, progress, size, updated) in rows {
        println!("{:<50} {:<15} {:<15} {:<15} {}", name, status, progress, size, updated);
    }
    Ok(())
}

pub async fn follow_log(root: &Path, files: &[DatasetFile]) -> Result<()> {
    loop {
        print!("\x1B[1;1H\x1B[0J");
        list_downloads(root, files).await?;
        println!("\n(Press Ctrl+C to exit view)");
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

pub async fn clear_cache(root: &Path, files: Vec<DatasetFile>, config: &EngineConfig) -> Result<()> {
    let source = Arc::new(HttpSource::new(config).context("Failed to build HTTP client")?);
    let engine = Engine::new(source, files);
    let removed = engine.clear_cache(root, ClearTarget::All).await?;
    if removed.is_empty() {
        println!("Nothing to clean in {:?}.", root);
    }
    for path in removed {
        println!("Removed {:?}", path);
    }
    Ok(())
}
