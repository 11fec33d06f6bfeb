use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use coco_fetch::{EngineConfig, VerifyMode};

#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable COCO 2017 downloader", long_about = None)]
pub struct Args {
    /// Directory the archives are downloaded to and extracted in
    #[arg(short = 'd', long = "download-dir", default_value = "coco")]
    pub download_dir: PathBuf,

    /// Only fetch the training images (plus annotations)
    #[arg(long)]
    pub train_only: bool,

    /// Only fetch the validation images (plus annotations)
    #[arg(long)]
    pub val_only: bool,

    /// Segments fetched in parallel per file
    #[arg(short = 's', long)]
    pub split: Option<usize>,

    /// Files downloaded at the same time (defaults to number of logical CPUs)
    #[arg(short = 'c', long)]
    pub concurrency: Option<usize>,

    /// Global rate limit in bytes per second (e.g., 1048576 for 1MB/s)
    #[arg(short = 'r', long)]
    pub rate_limit: Option<u32>,

    /// Retries per segment before it is given up
    #[arg(long)]
    pub retries: Option<u32>,

    /// Seconds a read may stall before the segment is retried
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Hash verification: auto (only when hash known), on (require hash), off (size only)
    #[arg(long = "verify-hash", value_enum)]
    pub verify_hash: Option<VerifyMode>,

    /// Keep the archives instead of extracting them
    #[arg(long)]
    pub no_extract: bool,

    /// JSON file with engine settings; flags override it
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// List all downloads and their status
    #[arg(short = 'l', long)]
    pub list: bool,

    /// Keep refreshing the download list (like tail -f)
    #[arg(short = 'f', long)]
    pub follow: bool,

    /// Delete resume records and partial files, then exit
    #[arg(long)]
    pub clean: bool,

    /// Debug logging for the engine
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

impl Args {
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::load(path)?,
            None => EngineConfig::default(),
        };
        if let Some(split) = self.split {
            config.max_segments = split;
        }
        if let Some(concurrency) = self.concurrency {
            config.file_concurrency = concurrency;
        }
        if self.rate_limit.is_some() {
            config.rate_limit = self.rate_limit;
        }
        if let Some(retries) = self.retries {
            config.max_retries = retries;
        }
        if let Some(timeout) = self.timeout {
            config.read_timeout_secs = timeout;
        }
        if let Some(mode) = self.verify_hash {
            config.verify_mode = mode;
        }
        if self.no_extract {
            config.extract = false;
        }
        Ok(config.normalized())
    }
}
