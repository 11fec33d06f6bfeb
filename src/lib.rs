//! Resumable, segmented download engine for large dataset archives.
//!
//! Each archive is split into byte ranges fetched in parallel, checkpointed to a
//! resume record as bytes land on disk, verified, then unpacked in place.

pub mod config;
pub mod dataset;
pub mod error;
pub mod extract;
pub mod fetcher;
pub mod logging;
pub mod orchestrator;
pub mod planner;
pub mod progress;
pub mod source;
pub mod state;
pub mod transfer;
pub mod utils;
pub mod verify;

pub use config::{EngineConfig, VerifyMode};
pub use dataset::DatasetFile;
pub use error::{EngineError, Result};
pub use orchestrator::{ClearTarget, Engine, ProgressStream};
pub use progress::{ProgressEvent, TransferId, TransferState, TransferStatus};
pub use source::{HttpSource, RangeResponse, RangeSource, RemoteInfo};
pub use transfer::TransferReport;
