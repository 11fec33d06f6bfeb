use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Hash verification: auto (only when a checksum is known), on (require one), off (size only).
#[derive(ValueEnum, Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VerifyMode {
    #[default]
    Auto,
    On,
    Off,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct EngineConfig {
    /// Segment workers per transfer.
    pub max_segments: usize,
    /// Remaining ranges below this size are never split further.
    pub min_chunk_size: u64,
    /// Retries per segment before it is marked errored.
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    /// How many times errored sub-ranges are re-planned before the transfer fails.
    pub replan_limit: u32,
    /// A read that stalls longer than this is treated as a network error.
    pub read_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub progress_interval_ms: u64,
    /// Transfers running at the same time.
    pub file_concurrency: usize,
    /// Global rate limit in bytes per second.
    pub rate_limit: Option<u32>,
    pub verify_mode: VerifyMode,
    pub extract: bool,
    pub user_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_segments: 4,
            min_chunk_size: 8 * 1024 * 1024,
            max_retries: 5,
            retry_base_delay_ms: 100,
            replan_limit: 1,
            read_timeout_secs: 30,
            connect_timeout_secs: 10,
            progress_interval_ms: 250,
            file_concurrency: num_cpus::get(),
            rate_limit: None,
            verify_mode: VerifyMode::Auto,
            extract: true,
            user_agent: concat!("coco-fetch/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        Ok(config.normalized())
    }

    /// Clamp values that would stall the engine.
    pub fn normalized(mut self) -> Self {
        self.max_segments = self.max_segments.max(1);
        self.file_concurrency = self.file_concurrency.max(1);
        self.min_chunk_size = self.min_chunk_size.max(1);
        self.progress_interval_ms = self.progress_interval_ms.max(10);
        if self.rate_limit == Some(0) {
            self.rate_limit = None;
        }
        self
    }

    pub fn retry_delay(&self, retry: u32) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms).saturating_mul(2_u32.saturating_pow(retry))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"max_segments": 8, "verify_mode": "off"}"#).unwrap();
        assert_eq!(config.max_segments, 8);
        assert_eq!(config.verify_mode, VerifyMode::Off);
        assert_eq!(config.max_retries, 5);
        assert!(config.extract);
    }

    #[test]
    fn retry_delay_doubles() {
        let config = EngineConfig {
            retry_base_delay_ms: 100,
            ..EngineConfig::default()
        };
        assert_eq!(config.retry_delay(0), Duration::from_millis(100));
        assert_eq!(config.retry_delay(1), Duration::from_millis(200));
        assert_eq!(config.retry_delay(3), Duration::from_millis(800));
    }

    #[test]
    fn normalized_clamps_zeroes() {
        let config = EngineConfig {
            max_segments: 0,
            file_concurrency: 0,
            rate_limit: Some(0),
            ..EngineConfig::default()
        }
        .normalized();
        assert_eq!(config.max_segments, 1);
        assert_eq!(config.file_concurrency, 1);
        assert_eq!(config.rate_limit, None);
    }
}
