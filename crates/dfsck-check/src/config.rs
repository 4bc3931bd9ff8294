//! Checker configuration.
//!
//! Every field has a default, so a partial JSON document (or `{}`) is a
//! valid configuration. Call [`FsckConfig::validate`] before handing the
//! sub-configs to constructors.

use dfsck_error::{FsckError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryCacheConfig {
    /// Hash buckets per category; a segment lands in `segno % bucket_count`.
    pub bucket_count: usize,
    /// Entries kept per bucket before the least recently used is evicted.
    pub bucket_capacity: usize,
}

impl Default for SummaryCacheConfig {
    fn default() -> Self {
        Self {
            bucket_count: 64,
            bucket_capacity: 8,
        }
    }
}

impl SummaryCacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bucket_count == 0 {
            return Err(FsckError::InvalidConfig(
                "summary_cache.bucket_count must be > 0".to_owned(),
            ));
        }
        if self.bucket_capacity == 0 {
            return Err(FsckError::InvalidConfig(
                "summary_cache.bucket_capacity must be > 0".to_owned(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadaheadConfig {
    /// Spawn per-category workers; otherwise hints are issued inline.
    pub enabled: bool,
}

impl Default for ReadaheadConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsckConfig {
    /// Repair mode. Findings are the same either way.
    pub fix_on: bool,
    pub summary_cache: SummaryCacheConfig,
    pub readahead: ReadaheadConfig,
    /// Time budget of one pass.
    pub overtime_ms: u64,
}

impl Default for FsckConfig {
    fn default() -> Self {
        Self {
            fix_on: false,
            summary_cache: SummaryCacheConfig::default(),
            readahead: ReadaheadConfig::default(),
            overtime_ms: 1000,
        }
    }
}

impl FsckConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| FsckError::InvalidConfig(format!("config parse: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.summary_cache.validate()
    }

    #[must_use]
    pub fn overtime(&self) -> Duration {
        Duration::from_millis(self.overtime_ms)
    }
}
