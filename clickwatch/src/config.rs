// clickwatch/src/config.rs
//
// Worker configuration. Every threshold and window is explicit here and handed
// to the components that need it at construction; nothing reads globals.
//
// Defaults:
//   spike window 5 min, threshold 100
//   flood window 3 min, threshold 30
//   pass interval 60 s, connection retry interval 10 s

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::workers::flood::FloodConfig;
use crate::workers::spike::SpikeConfig;

pub const PASS_INTERVAL_SECS: u64 = 60;
pub const RETRY_INTERVAL_SECS: u64 = 10;

/// Longest accepted window. Keeps window arithmetic far away from chrono's range.
pub const MAX_WINDOW_SECS: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub spike:               SpikeConfig,
    pub flood:               FloodConfig,
    pub pass_interval_secs:  u64,
    pub retry_interval_secs: u64,
    pub audit_dir:           Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            spike:               SpikeConfig::default(),
            flood:               FloodConfig::default(),
            pass_interval_secs:  PASS_INTERVAL_SECS,
            retry_interval_secs: RETRY_INTERVAL_SECS,
            audit_dir:           None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} threshold must be at least 1")]
    ZeroThreshold(&'static str),

    #[error("{0} must be greater than zero seconds")]
    ZeroDuration(&'static str),

    #[error("{0} must not exceed 30 days")]
    WindowTooLong(&'static str),
}

impl WorkerConfig {
    pub fn pass_interval(&self) -> Duration {
        Duration::from_secs(self.pass_interval_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.spike.threshold == 0 { return Err(ConfigError::ZeroThreshold("spike")); }
        if self.flood.threshold == 0 { return Err(ConfigError::ZeroThreshold("flood")); }

        for (name, secs) in [("spike window", self.spike.window_secs), ("flood window", self.flood.window_secs)] {
            if secs == 0 { return Err(ConfigError::ZeroDuration(name)); }
            if secs > MAX_WINDOW_SECS { return Err(ConfigError::WindowTooLong(name)); }
        }
        if self.pass_interval_secs == 0 { return Err(ConfigError::ZeroDuration("pass interval")); }
        if self.retry_interval_secs == 0 { return Err(ConfigError::ZeroDuration("retry interval")); }
        Ok(())
    }
}
