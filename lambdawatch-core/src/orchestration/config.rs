use std::time::Duration as StdDuration;

use serde::{Deserialize, Serialize};

use crate::dataset::NamingConvention;
use crate::error::{Result, WatchError};

/// Knobs for one watch/dispatch session.
///
/// Every section carries defaults so a config file only needs to name the
/// values it changes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// File naming rule and the number of parts per dataset.
    pub naming: NamingConvention,
    /// Stability window, sweep cadence and retention.
    pub completion: CompletionConfig,
    /// Worker pool sizing.
    pub dispatch: DispatchConfig,
    /// Filesystem watcher behaviour.
    pub watch: FsWatchConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    /// A dataset is stable once no part changed for this long (ms).
    pub quiescence_window_ms: u64,
    /// Cadence of the readiness sweep (ms).
    pub evaluation_interval_ms: u64,
    /// Finished datasets older than this are evicted (ms). `None` keeps them
    /// for the life of the registry.
    pub retention_ms: Option<u64>,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            quiescence_window_ms: 2_000,
            evaluation_interval_ms: 500,
            retention_ms: None,
        }
    }
}

impl CompletionConfig {
    pub fn quiescence_window(&self) -> chrono::Duration {
        millis(self.quiescence_window_ms)
    }

    pub fn evaluation_interval(&self) -> StdDuration {
        StdDuration::from_millis(self.evaluation_interval_ms.max(1))
    }

    pub fn retention(&self) -> Option<chrono::Duration> {
        self.retention_ms.map(millis)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Number of datasets processed in parallel.
    pub max_concurrent_jobs: usize,
    /// How long `stop` waits for in-flight jobs (ms).
    pub shutdown_grace_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 1,
            shutdown_grace_ms: 30_000,
        }
    }
}

impl DispatchConfig {
    pub fn shutdown_grace(&self) -> StdDuration {
        StdDuration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsWatchConfig {
    /// Watch subdirectories of the root as well.
    pub recursive: bool,
    /// Seed the registry from files already on disk when a session starts.
    pub rescan_on_start: bool,
    /// Buffer between the notify callback and the session.
    pub channel_capacity: usize,
}

impl Default for FsWatchConfig {
    fn default() -> Self {
        Self {
            recursive: true,
            rescan_on_start: true,
            channel_capacity: 4_096,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        self.naming.validate()?;
        if self.completion.evaluation_interval_ms == 0 {
            return Err(WatchError::InvalidConfig(
                "completion.evaluation_interval_ms must be greater than zero".into(),
            ));
        }
        if i64::try_from(self.completion.quiescence_window_ms).is_err() {
            return Err(WatchError::InvalidConfig(
                "completion.quiescence_window_ms is out of range".into(),
            ));
        }
        if self.dispatch.max_concurrent_jobs == 0 {
            return Err(WatchError::InvalidConfig(
                "dispatch.max_concurrent_jobs must be at least 1".into(),
            ));
        }
        if self.watch.channel_capacity == 0 {
            return Err(WatchError::InvalidConfig(
                "watch.channel_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn millis(ms: u64) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}
