use std::path::PathBuf;

use lambdawatch_core::SessionConfig;
use serde::{Deserialize, Serialize};

/// Everything the operator binary needs to run a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    /// Directory the `watch` command monitors when `--dir` is not given.
    pub watch_dir: Option<PathBuf>,
    /// Completion, naming, dispatch and watcher tuning for the core.
    pub session: SessionConfig,
    /// External command that processes a complete dataset.
    pub processor: ProcessorConfig,
    /// How many times `watch` restarts a session whose event source failed.
    /// Each restart resumes from the retained registry with a fresh re-scan.
    pub max_restarts: u32,
}

/// Command run once per complete dataset.
///
/// Arguments are templates: `{key}`, `{stem}`, `{dir}`, `{parts}` and
/// `{part1}`..`{partK}` are substituted per job. `{parts}` expands to one
/// argument per part file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ProcessorConfig {
    pub program: Option<String>,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Path template; when the expanded path exists the dataset counts as
    /// already processed and is not seeded on startup.
    pub skip_if_exists: Option<String>,
    /// Kill the command after this long (ms). `None` waits indefinitely.
    pub timeout_ms: Option<u64>,
}
