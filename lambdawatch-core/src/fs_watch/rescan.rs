use std::path::Path;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::WatchEvent;
use crate::dataset::PathClassifier;
use crate::error::{Result, WatchError};

/// Files found by a directory walk, as synthetic `Created` events.
#[derive(Debug, Default)]
pub struct RescanReport {
    pub events: Vec<WatchEvent>,
    pub files_seen: usize,
    pub ignored: usize,
    pub errors: Vec<String>,
}

/// Walk `root` and emit one `Created` event per classifiable file, stamped
/// with the file's modification time. Blocking; run it off the runtime.
pub fn rescan(root: &Path, recursive: bool, classifier: &dyn PathClassifier) -> Result<RescanReport> {
    if !root.is_dir() {
        return Err(WatchError::MissingDirectory(root.to_path_buf()));
    }

    let mut walker = WalkDir::new(root).follow_links(false);
    if !recursive {
        walker = walker.max_depth(1);
    }

    let mut report = RescanReport::default();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Error walking directory: {}", e);
                report.errors.push(format!("Directory walk error: {e}"));
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        report.files_seen += 1;
        let path = entry.path();
        if classifier.classify(path).is_none() {
            report.ignored += 1;
            continue;
        }

        match WatchEvent::from_existing(path) {
            Ok(event) => report.events.push(event),
            Err(e) => {
                debug!("Skipping {}: {}", path.display(), e);
                report.errors.push(format!("{}: {}", path.display(), e));
            }
        }
    }

    // Oldest first, so per-path ordering matches what a live watcher would
    // have delivered.
    report.events.sort_by(|a, b| a.observed_at.cmp(&b.observed_at));

    info!(
        root = %root.display(),
        files = report.files_seen,
        parts = report.events.len(),
        ignored = report.ignored,
        errors = report.errors.len(),
        "re-scan complete"
    );
    Ok(report)
}
