pub mod batch;
pub mod scan;
pub mod watch;

use std::collections::BTreeMap;
use std::path::PathBuf;

use lambdawatch_core::{DatasetKey, PartIndex, PathClassifier, SharedRegistry};
use tracing::info;

/// Part files grouped by the dataset they belong to.
#[derive(Debug, Default)]
pub struct Grouping {
    pub datasets: BTreeMap<DatasetKey, BTreeMap<PartIndex, PathBuf>>,
    pub unrecognized: Vec<PathBuf>,
}

impl Grouping {
    pub fn from_paths<I>(classifier: &dyn PathClassifier, paths: I) -> Self
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let mut grouping = Grouping::default();
        for path in paths {
            match classifier.classify(&path) {
                Some(classification) => {
                    grouping
                        .datasets
                        .entry(classification.key)
                        .or_default()
                        .insert(classification.part, path);
                }
                None => grouping.unrecognized.push(path),
            }
        }
        grouping
    }

    pub fn is_complete(parts: &BTreeMap<PartIndex, PathBuf>, required: u8) -> bool {
        parts.len() == usize::from(required)
    }

    /// Module numbers in `1..=required` with no file.
    pub fn missing(parts: &BTreeMap<PartIndex, PathBuf>, required: u8) -> Vec<u8> {
        (1..=required)
            .filter(|n| !parts.keys().any(|index| index.get() == *n))
            .collect()
    }
}

pub fn log_registry_summary(registry: &SharedRegistry) {
    let counts = registry.snapshot().counts;
    info!(
        pending = counts.pending,
        ready = counts.ready,
        dispatched = counts.dispatched,
        completed = counts.completed,
        failed = counts.failed,
        "registry summary"
    );
}
