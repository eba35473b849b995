//! Event intake and the periodic readiness sweep.
//!
//! Readiness is decided by time as well as by events: a dataset whose last
//! part landed a moment ago becomes stable with no further notifications, so
//! `sweep` re-evaluates every pending dataset against the caller's clock.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace};

use crate::dataset::{
    Classification, DatasetKey, DatasetState, DatasetStatus, DispatchRejection, JobId,
    Observation, PathClassifier, SharedRegistry, StabilityTracker, UpsertOutcome,
};
use crate::fs_watch::{WatchEvent, WatchEventKind};

use super::config::CompletionConfig;
use super::dispatcher::{DispatchIntake, SubmitOutcome};
use super::progress::{ProgressReport, ProgressSink};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The path does not follow the naming convention.
    Unrecognized,
    /// Older than what was already observed for the path.
    Stale,
    /// Deletions never revoke a part; they are only counted.
    DeletionNoted,
    Recorded(UpsertOutcome),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Datasets promoted to `ReadyToDispatch` by this sweep.
    pub newly_ready: Vec<DatasetKey>,
    pub submitted: Vec<(DatasetKey, JobId)>,
    pub rejected: Vec<(DatasetKey, DispatchRejection)>,
    pub evicted: usize,
    /// Datasets still incomplete or inside the quiescence window, including
    /// ready ones whose parts were rewritten after promotion.
    pub settling: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EvaluatorDiagnostics {
    pub ignored_paths: u64,
    pub stale_dropped: u64,
    pub deletions_noted: u64,
    pub tracked_paths: usize,
}

pub struct CompletionEvaluator {
    classifier: Arc<dyn PathClassifier>,
    registry: SharedRegistry,
    tracker: Mutex<StabilityTracker>,
    quiescence: Duration,
    retention: Option<Duration>,
    ignored_paths: AtomicU64,
    deletions_noted: AtomicU64,
    progress: Option<Arc<dyn ProgressSink>>,
}

impl fmt::Debug for CompletionEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionEvaluator")
            .field("quiescence", &self.quiescence)
            .field("retention", &self.retention)
            .field("registry", &self.registry)
            .finish()
    }
}

impl CompletionEvaluator {
    pub fn new(
        classifier: Arc<dyn PathClassifier>,
        registry: SharedRegistry,
        config: &CompletionConfig,
    ) -> Self {
        Self {
            classifier,
            registry,
            tracker: Mutex::new(StabilityTracker::new()),
            quiescence: config.quiescence_window(),
            retention: config.retention(),
            ignored_paths: AtomicU64::new(0),
            deletions_noted: AtomicU64::new(0),
            progress: None,
        }
    }

    /// Report `ReadyToDispatch` to `progress` as datasets are promoted.
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn quiescence(&self) -> Duration {
        self.quiescence
    }

    pub fn classify(&self, path: &Path) -> Option<Classification> {
        self.classifier.classify(path)
    }

    /// Classify one watcher event and fold it into the tracker and registry.
    pub fn ingest(&self, event: &WatchEvent) -> IngestOutcome {
        let Some(classification) = self.classifier.classify(&event.path) else {
            self.ignored_paths.fetch_add(1, Ordering::Relaxed);
            trace!(
                target: "lambdawatch::intake",
                path = %event.path.display(),
                "path does not match naming convention"
            );
            return IngestOutcome::Unrecognized;
        };

        if event.kind == WatchEventKind::Deleted {
            self.deletions_noted.fetch_add(1, Ordering::Relaxed);
            debug!(
                target: "lambdawatch::intake",
                dataset = %classification.key,
                part = %classification.part,
                "part deleted; keeping it as seen"
            );
            return IngestOutcome::DeletionNoted;
        }

        let observation = self.tracker.lock().observe(&event.path, event.observed_at);
        if let Observation::Stale { latest } = observation {
            debug!(
                target: "lambdawatch::intake",
                path = %event.path.display(),
                observed_at = %event.observed_at,
                %latest,
                "dropping out-of-order event"
            );
            return IngestOutcome::Stale;
        }

        let outcome = self.registry.upsert(
            &classification.key,
            classification.part,
            &event.path,
            event.observed_at,
        );
        trace!(
            target: "lambdawatch::intake",
            dataset = %classification.key,
            part = %classification.part,
            ?outcome,
            "event recorded"
        );
        IngestOutcome::Recorded(outcome)
    }

    /// Promote settled datasets, hand every ready dataset to `intake` oldest
    /// first, then apply the retention policy.
    pub fn sweep(&self, now: DateTime<Utc>, intake: &dyn DispatchIntake) -> SweepReport {
        let mut report = SweepReport::default();

        for key in self.registry.pending_keys() {
            if self.registry.evaluate_readiness(&key, now, self.quiescence) {
                if let Some(progress) = &self.progress {
                    progress.report(ProgressReport::new(key.clone(), DatasetStatus::ReadyToDispatch));
                }
                report.newly_ready.push(key);
            } else {
                report.settling += 1;
            }
        }

        for key in self.registry.ready_keys() {
            // A part rewritten after promotion restarts the window; the
            // dataset stays ready but waits for the next quiet sweep.
            if !self.registry.is_quiet(&key, now, self.quiescence) {
                report.settling += 1;
                continue;
            }
            match intake.submit(&key) {
                SubmitOutcome::Accepted(job_id) => report.submitted.push((key, job_id)),
                SubmitOutcome::Rejected(DispatchRejection::Closed) => {
                    report.rejected.push((key, DispatchRejection::Closed));
                    break;
                }
                SubmitOutcome::Rejected(rejection) => report.rejected.push((key, rejection)),
            }
        }

        if let Some(retention) = self.retention {
            let evicted = self.registry.evict_finished(now, retention);
            report.evicted = evicted.len();
            self.release_paths(&evicted);
        }

        if !report.newly_ready.is_empty() || !report.submitted.is_empty() || report.evicted > 0 {
            debug!(
                target: "lambdawatch::intake",
                ready = report.newly_ready.len(),
                submitted = report.submitted.len(),
                rejected = report.rejected.len(),
                evicted = report.evicted,
                settling = report.settling,
                "sweep finished"
            );
        }
        report
    }

    /// Drop a failed dataset and its tracked paths so the files can be
    /// observed again from scratch.
    pub fn forget_failed(&self, key: &DatasetKey) -> Option<DatasetState> {
        let state = self.registry.forget_failed(key)?;
        self.release_paths(std::slice::from_ref(&state));
        Some(state)
    }

    fn release_paths(&self, states: &[DatasetState]) {
        if states.is_empty() {
            return;
        }
        let mut tracker = self.tracker.lock();
        for part in states.iter().flat_map(|state| state.parts.values()) {
            tracker.forget(&part.path);
        }
    }

    pub fn diagnostics(&self) -> EvaluatorDiagnostics {
        let tracker = self.tracker.lock();
        EvaluatorDiagnostics {
            ignored_paths: self.ignored_paths.load(Ordering::Relaxed),
            stale_dropped: tracker.stale_dropped(),
            deletions_noted: self.deletions_noted.load(Ordering::Relaxed),
            tracked_paths: tracker.len(),
        }
    }
}
