//! One explicitly owned watch/dispatch session.
//!
//! A session wires an event channel into a [`CompletionEvaluator`], runs the
//! readiness sweep on a fixed cadence, and feeds a [`Dispatcher`]. Its
//! registry is created empty (or handed in from a previous session) and is
//! handed back by [`WatchSession::stop`]; nothing is global.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::{JoinHandle, spawn_blocking};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dataset::{
    DatasetKey, ModuleSuffixClassifier, PathClassifier, RegistrySnapshot,
    SharedRegistry,
};
use crate::error::{Result, WatchError};
use crate::fs_watch::{FsWatchService, WatchEvent, WatchEventKind, WatchMessage, rescan};

use super::config::SessionConfig;
use super::dispatcher::{DatasetProcessor, Dispatcher};
use super::evaluator::{CompletionEvaluator, EvaluatorDiagnostics};
use super::progress::{ProgressSink, TracingProgressSink};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum SessionPhase {
    Running,
    Stopping,
    Stopped,
    /// The event source failed. Intake and sweeps have stopped; the registry
    /// is still available for inspection.
    Failed { reason: String },
}

impl SessionPhase {
    pub fn is_running(&self) -> bool {
        matches!(self, SessionPhase::Running)
    }

    /// Stopped or failed; no more events will be accepted.
    pub fn has_exited(&self) -> bool {
        matches!(self, SessionPhase::Stopped | SessionPhase::Failed { .. })
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionPhase::Running => write!(f, "running"),
            SessionPhase::Stopping => write!(f, "stopping"),
            SessionPhase::Stopped => write!(f, "stopped"),
            SessionPhase::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionStats {
    pub phase: SessionPhase,
    pub registry: RegistrySnapshot,
    pub intake: EvaluatorDiagnostics,
    pub queued_jobs: usize,
    pub active_jobs: usize,
}

/// Seeding summary for files that were already on disk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub events: usize,
    pub skipped_processed: usize,
}

pub struct WatchSessionBuilder {
    config: SessionConfig,
    registry: Option<SharedRegistry>,
    processor: Option<Arc<dyn DatasetProcessor>>,
    progress: Option<Arc<dyn ProgressSink>>,
    classifier: Option<Arc<dyn PathClassifier>>,
}

impl fmt::Debug for WatchSessionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchSessionBuilder")
            .field("config", &self.config)
            .field("resuming", &self.registry.is_some())
            .field("has_processor", &self.processor.is_some())
            .field("has_progress", &self.progress.is_some())
            .field("has_classifier", &self.classifier.is_some())
            .finish()
    }
}

impl WatchSessionBuilder {
    /// Resume from the registry of a previous session.
    pub fn with_registry(mut self, registry: SharedRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_processor(mut self, processor: Arc<dyn DatasetProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn PathClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Start a session fed by `events`. Must be called inside a tokio
    /// runtime.
    pub fn start(self, events: mpsc::Receiver<WatchMessage>) -> Result<WatchSession> {
        let parts = self.into_parts()?;
        Ok(WatchSession::launch(parts, events, None))
    }

    /// Watch `dir` with notify, seed the registry from the files already
    /// there (unless disabled), then start the session.
    pub async fn watch_directory(self, dir: &Path) -> Result<WatchSession> {
        let parts = self.into_parts()?;
        if !dir.is_dir() {
            return Err(WatchError::MissingDirectory(dir.to_path_buf()));
        }

        let watch_cfg = parts.config.watch;
        let (tx, rx) = mpsc::channel(watch_cfg.channel_capacity);
        // Watch before scanning so nothing written during the scan is missed.
        let watcher = FsWatchService::start(dir, watch_cfg.recursive, tx).await?;

        if watch_cfg.rescan_on_start {
            let root = dir.to_path_buf();
            let classifier = Arc::clone(&parts.classifier);
            let report = spawn_blocking(move || {
                rescan(&root, watch_cfg.recursive, classifier.as_ref())
            })
            .await
            .map_err(|err| WatchError::Internal(format!("re-scan task failed: {err}")))??;

            let seeded = seed(&parts.evaluator, parts.processor.as_ref(), report.events).await;
            info!(
                root = %dir.display(),
                events = seeded.events,
                skipped_processed = seeded.skipped_processed,
                "registry seeded from existing files"
            );
        }

        Ok(WatchSession::launch(parts, rx, Some(watcher)))
    }

    fn into_parts(self) -> Result<SessionParts> {
        self.config.validate()?;

        let processor = self.processor.ok_or_else(|| {
            WatchError::Internal("WatchSession processor dependency missing".into())
        })?;
        let classifier: Arc<dyn PathClassifier> = match self.classifier {
            Some(classifier) => classifier,
            None => Arc::new(ModuleSuffixClassifier::new(self.config.naming.clone())?),
        };
        let required = classifier.required_parts();
        let registry = self
            .registry
            .unwrap_or_else(|| SharedRegistry::new(required));
        if registry.required_parts() != required {
            return Err(WatchError::InvalidConfig(format!(
                "registry expects {} parts per dataset but the classifier yields {}",
                registry.required_parts(),
                required
            )));
        }
        let progress: Arc<dyn ProgressSink> = match self.progress {
            Some(progress) => progress,
            None => Arc::new(TracingProgressSink),
        };

        let evaluator = Arc::new(
            CompletionEvaluator::new(Arc::clone(&classifier), registry, &self.config.completion)
                .with_progress(Arc::clone(&progress)),
        );

        Ok(SessionParts {
            config: self.config,
            classifier,
            evaluator,
            processor,
            progress,
        })
    }
}

struct SessionParts {
    config: SessionConfig,
    classifier: Arc<dyn PathClassifier>,
    evaluator: Arc<CompletionEvaluator>,
    processor: Arc<dyn DatasetProcessor>,
    progress: Arc<dyn ProgressSink>,
}

/// Feed synthetic events for files already on disk, skipping datasets whose
/// outputs already exist.
async fn seed(
    evaluator: &CompletionEvaluator,
    processor: &dyn DatasetProcessor,
    events: Vec<WatchEvent>,
) -> SeedReport {
    let mut report = SeedReport::default();
    let mut processed: HashMap<DatasetKey, bool> = HashMap::new();

    for event in events {
        let Some(classification) = evaluator.classify(&event.path) else {
            continue;
        };
        let skip = match processed.get(&classification.key) {
            Some(skip) => *skip,
            None => {
                let skip = processor.already_processed(&classification.key).await;
                if skip {
                    debug!(dataset = %classification.key, "outputs exist; not seeding");
                }
                processed.insert(classification.key, skip);
                skip
            }
        };
        if skip {
            report.skipped_processed += 1;
            continue;
        }
        evaluator.ingest(&event);
        report.events += 1;
    }
    report
}

pub struct WatchSession {
    config: SessionConfig,
    evaluator: Arc<CompletionEvaluator>,
    dispatcher: Arc<Dispatcher>,
    phase_tx: Arc<watch::Sender<SessionPhase>>,
    phase_rx: watch::Receiver<SessionPhase>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    watcher: parking_lot::Mutex<Option<FsWatchService>>,
}

impl fmt::Debug for WatchSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchSession")
            .field("phase", &*self.phase_rx.borrow())
            .field("evaluator", &self.evaluator)
            .field("dispatcher", &self.dispatcher)
            .field("watcher", &*self.watcher.lock())
            .finish()
    }
}

impl WatchSession {
    pub fn builder(config: SessionConfig) -> WatchSessionBuilder {
        WatchSessionBuilder {
            config,
            registry: None,
            processor: None,
            progress: None,
            classifier: None,
        }
    }

    fn launch(
        parts: SessionParts,
        events: mpsc::Receiver<WatchMessage>,
        watcher: Option<FsWatchService>,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::spawn(
            &parts.config.dispatch,
            parts.evaluator.registry().clone(),
            parts.processor,
            parts.progress,
        ));
        let (phase_tx, phase_rx) = watch::channel(SessionPhase::Running);
        let phase_tx = Arc::new(phase_tx);
        let shutdown = CancellationToken::new();

        let intake = spawn_intake(
            events,
            Arc::clone(&parts.evaluator),
            Arc::clone(&phase_tx),
            shutdown.clone(),
        );
        let sweeper = spawn_sweeper(
            parts.config.completion.evaluation_interval(),
            Arc::clone(&parts.evaluator),
            Arc::clone(&dispatcher),
            shutdown.clone(),
        );

        info!(
            required_parts = parts.evaluator.registry().required_parts(),
            quiescence_ms = parts.config.completion.quiescence_window_ms,
            workers = dispatcher.parallelism(),
            resumed_datasets = parts.evaluator.registry().len(),
            "watch session started"
        );

        Self {
            config: parts.config,
            evaluator: parts.evaluator,
            dispatcher,
            phase_tx,
            phase_rx,
            shutdown,
            tasks: Mutex::new(vec![intake, sweeper]),
            watcher: parking_lot::Mutex::new(watcher),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionPhase> {
        self.phase_rx.clone()
    }

    /// Resolves once the session has stopped or failed.
    pub async fn wait_for_exit(&self) -> SessionPhase {
        let mut rx = self.phase_rx.clone();
        let exited = match rx.wait_for(SessionPhase::has_exited).await {
            Ok(phase) => phase.clone(),
            Err(_) => self.phase(),
        };
        exited
    }

    pub fn registry(&self) -> &SharedRegistry {
        self.evaluator.registry()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            phase: self.phase(),
            registry: self.registry().snapshot(),
            intake: self.evaluator.diagnostics(),
            queued_jobs: self.dispatcher.queued_jobs(),
            active_jobs: self.dispatcher.active_jobs(),
        }
    }

    /// Operator action: forget a failed dataset and observe its part files
    /// again. Returns `false` if `key` was not `Failed`.
    pub async fn requeue(&self, key: &DatasetKey) -> Result<bool> {
        let phase = self.phase();
        if !phase.is_running() {
            return Err(WatchError::SessionInactive(phase.to_string()));
        }

        let Some(state) = self.evaluator.forget_failed(key) else {
            return Ok(false);
        };

        info!(dataset = %key, "requeueing failed dataset");
        for part in state.parts.values() {
            match tokio::fs::metadata(&part.path).await.and_then(|m| m.modified()) {
                Ok(modified) => {
                    let event = WatchEvent::new(
                        part.path.clone(),
                        WatchEventKind::Created,
                        DateTime::<Utc>::from(modified),
                    );
                    self.evaluator.ingest(&event);
                }
                Err(err) => warn!(
                    dataset = %key,
                    path = %part.path.display(),
                    "part not readable during requeue: {err}"
                ),
            }
        }
        Ok(true)
    }

    /// Stop intake and the sweep, let in-flight jobs finish (up to `grace`),
    /// and hand back the registry. Pending and ready datasets stay in it.
    pub async fn stop(self, grace: Duration) -> SharedRegistry {
        self.phase_tx.send_if_modified(|phase| {
            if phase.is_running() {
                *phase = SessionPhase::Stopping;
                true
            } else {
                false
            }
        });

        self.shutdown.cancel();
        drop(self.watcher.lock().take());

        let tasks = {
            let mut guard = self.tasks.lock().await;
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            if let Err(err) = task.await {
                warn!("session task failed: {err}");
            }
        }

        if !self.dispatcher.shutdown(grace).await {
            warn!(
                active = self.dispatcher.active_jobs(),
                "stopped before every in-flight job finished"
            );
        }

        self.phase_tx.send_if_modified(|phase| {
            if matches!(phase, SessionPhase::Stopping) {
                *phase = SessionPhase::Stopped;
                true
            } else {
                false
            }
        });
        info!(phase = %self.phase(), datasets = self.registry().len(), "watch session stopped");
        self.registry().clone()
    }

    /// Stop using the configured grace period.
    pub async fn stop_default(self) -> SharedRegistry {
        let grace = self.config.dispatch.shutdown_grace();
        self.stop(grace).await
    }
}

impl Drop for WatchSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn spawn_intake(
    mut events: mpsc::Receiver<WatchMessage>,
    evaluator: Arc<CompletionEvaluator>,
    phase: Arc<watch::Sender<SessionPhase>>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let failure = loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break None,
                msg = events.recv() => match msg {
                    Some(WatchMessage::Event(event)) => {
                        evaluator.ingest(&event);
                    }
                    Some(WatchMessage::Failed(reason)) => break Some(reason),
                    None => break Some("event stream closed".to_string()),
                },
            }
        };

        if let Some(reason) = failure {
            let failed = phase.send_if_modified(|current| {
                if current.is_running() {
                    *current = SessionPhase::Failed {
                        reason: reason.clone(),
                    };
                    true
                } else {
                    false
                }
            });
            if failed {
                warn!(reason = %reason, "event source failed; session halted");
            }
            shutdown.cancel();
        }
    })
}

fn spawn_sweeper(
    interval: Duration,
    evaluator: Arc<CompletionEvaluator>,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    evaluator.sweep(Utc::now(), dispatcher.as_ref());
                }
            }
        }
    })
}
