//! Bounded worker pool that turns ready datasets into processor runs.
//!
//! `submit` flips the registry entry to `Dispatched` and enqueues the job in
//! one critical section, so a dataset can only ever be handed to one worker.
//! The intake queue is unbounded; the registry already limits it to at most
//! one entry per dataset, and submitting must never wait on the pool.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dataset::{
    DatasetJob, DatasetKey, DatasetStatus, DispatchRejection, JobId, JobOutcome, SharedRegistry,
};
use crate::error::ProcessingError;

use super::config::DispatchConfig;
use super::progress::{ProgressReport, ProgressSink};

/// The downstream step that consumes a complete dataset.
///
/// The dispatcher never calls `process` twice concurrently for the same key,
/// but distinct keys may be processed in parallel.
#[async_trait]
pub trait DatasetProcessor: Send + Sync {
    async fn process(&self, job: &DatasetJob) -> Result<(), ProcessingError>;

    /// Whether outputs for `key` already exist. Datasets found on a startup
    /// re-scan are not seeded when this returns `true`.
    async fn already_processed(&self, _key: &DatasetKey) -> bool {
        false
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted(JobId),
    Rejected(DispatchRejection),
}

impl SubmitOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted(_))
    }
}

/// Where ready datasets are handed off. `submit` must not block.
pub trait DispatchIntake: Send + Sync {
    fn submit(&self, key: &DatasetKey) -> SubmitOutcome;
}

pub struct Dispatcher {
    registry: SharedRegistry,
    progress: Arc<dyn ProgressSink>,
    intake: SyncMutex<Option<mpsc::UnboundedSender<DatasetJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    gauges: Arc<Gauges>,
    parallelism: usize,
}

#[derive(Debug, Default)]
struct Gauges {
    queued: AtomicUsize,
    active: AtomicUsize,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("parallelism", &self.parallelism)
            .field("queued", &self.queued_jobs())
            .field("active", &self.active_jobs())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Dispatcher {
    /// Spawn `max_concurrent_jobs` workers on the current runtime.
    pub fn spawn(
        config: &DispatchConfig,
        registry: SharedRegistry,
        processor: Arc<dyn DatasetProcessor>,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        let parallelism = config.max_concurrent_jobs.max(1);
        let (tx, rx) = mpsc::unbounded_channel::<DatasetJob>();
        let queue = Arc::new(Mutex::new(rx));
        let gauges = Arc::new(Gauges::default());

        let handles = (0..parallelism)
            .map(|worker| {
                spawn_worker(
                    worker,
                    Arc::clone(&queue),
                    registry.clone(),
                    Arc::clone(&processor),
                    Arc::clone(&progress),
                    Arc::clone(&gauges),
                )
            })
            .collect();

        info!(
            target: "lambdawatch::dispatch",
            workers = parallelism,
            "dispatcher started"
        );

        Self {
            registry,
            progress,
            intake: SyncMutex::new(Some(tx)),
            workers: Mutex::new(handles),
            gauges,
            parallelism,
        }
    }

    /// Jobs accepted but not yet picked up by a worker.
    pub fn queued_jobs(&self) -> usize {
        self.gauges.queued.load(Ordering::Acquire)
    }

    /// Jobs currently inside `DatasetProcessor::process`.
    pub fn active_jobs(&self) -> usize {
        self.gauges.active.load(Ordering::Acquire)
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    pub fn is_closed(&self) -> bool {
        self.intake.lock().is_none()
    }

    /// Stop accepting jobs and let the workers drain everything already
    /// dispatched. Returns `true` if every worker finished within `grace`;
    /// jobs still running after that keep running detached.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let closed = self.intake.lock().take();
        drop(closed);

        let handles = {
            let mut guard = self.workers.lock().await;
            std::mem::take(&mut *guard)
        };
        if handles.is_empty() {
            return true;
        }

        info!(
            target: "lambdawatch::dispatch",
            queued = self.queued_jobs(),
            active = self.active_jobs(),
            "draining dispatcher"
        );

        let deadline = tokio::time::Instant::now() + grace;
        let mut drained = true;
        for handle in handles {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(target: "lambdawatch::dispatch", "worker task failed: {err}"),
                Err(_) => {
                    warn!(target: "lambdawatch::dispatch", "worker did not drain within the grace period");
                    drained = false;
                }
            }
        }
        drained
    }
}

impl DispatchIntake for Dispatcher {
    fn submit(&self, key: &DatasetKey) -> SubmitOutcome {
        let guard = self.intake.lock();
        let Some(tx) = guard.as_ref() else {
            return SubmitOutcome::Rejected(DispatchRejection::Closed);
        };

        let job = match self.registry.mark_dispatched(key, Utc::now()) {
            Ok(job) => job,
            Err(rejection) => {
                debug!(
                    target: "lambdawatch::dispatch",
                    dataset = %key,
                    %rejection,
                    "submission rejected"
                );
                return SubmitOutcome::Rejected(rejection);
            }
        };

        let job_id = job.id;
        self.progress
            .report(ProgressReport::new(key.clone(), DatasetStatus::Dispatched).with_job(job_id));
        self.gauges.queued.fetch_add(1, Ordering::AcqRel);
        if let Err(mpsc::error::SendError(job)) = tx.send(job) {
            // Every worker is gone; the dataset is already sealed, so it has to
            // be finished here rather than left Dispatched forever.
            self.gauges.queued.fetch_sub(1, Ordering::AcqRel);
            let error = ProcessingError::Abandoned.to_string();
            self.registry
                .mark_outcome(&job.key, &JobOutcome::Failed(error.clone()), Utc::now());
            self.progress.report(
                ProgressReport::new(job.key, DatasetStatus::Failed)
                    .with_job(job_id)
                    .with_error(error),
            );
            return SubmitOutcome::Rejected(DispatchRejection::Closed);
        }

        debug!(
            target: "lambdawatch::dispatch",
            dataset = %key,
            job = %job_id,
            "dataset dispatched"
        );
        SubmitOutcome::Accepted(job_id)
    }
}

impl<T: DispatchIntake + ?Sized> DispatchIntake for Arc<T> {
    fn submit(&self, key: &DatasetKey) -> SubmitOutcome {
        (**self).submit(key)
    }
}

fn spawn_worker(
    worker: usize,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<DatasetJob>>>,
    registry: SharedRegistry,
    processor: Arc<dyn DatasetProcessor>,
    progress: Arc<dyn ProgressSink>,
    gauges: Arc<Gauges>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let next = {
                let mut rx = queue.lock().await;
                rx.recv().await
            };
            let Some(job) = next else {
                debug!(target: "lambdawatch::dispatch", worker, "worker shutting down");
                break;
            };

            gauges.queued.fetch_sub(1, Ordering::AcqRel);
            gauges.active.fetch_add(1, Ordering::AcqRel);
            debug!(
                target: "lambdawatch::dispatch",
                worker,
                dataset = %job.key,
                job = %job.id,
                parts = job.parts.len(),
                "processing dataset"
            );

            let result = run_isolated(Arc::clone(&processor), job.clone()).await;
            gauges.active.fetch_sub(1, Ordering::AcqRel);

            let now = Utc::now();
            match result {
                Ok(()) => {
                    registry.mark_outcome(&job.key, &JobOutcome::Succeeded, now);
                    progress.report(
                        ProgressReport::new(job.key, DatasetStatus::Completed).with_job(job.id),
                    );
                }
                Err(err) => {
                    let error = err.to_string();
                    warn!(
                        target: "lambdawatch::dispatch",
                        dataset = %job.key,
                        job = %job.id,
                        error = %error,
                        "dataset processing failed"
                    );
                    registry.mark_outcome(&job.key, &JobOutcome::Failed(error.clone()), now);
                    progress.report(
                        ProgressReport::new(job.key, DatasetStatus::Failed)
                            .with_job(job.id)
                            .with_error(error),
                    );
                }
            }
        }
    })
}

/// Run the processor on its own task so a panic fails one dataset instead of
/// taking the worker down with it.
async fn run_isolated(
    processor: Arc<dyn DatasetProcessor>,
    job: DatasetJob,
) -> Result<(), ProcessingError> {
    let handle = tokio::spawn(async move { processor.process(&job).await });
    match handle.await {
        Ok(result) => result,
        Err(err) if err.is_panic() => Err(ProcessingError::Panicked(panic_message(
            err.into_panic(),
        ))),
        Err(err) => Err(ProcessingError::failed(err.to_string())),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
