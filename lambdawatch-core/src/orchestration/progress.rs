use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::dataset::{DatasetKey, DatasetStatus, JobId};

/// One lifecycle notification for a dataset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProgressReport {
    pub key: DatasetKey,
    pub status: DatasetStatus,
    pub job_id: Option<JobId>,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl ProgressReport {
    pub fn new(key: DatasetKey, status: DatasetStatus) -> Self {
        Self {
            key,
            status,
            job_id: None,
            error: None,
            at: Utc::now(),
        }
    }

    pub fn with_job(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Fire-and-forget receiver of dataset progress. Implementations must return
/// promptly; they are called from the dispatcher's workers and the sweep.
pub trait ProgressSink: Send + Sync {
    fn report(&self, report: ProgressReport);
}

/// Writes every report to the `lambdawatch::progress` tracing target.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn report(&self, report: ProgressReport) {
        match &report.error {
            Some(error) => warn!(
                target: "lambdawatch::progress",
                dataset = %report.key,
                status = %report.status,
                job = ?report.job_id,
                error = %error,
                "dataset failed"
            ),
            None => info!(
                target: "lambdawatch::progress",
                dataset = %report.key,
                status = %report.status,
                job = ?report.job_id,
                "dataset {}", report.status
            ),
        }
    }
}

/// Forwards reports over an unbounded channel; a dropped receiver is ignored.
#[derive(Clone)]
pub struct ChannelProgressSink {
    tx: mpsc::UnboundedSender<ProgressReport>,
}

impl ChannelProgressSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl fmt::Debug for ChannelProgressSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelProgressSink")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl ProgressSink for ChannelProgressSink {
    fn report(&self, report: ProgressReport) {
        let _ = self.tx.send(report);
    }
}

pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {
    fn report(&self, _report: ProgressReport) {}
}

impl fmt::Debug for NoopProgressSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NoopProgressSink")
    }
}
