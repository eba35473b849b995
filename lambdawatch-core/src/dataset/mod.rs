//! Dataset identity and lifecycle state.
//!
//! A dataset is the unit of work: `K` part files that share a [`DatasetKey`].
//! The naming rule that derives keys lives in [`classifier`], per-path
//! quiescence tracking in [`stability`], and the authoritative lifecycle table
//! in [`registry`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod classifier;
pub mod registry;
pub mod stability;

pub use classifier::{Classification, ModuleSuffixClassifier, NamingConvention, PathClassifier};
pub use registry::{
    DatasetRegistry, DatasetSummary, DispatchRejection, JobOutcome, RegistrySnapshot,
    SharedRegistry, StatusCounts, UpsertOutcome,
};
pub use stability::{Observation, StabilityTracker};

/// Logical identity of a dataset, derived from one of its part paths.
///
/// Two parts belong to the same dataset iff they live in the same directory
/// and share both stem and (optional) segment.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DatasetKey {
    directory: PathBuf,
    stem: String,
    segment: Option<String>,
}

impl DatasetKey {
    pub fn new(
        directory: impl Into<PathBuf>,
        stem: impl Into<String>,
        segment: Option<String>,
    ) -> Self {
        Self {
            directory: directory.into(),
            stem: stem.into(),
            segment,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn stem(&self) -> &str {
        &self.stem
    }

    pub fn segment(&self) -> Option<&str> {
        self.segment.as_deref()
    }

    /// Basename downstream outputs are written under; drops the segment.
    pub fn output_stem(&self) -> &str {
        &self.stem
    }

    /// `<stem>` or `<stem>_part<segment>`.
    pub fn name(&self) -> String {
        match &self.segment {
            Some(segment) => format!("{}_part{}", self.stem, segment),
            None => self.stem.clone(),
        }
    }
}

impl fmt::Display for DatasetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.directory.join(self.name()).display())
    }
}

/// 1-based index of one of the `K` required parts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartIndex(u8);

impl PartIndex {
    /// Returns `None` unless `1 <= index <= required`.
    pub fn new(index: u32, required: u8) -> Option<Self> {
        let index = u8::try_from(index).ok()?;
        (1..=required).contains(&index).then_some(Self(index))
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for PartIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a dataset. Edges only move forward:
/// `Pending -> ReadyToDispatch -> Dispatched -> {Completed, Failed}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatasetStatus {
    Pending,
    ReadyToDispatch,
    Dispatched,
    Completed,
    Failed,
}

impl DatasetStatus {
    pub fn can_transition_to(self, next: DatasetStatus) -> bool {
        matches!(
            (self, next),
            (DatasetStatus::Pending, DatasetStatus::ReadyToDispatch)
                | (DatasetStatus::ReadyToDispatch, DatasetStatus::Dispatched)
                | (DatasetStatus::Dispatched, DatasetStatus::Completed)
                | (DatasetStatus::Dispatched, DatasetStatus::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DatasetStatus::Completed | DatasetStatus::Failed)
    }

    /// Only finished datasets may be dropped by the retention policy.
    pub fn is_evictable(self) -> bool {
        self.is_terminal()
    }

    /// Statuses for which new part events are no longer recorded.
    pub fn is_sealed(self) -> bool {
        matches!(
            self,
            DatasetStatus::Dispatched | DatasetStatus::Completed | DatasetStatus::Failed
        )
    }
}

impl fmt::Display for DatasetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatasetStatus::Pending => write!(f, "pending"),
            DatasetStatus::ReadyToDispatch => write!(f, "ready"),
            DatasetStatus::Dispatched => write!(f, "dispatched"),
            DatasetStatus::Completed => write!(f, "completed"),
            DatasetStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartRecord {
    pub path: PathBuf,
    pub last_event_at: DateTime<Utc>,
}

/// Registry-owned state for one dataset.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatasetState {
    pub key: DatasetKey,
    pub parts: BTreeMap<PartIndex, PartRecord>,
    pub status: DatasetStatus,
    pub created_at: DateTime<Utc>,
    pub ready_at: Option<DateTime<Utc>>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl DatasetState {
    pub fn new(key: DatasetKey, created_at: DateTime<Utc>) -> Self {
        Self {
            key,
            parts: BTreeMap::new(),
            status: DatasetStatus::Pending,
            created_at,
            ready_at: None,
            dispatched_at: None,
            finished_at: None,
            last_error: None,
        }
    }

    pub fn parts_seen(&self) -> usize {
        self.parts.len()
    }

    pub fn has_all_parts(&self, required: u8) -> bool {
        (1..=required).all(|idx| self.parts.contains_key(&PartIndex(idx)))
    }

    /// Newest per-part event; the quiescence clock for the whole dataset
    /// runs from here.
    pub fn last_event_at(&self) -> Option<DateTime<Utc>> {
        self.parts.values().map(|part| part.last_event_at).max()
    }

    pub fn part_paths(&self) -> Vec<(PartIndex, PathBuf)> {
        self.parts
            .iter()
            .map(|(idx, record)| (*idx, record.path.clone()))
            .collect()
    }
}

/// Unique identifier for a dispatched job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handoff from the registry to a worker: a dataset that has just been
/// marked `Dispatched`, with its part paths sorted by index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatasetJob {
    pub id: JobId,
    pub key: DatasetKey,
    pub parts: Vec<(PartIndex, PathBuf)>,
}

impl DatasetJob {
    pub fn part_paths(&self) -> impl Iterator<Item = &Path> {
        self.parts.iter().map(|(_, path)| path.as_path())
    }
}
