//! Authoritative in-memory table of dataset lifecycles.
//!
//! [`DatasetRegistry`] is a plain single-threaded state machine; every
//! operation takes the caller's `now` so the completion rules are
//! deterministic under test. [`SharedRegistry`] is the handle the session,
//! evaluator and dispatcher share: one write lock serializes every mutation,
//! and snapshots are taken under a single read lock.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, trace};

use super::{DatasetJob, DatasetKey, DatasetState, DatasetStatus, JobId, PartIndex, PartRecord};

/// What an `upsert` did to the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First part of a previously unknown dataset.
    Created,
    /// A part index not seen before for an existing dataset.
    PartAdded { seen: usize },
    /// A known part was rewritten; the quiescence clock restarts.
    Rearmed,
    /// The event carried no newer information for a known part.
    Unchanged,
    /// The dataset is already dispatched or finished; nothing was recorded.
    Sealed(DatasetStatus),
}

/// Result reported by a worker for a dispatched dataset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed(String),
}

/// Why a dispatch request was turned away. Rejections are no-ops, not errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchRejection {
    Unknown,
    NotReady(DatasetStatus),
    Closed,
}

impl fmt::Display for DispatchRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchRejection::Unknown => write!(f, "unknown dataset"),
            DispatchRejection::NotReady(status) => write!(f, "dataset is {status}"),
            DispatchRejection::Closed => write!(f, "dispatcher closed"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub ready: usize,
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StatusCounts {
    fn bump(&mut self, status: DatasetStatus) {
        match status {
            DatasetStatus::Pending => self.pending += 1,
            DatasetStatus::ReadyToDispatch => self.ready += 1,
            DatasetStatus::Dispatched => self.dispatched += 1,
            DatasetStatus::Completed => self.completed += 1,
            DatasetStatus::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.ready + self.dispatched + self.completed + self.failed
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DatasetSummary {
    pub key: DatasetKey,
    pub status: DatasetStatus,
    pub parts_seen: usize,
    pub required_parts: u8,
    pub last_event_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Consistent point-in-time view of the registry.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RegistrySnapshot {
    pub counts: StatusCounts,
    pub datasets: Vec<DatasetSummary>,
}

pub struct DatasetRegistry {
    required_parts: u8,
    datasets: HashMap<DatasetKey, DatasetState>,
}

impl fmt::Debug for DatasetRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasetRegistry")
            .field("required_parts", &self.required_parts)
            .field("dataset_count", &self.datasets.len())
            .finish()
    }
}

impl DatasetRegistry {
    pub fn new(required_parts: u8) -> Self {
        Self {
            required_parts: required_parts.max(1),
            datasets: HashMap::new(),
        }
    }

    pub fn required_parts(&self) -> u8 {
        self.required_parts
    }

    /// Record that `part` of `key` was observed at `at`.
    ///
    /// Re-adding a known part with a newer timestamp re-arms the stability
    /// window for the whole dataset. Dispatched and finished datasets are
    /// sealed: duplicates never change their status.
    pub fn upsert(
        &mut self,
        key: &DatasetKey,
        part: PartIndex,
        path: &Path,
        at: DateTime<Utc>,
    ) -> UpsertOutcome {
        let Some(state) = self.datasets.get_mut(key) else {
            let mut state = DatasetState::new(key.clone(), at);
            state.parts.insert(
                part,
                PartRecord {
                    path: path.to_path_buf(),
                    last_event_at: at,
                },
            );
            self.datasets.insert(key.clone(), state);
            debug!(dataset = %key, part = %part, "tracking new dataset");
            return UpsertOutcome::Created;
        };

        if state.status.is_sealed() {
            trace!(dataset = %key, part = %part, status = %state.status, "ignoring event for sealed dataset");
            return UpsertOutcome::Sealed(state.status);
        }

        match state.parts.get_mut(&part) {
            None => {
                state.parts.insert(
                    part,
                    PartRecord {
                        path: path.to_path_buf(),
                        last_event_at: at,
                    },
                );
                UpsertOutcome::PartAdded {
                    seen: state.parts.len(),
                }
            }
            Some(record) if at > record.last_event_at => {
                record.last_event_at = at;
                record.path = path.to_path_buf();
                UpsertOutcome::Rearmed
            }
            Some(_) => UpsertOutcome::Unchanged,
        }
    }

    /// Promote `key` to `ReadyToDispatch` when every required part has been
    /// seen and every part has been quiet for at least `quiescence` as of
    /// `now`. Returns whether the dataset is ready after the call.
    pub fn evaluate_readiness(
        &mut self,
        key: &DatasetKey,
        now: DateTime<Utc>,
        quiescence: Duration,
    ) -> bool {
        let required = self.required_parts;
        let Some(state) = self.datasets.get_mut(key) else {
            return false;
        };

        match state.status {
            DatasetStatus::ReadyToDispatch => true,
            DatasetStatus::Pending => {
                if !state.has_all_parts(required) {
                    return false;
                }
                if is_quiet(state, now, quiescence) && transition(state, DatasetStatus::ReadyToDispatch, now) {
                    debug!(dataset = %key, "dataset complete and stable");
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    /// Whether every part of `key` has been quiet for `quiescence` as of
    /// `now`. A ready dataset whose part was rewritten stays ready but is not
    /// quiet until the window has passed again.
    pub fn is_quiet(&self, key: &DatasetKey, now: DateTime<Utc>, quiescence: Duration) -> bool {
        self.datasets
            .get(key)
            .is_some_and(|state| is_quiet(state, now, quiescence))
    }

    /// `ReadyToDispatch -> Dispatched`. Only the first caller wins; every
    /// later request for the same key is rejected.
    pub fn mark_dispatched(
        &mut self,
        key: &DatasetKey,
        now: DateTime<Utc>,
    ) -> Result<DatasetJob, DispatchRejection> {
        let state = self
            .datasets
            .get_mut(key)
            .ok_or(DispatchRejection::Unknown)?;

        if !transition(state, DatasetStatus::Dispatched, now) {
            return Err(DispatchRejection::NotReady(state.status));
        }

        Ok(DatasetJob {
            id: JobId::new(),
            key: key.clone(),
            parts: state.part_paths(),
        })
    }

    /// `Dispatched -> Completed | Failed`. Returns `false` if the dataset was
    /// not in `Dispatched`.
    pub fn mark_outcome(
        &mut self,
        key: &DatasetKey,
        outcome: &JobOutcome,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(state) = self.datasets.get_mut(key) else {
            return false;
        };

        match outcome {
            JobOutcome::Succeeded => transition(state, DatasetStatus::Completed, now),
            JobOutcome::Failed(error) => {
                let applied = transition(state, DatasetStatus::Failed, now);
                if applied {
                    state.last_error = Some(error.clone());
                }
                applied
            }
        }
    }

    pub fn status(&self, key: &DatasetKey) -> Option<DatasetStatus> {
        self.datasets.get(key).map(|state| state.status)
    }

    pub fn get(&self, key: &DatasetKey) -> Option<&DatasetState> {
        self.datasets.get(key)
    }

    pub fn pending_keys(&self) -> Vec<DatasetKey> {
        self.keys_with(DatasetStatus::Pending)
    }

    /// Ready datasets, oldest readiness first.
    pub fn ready_keys(&self) -> Vec<DatasetKey> {
        let mut ready: Vec<_> = self
            .datasets
            .values()
            .filter(|state| state.status == DatasetStatus::ReadyToDispatch)
            .map(|state| (state.ready_at, state.key.clone()))
            .collect();
        ready.sort();
        ready.into_iter().map(|(_, key)| key).collect()
    }

    fn keys_with(&self, status: DatasetStatus) -> Vec<DatasetKey> {
        let mut keys: Vec<_> = self
            .datasets
            .values()
            .filter(|state| state.status == status)
            .map(|state| state.key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Drop finished datasets that finished more than `retention` ago.
    pub fn evict_finished(&mut self, now: DateTime<Utc>, retention: Duration) -> Vec<DatasetState> {
        let expired: Vec<DatasetKey> = self
            .datasets
            .values()
            .filter(|state| state.status.is_evictable())
            .filter(|state| {
                state
                    .finished_at
                    .is_some_and(|at| now.signed_duration_since(at) >= retention)
            })
            .map(|state| state.key.clone())
            .collect();

        expired
            .iter()
            .filter_map(|key| self.datasets.remove(key))
            .collect()
    }

    /// Operator action: drop a `Failed` dataset so it can be observed afresh.
    pub fn forget_failed(&mut self, key: &DatasetKey) -> Option<DatasetState> {
        match self.datasets.get(key) {
            Some(state) if state.status == DatasetStatus::Failed => self.datasets.remove(key),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut counts = StatusCounts::default();
        let mut datasets: Vec<DatasetSummary> = self
            .datasets
            .values()
            .map(|state| {
                counts.bump(state.status);
                DatasetSummary {
                    key: state.key.clone(),
                    status: state.status,
                    parts_seen: state.parts_seen(),
                    required_parts: self.required_parts,
                    last_event_at: state.last_event_at(),
                    last_error: state.last_error.clone(),
                }
            })
            .collect();
        datasets.sort_by(|a, b| a.key.cmp(&b.key));
        RegistrySnapshot { counts, datasets }
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }
}

fn is_quiet(state: &DatasetState, now: DateTime<Utc>, quiescence: Duration) -> bool {
    state
        .parts
        .values()
        .all(|part| now.signed_duration_since(part.last_event_at) >= quiescence)
}

fn transition(state: &mut DatasetState, next: DatasetStatus, now: DateTime<Utc>) -> bool {
    if !state.status.can_transition_to(next) {
        return false;
    }
    state.status = next;
    match next {
        DatasetStatus::ReadyToDispatch => state.ready_at = Some(now),
        DatasetStatus::Dispatched => state.dispatched_at = Some(now),
        DatasetStatus::Completed | DatasetStatus::Failed => state.finished_at = Some(now),
        DatasetStatus::Pending => {}
    }
    true
}

/// Cloneable handle over one [`DatasetRegistry`].
///
/// All mutation goes through the methods below, each of which holds the
/// write lock for its whole duration. None of them perform I/O.
#[derive(Clone)]
pub struct SharedRegistry {
    inner: Arc<RwLock<DatasetRegistry>>,
}

impl fmt::Debug for SharedRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_read() {
            Some(guard) => f
                .debug_struct("SharedRegistry")
                .field("required_parts", &guard.required_parts)
                .field("dataset_count", &guard.len())
                .finish(),
            None => f
                .debug_struct("SharedRegistry")
                .field("registry", &"<locked>")
                .finish(),
        }
    }
}

impl SharedRegistry {
    pub fn new(required_parts: u8) -> Self {
        Self {
            inner: Arc::new(RwLock::new(DatasetRegistry::new(required_parts))),
        }
    }

    pub fn required_parts(&self) -> u8 {
        self.inner.read().required_parts()
    }

    pub fn upsert(
        &self,
        key: &DatasetKey,
        part: PartIndex,
        path: &Path,
        at: DateTime<Utc>,
    ) -> UpsertOutcome {
        self.inner.write().upsert(key, part, path, at)
    }

    pub fn evaluate_readiness(
        &self,
        key: &DatasetKey,
        now: DateTime<Utc>,
        quiescence: Duration,
    ) -> bool {
        self.inner.write().evaluate_readiness(key, now, quiescence)
    }

    pub fn is_quiet(&self, key: &DatasetKey, now: DateTime<Utc>, quiescence: Duration) -> bool {
        self.inner.read().is_quiet(key, now, quiescence)
    }

    pub fn mark_dispatched(
        &self,
        key: &DatasetKey,
        now: DateTime<Utc>,
    ) -> Result<DatasetJob, DispatchRejection> {
        self.inner.write().mark_dispatched(key, now)
    }

    pub fn mark_outcome(&self, key: &DatasetKey, outcome: &JobOutcome, now: DateTime<Utc>) -> bool {
        self.inner.write().mark_outcome(key, outcome, now)
    }

    pub fn status(&self, key: &DatasetKey) -> Option<DatasetStatus> {
        self.inner.read().status(key)
    }

    pub fn get(&self, key: &DatasetKey) -> Option<DatasetState> {
        self.inner.read().get(key).cloned()
    }

    pub fn pending_keys(&self) -> Vec<DatasetKey> {
        self.inner.read().pending_keys()
    }

    pub fn ready_keys(&self) -> Vec<DatasetKey> {
        self.inner.read().ready_keys()
    }

    pub fn evict_finished(&self, now: DateTime<Utc>, retention: Duration) -> Vec<DatasetState> {
        self.inner.write().evict_finished(now, retention)
    }

    pub fn forget_failed(&self, key: &DatasetKey) -> Option<DatasetState> {
        self.inner.write().forget_failed(key)
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        self.inner.read().snapshot()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::TimeZone;

    use super::*;

    const K: u8 = 3;

    fn t(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms)
            .single()
            .expect("valid timestamp")
    }

    fn key(stem: &str) -> DatasetKey {
        DatasetKey::new("/data", stem, None)
    }

    fn part(idx: u32) -> PartIndex {
        PartIndex::new(idx, K).expect("valid part")
    }

    fn path(stem: &str, idx: u32) -> PathBuf {
        PathBuf::from(format!("/data/{stem}_m{idx}.nxs"))
    }

    fn seed_complete(registry: &mut DatasetRegistry, stem: &str, at: DateTime<Utc>) {
        for idx in 1..=3 {
            registry.upsert(&key(stem), part(idx), &path(stem, idx), at);
        }
    }

    #[test]
    fn upsert_creates_then_adds_parts() {
        let mut registry = DatasetRegistry::new(K);
        let k = key("a");

        assert_eq!(
            registry.upsert(&k, part(1), &path("a", 1), t(0)),
            UpsertOutcome::Created
        );
        assert_eq!(
            registry.upsert(&k, part(2), &path("a", 2), t(10)),
            UpsertOutcome::PartAdded { seen: 2 }
        );
        assert_eq!(registry.status(&k), Some(DatasetStatus::Pending));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicate_part_rearms_only_when_newer() {
        let mut registry = DatasetRegistry::new(K);
        let k = key("a");
        registry.upsert(&k, part(1), &path("a", 1), t(100));

        assert_eq!(
            registry.upsert(&k, part(1), &path("a", 1), t(50)),
            UpsertOutcome::Unchanged
        );
        assert_eq!(
            registry.upsert(&k, part(1), &path("a", 1), t(200)),
            UpsertOutcome::Rearmed
        );
        let state = registry.get(&k).expect("tracked");
        assert_eq!(state.parts_seen(), 1);
        assert_eq!(state.last_event_at(), Some(t(200)));
    }

    #[test]
    fn incomplete_dataset_never_becomes_ready() {
        let mut registry = DatasetRegistry::new(K);
        let k = key("a");
        registry.upsert(&k, part(1), &path("a", 1), t(0));
        registry.upsert(&k, part(3), &path("a", 3), t(0));

        assert!(!registry.evaluate_readiness(&k, t(3_600_000), Duration::seconds(2)));
        assert_eq!(registry.status(&k), Some(DatasetStatus::Pending));
    }

    #[test]
    fn readiness_waits_for_latest_part() {
        let mut registry = DatasetRegistry::new(K);
        let k = key("a");
        let window = Duration::seconds(2);
        registry.upsert(&k, part(1), &path("a", 1), t(0));
        registry.upsert(&k, part(2), &path("a", 2), t(500));
        registry.upsert(&k, part(3), &path("a", 3), t(900));

        assert!(!registry.evaluate_readiness(&k, t(2_000), window));
        assert_eq!(registry.status(&k), Some(DatasetStatus::Pending));
        assert!(registry.evaluate_readiness(&k, t(2_900), window));
        assert_eq!(registry.status(&k), Some(DatasetStatus::ReadyToDispatch));
    }

    #[test]
    fn rewrite_restarts_the_window() {
        let mut registry = DatasetRegistry::new(K);
        let k = key("a");
        let window = Duration::seconds(2);
        registry.upsert(&k, part(1), &path("a", 1), t(0));
        registry.upsert(&k, part(2), &path("a", 2), t(500));
        registry.upsert(&k, part(3), &path("a", 3), t(900));
        registry.upsert(&k, part(2), &path("a", 2), t(1_500));

        assert!(!registry.evaluate_readiness(&k, t(2_900), window));
        assert!(!registry.evaluate_readiness(&k, t(3_499), window));
        assert!(registry.evaluate_readiness(&k, t(3_500), window));
    }

    #[test]
    fn dispatch_happens_exactly_once() {
        let mut registry = DatasetRegistry::new(K);
        let k = key("a");
        seed_complete(&mut registry, "a", t(0));
        assert!(registry.evaluate_readiness(&k, t(5_000), Duration::seconds(2)));

        let job = registry.mark_dispatched(&k, t(5_000)).expect("first dispatch");
        assert_eq!(job.key, k);
        assert_eq!(
            job.parts.iter().map(|(idx, _)| idx.get()).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(
            registry.mark_dispatched(&k, t(5_001)),
            Err(DispatchRejection::NotReady(DatasetStatus::Dispatched))
        );
        assert_eq!(
            registry.mark_dispatched(&key("missing"), t(5_001)),
            Err(DispatchRejection::Unknown)
        );
    }

    #[test]
    fn pending_dataset_cannot_be_dispatched() {
        let mut registry = DatasetRegistry::new(K);
        let k = key("a");
        seed_complete(&mut registry, "a", t(0));
        assert_eq!(
            registry.mark_dispatched(&k, t(1)),
            Err(DispatchRejection::NotReady(DatasetStatus::Pending))
        );
    }

    #[test]
    fn sealed_datasets_ignore_redelivered_events() {
        let mut registry = DatasetRegistry::new(K);
        let k = key("a");
        seed_complete(&mut registry, "a", t(0));
        registry.evaluate_readiness(&k, t(5_000), Duration::seconds(2));
        registry.mark_dispatched(&k, t(5_000)).expect("dispatch");

        assert_eq!(
            registry.upsert(&k, part(1), &path("a", 1), t(6_000)),
            UpsertOutcome::Sealed(DatasetStatus::Dispatched)
        );
        assert!(registry.mark_outcome(&k, &JobOutcome::Succeeded, t(7_000)));
        assert_eq!(
            registry.upsert(&k, part(2), &path("a", 2), t(8_000)),
            UpsertOutcome::Sealed(DatasetStatus::Completed)
        );
        assert!(!registry.evaluate_readiness(&k, t(60_000), Duration::seconds(2)));
        assert!(registry.mark_dispatched(&k, t(60_000)).is_err());
        assert_eq!(registry.status(&k), Some(DatasetStatus::Completed));
    }

    #[test]
    fn failure_is_terminal_and_records_error() {
        let mut registry = DatasetRegistry::new(K);
        let k = key("a");
        seed_complete(&mut registry, "a", t(0));
        registry.evaluate_readiness(&k, t(5_000), Duration::seconds(2));
        registry.mark_dispatched(&k, t(5_000)).expect("dispatch");

        assert!(registry.mark_outcome(&k, &JobOutcome::Failed("boom".into()), t(6_000)));
        assert!(!registry.mark_outcome(&k, &JobOutcome::Succeeded, t(6_001)));
        let state = registry.get(&k).expect("tracked");
        assert_eq!(state.status, DatasetStatus::Failed);
        assert_eq!(state.last_error.as_deref(), Some("boom"));
        assert!(!registry.evaluate_readiness(&k, t(60_000), Duration::zero()));
    }

    #[test]
    fn outcome_requires_dispatch() {
        let mut registry = DatasetRegistry::new(K);
        let k = key("a");
        seed_complete(&mut registry, "a", t(0));
        assert!(!registry.mark_outcome(&k, &JobOutcome::Succeeded, t(1)));
        assert_eq!(registry.status(&k), Some(DatasetStatus::Pending));
    }

    #[test]
    fn ready_dataset_keeps_status_on_rewrite() {
        let mut registry = DatasetRegistry::new(K);
        let k = key("a");
        seed_complete(&mut registry, "a", t(0));
        registry.evaluate_readiness(&k, t(5_000), Duration::seconds(2));

        assert_eq!(
            registry.upsert(&k, part(1), &path("a", 1), t(5_500)),
            UpsertOutcome::Rearmed
        );
        assert_eq!(registry.status(&k), Some(DatasetStatus::ReadyToDispatch));
        assert!(!registry.is_quiet(&k, t(6_000), Duration::seconds(2)));
        assert!(registry.is_quiet(&k, t(7_500), Duration::seconds(2)));
    }

    #[test]
    fn ready_keys_are_fifo() {
        let mut registry = DatasetRegistry::new(K);
        let window = Duration::seconds(1);
        seed_complete(&mut registry, "late", t(0));
        seed_complete(&mut registry, "early", t(0));
        registry.evaluate_readiness(&key("early"), t(2_000), window);
        registry.evaluate_readiness(&key("late"), t(3_000), window);

        assert_eq!(registry.ready_keys(), vec![key("early"), key("late")]);
        assert!(registry.pending_keys().is_empty());
    }

    #[test]
    fn eviction_only_touches_finished_datasets() {
        let mut registry = DatasetRegistry::new(K);
        let window = Duration::seconds(1);
        seed_complete(&mut registry, "done", t(0));
        seed_complete(&mut registry, "inflight", t(0));
        seed_complete(&mut registry, "ready", t(0));
        registry.upsert(&key("pending"), part(1), &path("pending", 1), t(0));

        for stem in ["done", "inflight", "ready"] {
            registry.evaluate_readiness(&key(stem), t(2_000), window);
        }
        registry.mark_dispatched(&key("done"), t(2_000)).expect("dispatch");
        registry.mark_dispatched(&key("inflight"), t(2_000)).expect("dispatch");
        registry.mark_outcome(&key("done"), &JobOutcome::Succeeded, t(3_000));

        let retention = Duration::seconds(10);
        assert!(registry.evict_finished(t(12_999), retention).is_empty());
        let evicted = registry.evict_finished(t(13_000), retention);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].key, key("done"));
        assert!(registry.evict_finished(t(1_000_000), retention).is_empty());
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn forget_failed_ignores_other_statuses() {
        let mut registry = DatasetRegistry::new(K);
        let k = key("a");
        seed_complete(&mut registry, "a", t(0));
        assert!(registry.forget_failed(&k).is_none());

        registry.evaluate_readiness(&k, t(5_000), Duration::seconds(2));
        registry.mark_dispatched(&k, t(5_000)).expect("dispatch");
        registry.mark_outcome(&k, &JobOutcome::Failed("bad".into()), t(6_000));

        let forgotten = registry.forget_failed(&k).expect("failed dataset");
        assert_eq!(forgotten.parts_seen(), 3);
        assert!(registry.is_empty());
        assert_eq!(
            registry.upsert(&k, part(1), &path("a", 1), t(7_000)),
            UpsertOutcome::Created
        );
    }

    #[test]
    fn snapshot_counts_by_status() {
        let mut registry = DatasetRegistry::new(K);
        seed_complete(&mut registry, "a", t(0));
        registry.upsert(&key("b"), part(2), &path("b", 2), t(0));
        registry.evaluate_readiness(&key("a"), t(5_000), Duration::seconds(1));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.counts.ready, 1);
        assert_eq!(snapshot.counts.pending, 1);
        assert_eq!(snapshot.counts.total(), 2);
        assert_eq!(snapshot.datasets[0].key, key("a"));
        assert_eq!(snapshot.datasets[1].parts_seen, 1);
    }

    #[test]
    fn shared_registry_serializes_racing_dispatches() {
        let registry = SharedRegistry::new(K);
        let k = key("a");
        for idx in 1..=3 {
            registry.upsert(&k, part(idx), &path("a", idx), t(0));
        }
        assert!(registry.evaluate_readiness(&k, t(5_000), Duration::seconds(1)));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let k = k.clone();
                std::thread::spawn(move || registry.mark_dispatched(&k, t(5_000)).is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|handle| handle.join().expect("thread"))
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(registry.status(&k), Some(DatasetStatus::Dispatched));
    }
}
