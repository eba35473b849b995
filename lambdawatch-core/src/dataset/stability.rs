use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};

/// Result of feeding one observation to the tracker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Observation {
    /// The observation is the newest seen for this path and was recorded.
    Recorded,
    /// The observation predates what we already hold and was dropped.
    Stale { latest: DateTime<Utc> },
}

/// Per-path latest-modification table.
///
/// Observations are monotonic per path: an earlier timestamp never replaces a
/// later one, which guards against notifications delivered out of order.
/// Stability is a pure function of the table and the caller's `now`, so it can
/// be re-queried on a timer without any new events arriving.
#[derive(Debug, Default)]
pub struct StabilityTracker {
    last_seen: HashMap<PathBuf, DateTime<Utc>>,
    stale_dropped: u64,
}

impl StabilityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, path: &Path, at: DateTime<Utc>) -> Observation {
        match self.last_seen.get_mut(path) {
            Some(latest) if at < *latest => {
                self.stale_dropped += 1;
                Observation::Stale { latest: *latest }
            }
            Some(latest) => {
                *latest = at;
                Observation::Recorded
            }
            None => {
                self.last_seen.insert(path.to_path_buf(), at);
                Observation::Recorded
            }
        }
    }

    /// `true` iff `now - last_observed(path) >= quiescence`. Unknown paths
    /// are never stable.
    pub fn is_stable(&self, path: &Path, now: DateTime<Utc>, quiescence: Duration) -> bool {
        self.last_seen
            .get(path)
            .is_some_and(|latest| now.signed_duration_since(*latest) >= quiescence)
    }

    pub fn last_observed(&self, path: &Path) -> Option<DateTime<Utc>> {
        self.last_seen.get(path).copied()
    }

    pub fn forget(&mut self, path: &Path) -> bool {
        self.last_seen.remove(path).is_some()
    }

    /// Count of out-of-order observations dropped so far.
    pub fn stale_dropped(&self) -> u64 {
        self.stale_dropped
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn t(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn later_observation_overwrites() {
        let mut tracker = StabilityTracker::new();
        let path = Path::new("/d/a_m1.nxs");

        assert_eq!(tracker.observe(path, t(0)), Observation::Recorded);
        assert_eq!(tracker.observe(path, t(500)), Observation::Recorded);
        assert_eq!(tracker.last_observed(path), Some(t(500)));
    }

    #[test]
    fn earlier_observation_is_dropped_and_counted() {
        let mut tracker = StabilityTracker::new();
        let path = Path::new("/d/a_m1.nxs");

        tracker.observe(path, t(1_000));
        assert_eq!(
            tracker.observe(path, t(400)),
            Observation::Stale { latest: t(1_000) }
        );
        assert_eq!(tracker.last_observed(path), Some(t(1_000)));
        assert_eq!(tracker.stale_dropped(), 1);
    }

    #[test]
    fn equal_timestamp_is_not_stale() {
        let mut tracker = StabilityTracker::new();
        let path = Path::new("/d/a_m1.nxs");

        tracker.observe(path, t(10));
        assert_eq!(tracker.observe(path, t(10)), Observation::Recorded);
        assert_eq!(tracker.stale_dropped(), 0);
    }

    #[test]
    fn stability_is_re_queryable_without_new_events() {
        let mut tracker = StabilityTracker::new();
        let path = Path::new("/d/a_m1.nxs");
        let window = Duration::seconds(2);
        tracker.observe(path, t(900));

        assert!(!tracker.is_stable(path, t(2_000), window));
        assert!(!tracker.is_stable(path, t(2_899), window));
        assert!(tracker.is_stable(path, t(2_900), window));
        assert!(tracker.is_stable(path, t(60_000), window));
    }

    #[test]
    fn unknown_and_forgotten_paths_are_not_stable() {
        let mut tracker = StabilityTracker::new();
        let path = Path::new("/d/a_m1.nxs");
        assert!(!tracker.is_stable(path, t(10_000), Duration::zero()));

        tracker.observe(path, t(0));
        assert!(tracker.forget(path));
        assert!(tracker.is_empty());
        assert!(!tracker.is_stable(path, t(10_000), Duration::zero()));
    }
}
