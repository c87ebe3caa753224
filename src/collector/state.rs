//! Incremental collection state
//!
//! Decides whether a run may fetch only changed data, supplies the `since`
//! cursor for query builders, and commits the watermark once the run has
//! succeeded.
//!
//! Precedence between the caller's floor (`time_after`) and the stored
//! watermark:
//!
//! | situation                                        | mode        | since                  |
//! |--------------------------------------------------|-------------|------------------------|
//! | `full_sync` requested                            | full        | floor                  |
//! | no watermark recorded                            | full        | floor                  |
//! | floor removed, or moved earlier than recorded    | full        | new floor              |
//! | otherwise                                        | incremental | max(watermark, floor)  |
//!
//! A run that started but never committed leaves an in-progress marker; the
//! next run resumes it with the same mode and `since` instead of deciding
//! afresh, so pages already in the ledger stay consistent.

use crate::store::{CollectorState, StateStore};
use crate::Result;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Caller-supplied sync options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncPolicy {
    /// Ignore the watermark and collect everything
    pub full_sync: bool,
    /// Floor: only data updated after this matters
    pub time_after: Option<DateTime<Utc>>,
}

impl SyncPolicy {
    pub fn full() -> Self {
        Self {
            full_sync: true,
            time_after: None,
        }
    }

    pub fn with_time_after(mut self, floor: DateTime<Utc>) -> Self {
        self.time_after = Some(floor);
        self
    }
}

/// Outcome of the precedence rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunMode {
    pub incremental: bool,
    pub since: Option<DateTime<Utc>>,
}

/// Apply the precedence rule to the stored state
pub fn decide(stored: Option<&CollectorState>, policy: &SyncPolicy) -> RunMode {
    let full = RunMode {
        incremental: false,
        since: policy.time_after,
    };
    if policy.full_sync {
        return full;
    }
    let Some(state) = stored else {
        return full;
    };
    let Some(watermark) = state.since_cursor else {
        return full;
    };

    match (state.time_after, policy.time_after) {
        (Some(_), None) => full,
        (Some(recorded), Some(floor)) if floor < recorded => full,
        (_, floor) => RunMode {
            incremental: true,
            since: Some(floor.map_or(watermark, |f| f.max(watermark))),
        },
    }
}

/// Identifies one tracked resource
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateKey {
    pub connection_id: u64,
    pub scope: String,
    pub table: String,
}

impl StateKey {
    pub fn new(connection_id: u64, scope: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            connection_id,
            scope: scope.into(),
            table: table.into(),
        }
    }
}

/// Tracker for one collection run
pub struct StateTracker {
    store: Arc<dyn StateStore>,
    state: CollectorState,
    policy: SyncPolicy,
    mode: RunMode,
    resumed: bool,
    started_at: DateTime<Utc>,
    observed: Mutex<Option<DateTime<Utc>>>,
}

impl StateTracker {
    /// Load state, decide the run mode and record the in-progress marker
    pub fn begin(
        store: Arc<dyn StateStore>,
        key: &StateKey,
        policy: SyncPolicy,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let stored = store.load_collector_state(key.connection_id, &key.scope, &key.table)?;

        let (mode, resumed) = match &stored {
            Some(state) if state.is_interrupted() && !policy.full_sync => (
                RunMode {
                    incremental: state.run_incremental,
                    since: state.run_since,
                },
                true,
            ),
            other => (decide(other.as_ref(), &policy), false),
        };

        let mut state = stored
            .unwrap_or_else(|| CollectorState::new(key.connection_id, &key.scope, &key.table));
        let started_at = if resumed {
            state.run_started_at.unwrap_or(now)
        } else {
            now
        };
        state.run_started_at = Some(started_at);
        state.run_since = mode.since;
        state.run_incremental = mode.incremental;
        store.save_collector_state(&state)?;

        info!(
            connection = key.connection_id,
            scope = %key.scope,
            table = %key.table,
            incremental = mode.incremental,
            resumed,
            since = ?mode.since,
            "Collection run started"
        );

        Ok(Self {
            store,
            state,
            policy,
            mode,
            resumed,
            started_at,
            observed: Mutex::new(None),
        })
    }

    /// True only when a previous successful run left a usable watermark
    pub fn can_incremental_collect(&self) -> bool {
        self.mode.incremental
    }

    /// Cursor for "updated since" filters; `None` means collect everything
    pub fn since(&self) -> Option<DateTime<Utc>> {
        self.mode.since
    }

    /// This run continues one that never committed
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    /// Record an `updated_at` seen on a persisted unit
    pub fn observe(&self, updated_at: DateTime<Utc>) {
        if let Ok(mut observed) = self.observed.lock() {
            match *observed {
                Some(current) if current >= updated_at => {}
                _ => *observed = Some(updated_at),
            }
        }
    }

    /// Highest `updated_at` observed so far
    pub fn observed(&self) -> Option<DateTime<Utc>> {
        self.observed.lock().ok().and_then(|o| *o)
    }

    /// Advance the watermark and clear the in-progress marker
    ///
    /// Only call after every page of the run has been committed.
    pub fn commit(&self) -> Result<CollectorState> {
        let mut state = self.state.clone();
        let observed = self.observed.lock().ok().and_then(|o| *o);

        state.since_cursor = match (state.since_cursor, observed) {
            (Some(prev), Some(seen)) => Some(prev.max(seen)),
            (prev, seen) => prev.or(seen),
        };
        state.latest_success_start = Some(self.started_at);
        state.time_after = self.policy.time_after;
        state.run_started_at = None;
        state.run_since = None;
        state.run_incremental = false;

        self.store.save_collector_state(&state)?;

        debug!(
            connection = state.connection_id,
            scope = %state.scope,
            table = %state.table,
            watermark = ?state.since_cursor,
            "Watermark committed"
        );
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use chrono::TimeZone;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, day, 0, 0, 0).unwrap()
    }

    fn state(watermark: Option<u32>, floor: Option<u32>) -> CollectorState {
        let mut s = CollectorState::new(5, "scope", "table");
        s.since_cursor = watermark.map(ts);
        s.time_after = floor.map(ts);
        s
    }

    fn policy(full: bool, floor: Option<u32>) -> SyncPolicy {
        SyncPolicy {
            full_sync: full,
            time_after: floor.map(ts),
        }
    }

    #[test]
    fn test_precedence_table() {
        // (stored, policy, incremental, since)
        let cases: Vec<(Option<CollectorState>, SyncPolicy, bool, Option<u32>)> = vec![
            (None, policy(false, None), false, None),
            (None, policy(false, Some(3)), false, Some(3)),
            (Some(state(None, None)), policy(false, None), false, None),
            (Some(state(Some(10), None)), policy(false, None), true, Some(10)),
            (Some(state(Some(10), None)), policy(true, None), false, None),
            (Some(state(Some(10), None)), policy(true, Some(2)), false, Some(2)),
            // floor introduced later than the watermark wins
            (Some(state(Some(10), None)), policy(false, Some(12)), true, Some(12)),
            // floor introduced earlier than the watermark: watermark wins
            (Some(state(Some(10), None)), policy(false, Some(4)), true, Some(10)),
            // unchanged floor
            (Some(state(Some(10), Some(4))), policy(false, Some(4)), true, Some(10)),
            // floor moved later
            (Some(state(Some(10), Some(4))), policy(false, Some(6)), true, Some(10)),
            // floor moved earlier: full from the new floor
            (Some(state(Some(10), Some(4))), policy(false, Some(2)), false, Some(2)),
            // floor removed: full, no filter
            (Some(state(Some(10), Some(4))), policy(false, None), false, None),
        ];

        for (i, (stored, policy, incremental, since)) in cases.into_iter().enumerate() {
            let mode = decide(stored.as_ref(), &policy);
            assert_eq!(mode.incremental, incremental, "case {}", i);
            assert_eq!(mode.since, since.map(ts), "case {}", i);
        }
    }

    #[test]
    fn test_first_run_full_then_incremental() {
        let store: Arc<dyn StateStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let key = StateKey::new(5, "scope", "issues");

        let tracker = StateTracker::begin(store.clone(), &key, SyncPolicy::default(), ts(20)).unwrap();
        assert!(!tracker.can_incremental_collect());
        assert_eq!(tracker.since(), None);
        tracker.observe(ts(3));
        tracker.observe(ts(9));
        tracker.observe(ts(7));
        let committed = tracker.commit().unwrap();
        assert_eq!(committed.since_cursor, Some(ts(9)));
        assert_eq!(committed.latest_success_start, Some(ts(20)));
        assert!(!committed.is_interrupted());

        let tracker = StateTracker::begin(store, &key, SyncPolicy::default(), ts(21)).unwrap();
        assert!(tracker.can_incremental_collect());
        assert_eq!(tracker.since(), Some(ts(9)));
    }

    #[test]
    fn test_watermark_never_regresses() {
        let store: Arc<dyn StateStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let key = StateKey::new(5, "scope", "issues");
        store.save_collector_state(&{
            let mut s = CollectorState::new(5, "scope", "issues");
            s.since_cursor = Some(ts(10));
            s
        })
        .unwrap();

        let tracker = StateTracker::begin(store.clone(), &key, SyncPolicy::default(), ts(20)).unwrap();
        assert!(tracker.can_incremental_collect());
        tracker.observe(ts(8));
        assert_eq!(tracker.commit().unwrap().since_cursor, Some(ts(10)));

        let tracker = StateTracker::begin(store, &key, SyncPolicy::default(), ts(21)).unwrap();
        let committed = tracker.commit().unwrap();
        assert_eq!(committed.since_cursor, Some(ts(10)));
    }

    #[test]
    fn test_failed_run_leaves_watermark_and_resumes() {
        let store: Arc<dyn StateStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let key = StateKey::new(5, "scope", "issues");
        let mut seeded = CollectorState::new(5, "scope", "issues");
        seeded.since_cursor = Some(ts(10));
        store.save_collector_state(&seeded).unwrap();

        let tracker = StateTracker::begin(store.clone(), &key, SyncPolicy::default(), ts(20)).unwrap();
        tracker.observe(ts(15));
        drop(tracker); // crashed before commit

        let stored = store.load_collector_state(5, "scope", "issues").unwrap().unwrap();
        assert_eq!(stored.since_cursor, Some(ts(10)));
        assert!(stored.is_interrupted());

        let resumed = StateTracker::begin(store.clone(), &key, SyncPolicy::default(), ts(22)).unwrap();
        assert!(resumed.is_resumed());
        assert!(resumed.can_incremental_collect());
        assert_eq!(resumed.since(), Some(ts(10)));
        let committed = resumed.commit().unwrap();
        assert_eq!(committed.latest_success_start, Some(ts(20)));
    }

    #[test]
    fn test_full_sync_overrides_interrupted_run() {
        let store: Arc<dyn StateStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let key = StateKey::new(5, "scope", "issues");
        let tracker = StateTracker::begin(store.clone(), &key, SyncPolicy::default(), ts(1)).unwrap();
        drop(tracker);

        let tracker = StateTracker::begin(store, &key, SyncPolicy::full(), ts(2)).unwrap();
        assert!(!tracker.is_resumed());
        assert!(!tracker.can_incremental_collect());
    }
}
