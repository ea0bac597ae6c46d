//! Per-action timing instrumentation.
//!
//! When timing is enabled for a context, every action invocation records
//! when it started, when it settled, how long it took and whether it
//! failed. Entries are kept in a bounded [`TimingLog`]; the oldest entries
//! are evicted first.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::id::RootId;

/// Default number of timing entries retained per context.
pub const DEFAULT_TIMING_CAPACITY: usize = 1000;

/// Timing record for one action invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ActionTiming {
    /// Display name of the action.
    pub display_name: String,
    /// Call stack from the transaction root to this action.
    pub stack: Vec<String>,
    /// Transaction the invocation belongs to.
    pub root_id: Option<RootId>,
    /// Wall-clock start.
    pub started_at: DateTime<Utc>,
    /// Wall-clock end.
    pub ended_at: DateTime<Utc>,
    /// Monotonic duration of the action body.
    pub duration: Duration,
    /// Whether the action failed.
    pub failed: bool,
}

/// Start marker for an in-flight invocation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TimingStart {
    started_at: DateTime<Utc>,
    instant: Instant,
}

impl TimingStart {
    pub(crate) fn now() -> Self {
        Self {
            started_at: Utc::now(),
            instant: Instant::now(),
        }
    }

    pub(crate) fn finish(
        self,
        display_name: &str,
        stack: Vec<String>,
        root_id: Option<RootId>,
        failed: bool,
    ) -> ActionTiming {
        ActionTiming {
            display_name: display_name.to_string(),
            stack,
            root_id,
            started_at: self.started_at,
            ended_at: Utc::now(),
            duration: self.instant.elapsed(),
            failed,
        }
    }
}

/// Bounded log of action timings.
#[derive(Debug)]
pub struct TimingLog {
    entries: Mutex<VecDeque<ActionTiming>>,
    capacity: usize,
}

impl Default for TimingLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_TIMING_CAPACITY)
    }
}

impl TimingLog {
    /// Create a log retaining at most `capacity` entries (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
        }
    }

    // Timing is diagnostics only, so a poisoned lock is recovered rather than propagated.
    fn lock_entries(&self) -> MutexGuard<'_, VecDeque<ActionTiming>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record an entry, evicting the oldest one when full.
    pub fn record(&self, timing: ActionTiming) {
        let mut entries = self.lock_entries();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(timing);
    }

    /// All retained entries, oldest first.
    pub fn entries(&self) -> Vec<ActionTiming> {
        self.lock_entries().iter().cloned().collect()
    }

    /// Entries belonging to one transaction.
    pub fn for_root(&self, root_id: RootId) -> Vec<ActionTiming> {
        self.lock_entries()
            .iter()
            .filter(|t| t.root_id == Some(root_id))
            .cloned()
            .collect()
    }

    /// Entries for failed invocations.
    pub fn failed(&self) -> Vec<ActionTiming> {
        self.lock_entries()
            .iter()
            .filter(|t| t.failed)
            .cloned()
            .collect()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.lock_entries().clear();
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    /// Returns true if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing(name: &str, root: u64, failed: bool) -> ActionTiming {
        TimingStart::now().finish(
            name,
            vec![name.to_string()],
            Some(serde_json::from_value(serde_json::json!(root)).unwrap()),
            failed,
        )
    }

    #[test]
    fn test_evicts_oldest() {
        let log = TimingLog::with_capacity(2);
        log.record(timing("a", 1, false));
        log.record(timing("b", 1, false));
        log.record(timing("c", 1, false));

        let names: Vec<_> = log.entries().into_iter().map(|t| t.display_name).collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[test]
    fn test_filters() {
        let log = TimingLog::default();
        log.record(timing("a", 1, false));
        log.record(timing("b", 2, true));
        log.record(timing("c", 1, true));

        let root: RootId = serde_json::from_value(serde_json::json!(1)).unwrap();
        assert_eq!(log.for_root(root).len(), 2);
        assert_eq!(log.failed().len(), 2);

        log.clear();
        assert!(log.is_empty());
    }

    #[test]
    fn test_finish_orders_timestamps() {
        let t = timing("a", 1, false);
        assert!(t.ended_at >= t.started_at);
        assert!(!t.failed);
    }
}
