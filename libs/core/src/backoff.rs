//! Per-item backoff/rate-limit core (SPEC_FULL.md §4.6).
//!
//! Grounded on the reference pack's `backon`-based per-object backoff cache
//! (a `HashMap<ObjectRef, ExponentialBackoff>` behind a lock, advanced one
//! step per call): this module keeps the same shape but also remembers the
//! *activity* a schedule was started for, so a state transition (e.g.
//! `Processing` → `DeletionBlocked`) resets the schedule instead of
//! continuing to back off against the wrong condition.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};

use crate::inventory::ObjectKey;

const DEFAULT_MIN_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_FACTOR: f32 = 1.8;

struct Entry {
    activity: String,
    schedule: ExponentialBackoff,
}

/// Per-item exponential backoff with activity-scoped resets.
///
/// `max_delay` is the caller-supplied long-term floor (default 10s per
/// SPEC_FULL.md §4.6).
pub struct Backoff {
    max_delay: Duration,
    entries: Mutex<HashMap<ObjectKey, Entry>>,
}

impl Backoff {
    pub fn new(max_delay: Duration) -> Self {
        Backoff {
            max_delay,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn new_schedule(&self) -> ExponentialBackoff {
        ExponentialBuilder::default()
            .with_min_delay(DEFAULT_MIN_DELAY)
            .with_max_delay(self.max_delay)
            .with_factor(DEFAULT_FACTOR)
            .without_max_times()
            .build()
    }

    /// Returns the next delay for `item`. If `activity` differs from the
    /// activity the item's current schedule was created for, the prior
    /// schedule is forgotten and a fresh one started at its first step.
    pub fn next(&self, item: &ObjectKey, activity: &str) -> Duration {
        let mut entries = self.entries.lock().expect("backoff mutex poisoned");
        let entry = entries.entry(item.clone()).or_insert_with(|| Entry {
            activity: activity.to_string(),
            schedule: self.new_schedule(),
        });
        if entry.activity != activity {
            entry.activity = activity.to_string();
            entry.schedule = self.new_schedule();
        }
        // safe: ExponentialBuilder::without_max_times() never exhausts.
        entry.schedule.next().expect("unbounded backoff schedule yielded None")
    }

    pub fn forget(&self, item: &ObjectKey) {
        self.entries.lock().expect("backoff mutex poisoned").remove(item);
    }
}
