//! Cancellable deadline scheduling.
//!
//! The engine has no internal threads. Every delayed action -- quick-task
//! expiry, watchdogs, settle replays, deferred retries -- is a [`TimerKey`]
//! in one deadline map. The driving layer asks for [`next_deadline`],
//! sleeps, then drains [`take_due`] inside the single-writer context.
//!
//! Cancellation is removal from the map. A fire that races a cancellation
//! (the driver woke up, then the entry was cancelled before the drain)
//! simply finds nothing due; a fire that arrives through an external
//! channel is additionally guarded by the service's state re-check. Each
//! schedule bumps a generation counter so logs can tell a stale fire from a
//! current one.
//!
//! [`next_deadline`]: TimerSupervisor::next_deadline
//! [`take_due`]: TimerSupervisor::take_due

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::events::AppId;

/// Identity of a scheduled callback.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// A running quick task reaches its expiry.
    QuickTaskExpiry { app_id: AppId },
    /// The surface never signalled "mounted" in time.
    BootWatchdog { session_id: Uuid },
    /// The surface never confirmed teardown after a close request.
    FinishVerify { session_id: Uuid },
    /// Re-check a suspected stale-session foreground mismatch.
    MismatchCheck,
    /// Replay entry evaluation after a mismatch-forced close settled.
    SettleReplay { app_id: AppId },
    /// Retry a decision that found the presentation layer not ready.
    DeferredEntry { app_id: AppId },
}

#[derive(Debug, Clone, Copy)]
struct PendingTimer {
    fires_at: DateTime<Utc>,
    generation: u64,
}

/// The deadline map.
#[derive(Debug, Default)]
pub struct TimerSupervisor {
    pending: HashMap<TimerKey, PendingTimer>,
    next_generation: u64,
}

impl TimerSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule (or reschedule) a timer. Returns its generation.
    pub fn schedule(&mut self, key: TimerKey, fires_at: DateTime<Utc>) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.pending.insert(
            key,
            PendingTimer {
                fires_at,
                generation,
            },
        );
        generation
    }

    /// Remove a pending timer. Returns whether one existed.
    pub fn cancel(&mut self, key: &TimerKey) -> bool {
        self.pending.remove(key).is_some()
    }

    pub fn is_pending(&self, key: &TimerKey) -> bool {
        self.pending.contains_key(key)
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.pending.values().map(|t| t.fires_at).min()
    }

    /// Remove and return everything due at `now`, earliest first.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Vec<(TimerKey, u64)> {
        let mut due: Vec<(TimerKey, DateTime<Utc>, u64)> = self
            .pending
            .iter()
            .filter(|(_, t)| t.fires_at <= now)
            .map(|(k, t)| (k.clone(), t.fires_at, t.generation))
            .collect();
        due.sort_by_key(|(_, fires_at, generation)| (*fires_at, *generation));
        for (key, _, _) in &due {
            self.pending.remove(key);
        }
        due.into_iter()
            .map(|(key, _, generation)| (key, generation))
            .collect()
    }

    /// Drop everything. Restore re-arms from the durable store.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
