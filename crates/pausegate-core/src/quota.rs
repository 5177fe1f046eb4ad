//! Rolling-window quick-task quota.
//!
//! The quota is global: a fixed number of quick-task grants per rolling
//! window. Refill and decrement both run inside the single-writer context,
//! so they are atomic with respect to each other.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Persistable quota state. Invariant: `0 <= remaining <= max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaState {
    pub max: u32,
    pub window_start_at: DateTime<Utc>,
    pub remaining: u32,
}

/// Tracks the rolling-window quota.
#[derive(Debug, Clone)]
pub struct QuotaLedger {
    state: QuotaState,
    window: Duration,
}

impl QuotaLedger {
    /// Fresh ledger with a full quota and a window starting at `now`.
    pub fn new(max: u32, window: Duration, now: DateTime<Utc>) -> Self {
        Self {
            state: QuotaState {
                max,
                window_start_at: now,
                remaining: max,
            },
            window,
        }
    }

    /// Rebuild from persisted state. `remaining` is clamped into bounds in
    /// case the stored copy predates a max change.
    pub fn from_state(mut state: QuotaState, window: Duration) -> Self {
        state.remaining = state.remaining.min(state.max);
        Self { state, window }
    }

    pub fn snapshot(&self) -> QuotaState {
        self.state
    }

    pub fn remaining(&self) -> u32 {
        self.state.remaining
    }

    pub fn is_exhausted(&self) -> bool {
        self.state.remaining == 0
    }

    /// Change the window size without touching the current window start.
    pub fn set_window(&mut self, window: Duration) {
        self.window = window;
    }

    /// Change the cap. Remaining is clamped; a raise takes effect at the
    /// next refill.
    pub fn set_max(&mut self, max: u32) {
        self.state.max = max;
        self.state.remaining = self.state.remaining.min(max);
    }

    /// Roll the window forward if it has elapsed. Returns true when a refill
    /// happened.
    pub fn check_refill(&mut self, now: DateTime<Utc>) -> bool {
        if now - self.state.window_start_at >= self.window {
            self.state.remaining = self.state.max;
            self.state.window_start_at = now;
            true
        } else {
            false
        }
    }

    /// Spend one grant. No-op at zero; returns whether anything was spent.
    pub fn decrement(&mut self) -> bool {
        if self.state.remaining == 0 {
            return false;
        }
        self.state.remaining -= 1;
        true
    }
}
