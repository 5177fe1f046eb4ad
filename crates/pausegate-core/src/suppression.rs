//! Don't-re-decide-before-T suppression windows.
//!
//! Two independent timestamp maps with identical semantics:
//! quit-suppression is engine-internal (set after a post-choice quit to
//! debounce flicker re-entry), wake-suppression is externally driven (the
//! host signals "don't re-decide before T" for reasons the engine does not
//! need to know). Entries are lazily pruned: one with `suppress_until <= now`
//! is equivalent to no entry at all.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::AppId;

/// Which suppression map to touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionKind {
    Quit,
    Wake,
}

/// The two `app_id -> suppress_until` maps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuppressionWindows {
    quit: HashMap<AppId, DateTime<Utc>>,
    wake: HashMap<AppId, DateTime<Utc>>,
}

impl SuppressionWindows {
    pub fn new() -> Self {
        Self::default()
    }

    fn map_mut(&mut self, kind: SuppressionKind) -> &mut HashMap<AppId, DateTime<Utc>> {
        match kind {
            SuppressionKind::Quit => &mut self.quit,
            SuppressionKind::Wake => &mut self.wake,
        }
    }

    fn map(&self, kind: SuppressionKind) -> &HashMap<AppId, DateTime<Utc>> {
        match kind {
            SuppressionKind::Quit => &self.quit,
            SuppressionKind::Wake => &self.wake,
        }
    }

    /// Overwrite the suppression deadline for an app.
    pub fn set(&mut self, kind: SuppressionKind, app_id: &str, until: DateTime<Utc>) {
        self.map_mut(kind).insert(app_id.to_string(), until);
    }

    /// Read-and-prune check. An expired entry is removed and reported as
    /// not-suppressed.
    pub fn is_suppressed(&mut self, kind: SuppressionKind, app_id: &str, now: DateTime<Utc>) -> bool {
        let map = self.map_mut(kind);
        match map.get(app_id) {
            Some(until) if now < *until => true,
            Some(_) => {
                map.remove(app_id);
                false
            }
            None => false,
        }
    }

    /// Remaining milliseconds without pruning. `None` means no entry; a
    /// value `<= 0` is an expired entry the caller must treat as absent.
    pub fn remaining_ms(
        &self,
        kind: SuppressionKind,
        app_id: &str,
        now: DateTime<Utc>,
    ) -> Option<i64> {
        self.map(kind)
            .get(app_id)
            .map(|until| (*until - now).num_milliseconds())
    }

    pub fn clear(&mut self, kind: SuppressionKind, app_id: &str) {
        self.map_mut(kind).remove(app_id);
    }

    /// Drop every expired entry in both maps.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        self.quit.retain(|_, until| now < *until);
        self.wake.retain(|_, until| now < *until);
    }
}
