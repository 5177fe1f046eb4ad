//! Per-app session state machine.
//!
//! Each monitored application has exactly one [`AppEntry`] holding its
//! authoritative state. Entries are created lazily on first entry event and
//! never deleted, only reset to `Idle`.
//!
//! ## State Transitions
//!
//! ```text
//! Idle -> Decision -> (Active | Idle)
//! Active -> (PostChoice | Idle)
//! PostChoice -> Idle
//! any -> InterventionActive -> Idle
//! ```
//!
//! `PostChoice` is a hard lock: while an app is in this state no new
//! admission decision may start for it until the user resolves the screen.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::AppId;

/// Authoritative per-app state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    /// No session in progress.
    Idle,
    /// An admission decision is on screen (offer shown, no choice yet).
    Decision,
    /// A quick task is running; `expires_at` is set.
    Active,
    /// The quick task expired in the foreground; continue-or-quit is on
    /// screen. Hard lock against new decisions.
    PostChoice,
    /// The full reflective flow is (or was) running for this app.
    InterventionActive,
}

impl AppState {
    /// Stable string form used for persistence.
    pub fn as_str(self) -> &'static str {
        match self {
            AppState::Idle => "idle",
            AppState::Decision => "decision",
            AppState::Active => "active",
            AppState::PostChoice => "post_choice",
            AppState::InterventionActive => "intervention_active",
        }
    }

    /// Parse the persisted string form.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(AppState::Idle),
            "decision" => Some(AppState::Decision),
            "active" => Some(AppState::Active),
            "post_choice" => Some(AppState::PostChoice),
            "intervention_active" => Some(AppState::InterventionActive),
            _ => None,
        }
    }

    /// Only these states survive a restart.
    pub fn is_durable(self) -> bool {
        matches!(self, AppState::Active | AppState::InterventionActive)
    }
}

/// One monitored application's session record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppEntry {
    pub app_id: AppId,
    pub state: AppState,
    /// When the current quick task ends. Only meaningful in `Active`.
    pub expires_at: Option<DateTime<Utc>>,
    /// The post-choice screen has been requested for this session.
    pub post_choice_shown: bool,
    /// Last time a resume command was emitted for this app.
    pub last_recovery_launch_at: Option<DateTime<Utc>>,
    /// Do not emit another resume command before this instant.
    pub suppress_recovery_until: Option<DateTime<Utc>>,
}

impl AppEntry {
    fn new(app_id: AppId) -> Self {
        Self {
            app_id,
            state: AppState::Idle,
            expires_at: None,
            post_choice_shown: false,
            last_recovery_launch_at: None,
            suppress_recovery_until: None,
        }
    }
}

/// An edge that is not in the state machine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("illegal transition for {app_id}: {from:?} -> {to:?}")]
pub struct TransitionError {
    pub app_id: AppId,
    pub from: AppState,
    pub to: AppState,
}

/// The table of per-app session entries.
///
/// All mutation goes through edge-validating methods; a rejected edge leaves
/// the entry untouched and returns [`TransitionError`]. Only
/// `reset_to_idle` and `switch_to_intervention` are unconditional: recovery
/// and the explicit user switch are legal from every state.
#[derive(Debug, Default)]
pub struct SessionTable {
    entries: HashMap<AppId, AppEntry>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state for an app. Absent entries read as `Idle`.
    pub fn state_of(&self, app_id: &str) -> AppState {
        self.entries
            .get(app_id)
            .map(|e| e.state)
            .unwrap_or(AppState::Idle)
    }

    pub fn get(&self, app_id: &str) -> Option<&AppEntry> {
        self.entries.get(app_id)
    }

    /// Entry for an app, created lazily in `Idle`.
    pub fn entry_mut(&mut self, app_id: &str) -> &mut AppEntry {
        self.entries
            .entry(app_id.to_string())
            .or_insert_with(|| AppEntry::new(app_id.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &AppEntry> {
        self.entries.values()
    }

    fn checked(
        &mut self,
        app_id: &str,
        expected: AppState,
        to: AppState,
    ) -> Result<&mut AppEntry, TransitionError> {
        let entry = self.entry_mut(app_id);
        if entry.state != expected {
            return Err(TransitionError {
                app_id: app_id.to_string(),
                from: entry.state,
                to,
            });
        }
        entry.state = to;
        Ok(entry)
    }

    /// Idle -> Decision. The atomic admission lock: this happens before any
    /// decision side effect is emitted.
    pub fn begin_decision(&mut self, app_id: &str) -> Result<(), TransitionError> {
        self.checked(app_id, AppState::Idle, AppState::Decision)?;
        Ok(())
    }

    /// Decision -> Active with a fresh expiry.
    pub fn activate(
        &mut self,
        app_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        let entry = self.checked(app_id, AppState::Decision, AppState::Active)?;
        entry.expires_at = Some(expires_at);
        entry.post_choice_shown = false;
        Ok(())
    }

    /// Decision -> Idle (user declined the offer).
    pub fn decline(&mut self, app_id: &str) -> Result<(), TransitionError> {
        self.checked(app_id, AppState::Decision, AppState::Idle)?;
        Ok(())
    }

    /// Active -> PostChoice (expiry fired in the foreground with quota left).
    pub fn enter_post_choice(&mut self, app_id: &str) -> Result<(), TransitionError> {
        let entry = self.checked(app_id, AppState::Active, AppState::PostChoice)?;
        entry.post_choice_shown = true;
        Ok(())
    }

    /// Active -> Idle, silently (expiry in background, or quota spent).
    pub fn expire_to_idle(&mut self, app_id: &str) -> Result<(), TransitionError> {
        let entry = self.checked(app_id, AppState::Active, AppState::Idle)?;
        entry.expires_at = None;
        Ok(())
    }

    /// PostChoice -> Idle. The single finalize operation both continue and
    /// quit funnel through: clears expiry bookkeeping.
    pub fn finalize_post_choice(&mut self, app_id: &str) -> Result<(), TransitionError> {
        let entry = self.checked(app_id, AppState::PostChoice, AppState::Idle)?;
        entry.expires_at = None;
        entry.post_choice_shown = false;
        Ok(())
    }

    /// Any state -> InterventionActive (explicit user switch).
    pub fn switch_to_intervention(&mut self, app_id: &str) {
        let entry = self.entry_mut(app_id);
        entry.state = AppState::InterventionActive;
        entry.expires_at = None;
        entry.post_choice_shown = false;
    }

    /// Any state -> Idle, clearing everything except the recovery stamps.
    /// Used by watchdog recovery and the committed effective-state reset.
    pub fn reset_to_idle(&mut self, app_id: &str) {
        let entry = self.entry_mut(app_id);
        entry.state = AppState::Idle;
        entry.expires_at = None;
        entry.post_choice_shown = false;
    }

    /// Record a resume emission for the debounce window.
    pub fn mark_recovery_launch(
        &mut self,
        app_id: &str,
        at: DateTime<Utc>,
        suppress_until: DateTime<Utc>,
    ) {
        let entry = self.entry_mut(app_id);
        entry.last_recovery_launch_at = Some(at);
        entry.suppress_recovery_until = Some(suppress_until);
    }

    /// Install a restored entry wholesale (crash recovery).
    pub fn install(&mut self, entry: AppEntry) {
        self.entries.insert(entry.app_id.clone(), entry);
    }

    /// Drop all entries. Restore rebuilds from the durable store.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_entry_reads_idle() {
        let table = SessionTable::new();
        assert_eq!(table.state_of("com.example.a"), AppState::Idle);
        assert!(table.get("com.example.a").is_none());
    }

    #[test]
    fn full_quick_task_walk() {
        let mut table = SessionTable::new();
        let app = "com.example.a";
        let expires = Utc::now();

        table.begin_decision(app).unwrap();
        assert_eq!(table.state_of(app), AppState::Decision);

        table.activate(app, expires).unwrap();
        assert_eq!(table.state_of(app), AppState::Active);
        assert_eq!(table.get(app).unwrap().expires_at, Some(expires));

        table.enter_post_choice(app).unwrap();
        assert!(table.get(app).unwrap().post_choice_shown);

        table.finalize_post_choice(app).unwrap();
        assert_eq!(table.state_of(app), AppState::Idle);
        assert_eq!(table.get(app).unwrap().expires_at, None);
        assert!(!table.get(app).unwrap().post_choice_shown);
    }

    #[test]
    fn decline_returns_to_idle() {
        let mut table = SessionTable::new();
        table.begin_decision("a").unwrap();
        table.decline("a").unwrap();
        assert_eq!(table.state_of("a"), AppState::Idle);
    }

    #[test]
    fn illegal_edges_rejected_without_mutation() {
        let mut table = SessionTable::new();
        let err = table.activate("a", Utc::now()).unwrap_err();
        assert_eq!(err.from, AppState::Idle);
        assert_eq!(err.to, AppState::Active);
        assert_eq!(table.state_of("a"), AppState::Idle);

        table.begin_decision("a").unwrap();
        assert!(table.begin_decision("a").is_err());
        assert!(table.enter_post_choice("a").is_err());
        assert!(table.finalize_post_choice("a").is_err());
        assert_eq!(table.state_of("a"), AppState::Decision);
    }

    #[test]
    fn intervention_switch_allowed_from_any_state() {
        let mut table = SessionTable::new();
        table.begin_decision("a").unwrap();
        table.activate("a", Utc::now()).unwrap();
        table.switch_to_intervention("a");
        assert_eq!(table.state_of("a"), AppState::InterventionActive);
        assert_eq!(table.get("a").unwrap().expires_at, None);
    }

    #[test]
    fn reset_preserves_recovery_stamps() {
        let mut table = SessionTable::new();
        let at = Utc::now();
        table.switch_to_intervention("a");
        table.mark_recovery_launch("a", at, at + chrono::Duration::milliseconds(800));
        table.reset_to_idle("a");
        let entry = table.get("a").unwrap();
        assert_eq!(entry.state, AppState::Idle);
        assert_eq!(entry.last_recovery_launch_at, Some(at));
    }

    #[test]
    fn state_string_roundtrip() {
        for state in [
            AppState::Idle,
            AppState::Decision,
            AppState::Active,
            AppState::PostChoice,
            AppState::InterventionActive,
        ] {
            assert_eq!(AppState::parse(state.as_str()), Some(state));
        }
        assert_eq!(AppState::parse("bogus"), None);
    }
}
