//! The admission decision gate.
//!
//! [`AccessEntryEvaluator::evaluate`] is a pure function from a consistent
//! snapshot of engine state to exactly one admission decision. It never
//! mutates anything: the effective-state view it computes for a
//! non-preserved intervention is committed separately by the service, in the
//! same single-writer turn, before any side effect is emitted.
//!
//! Rules are evaluated strictly top to bottom; the first match wins. Every
//! `NoAction` carries a machine-readable reason code -- tests assert on
//! these, downstream observability keys on them.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::session::AppState;

/// What the engine should do for an entry event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum EntryAction {
    /// Offer the quick-task bypass.
    StartQuickTask,
    /// Launch (or resume) the full reflective flow.
    StartIntervention { resume: bool },
    /// Do nothing.
    NoAction,
}

/// Why the gate decided what it decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    /// App is not on the monitored allowlist.
    NotMonitored,
    /// A time-boxed exemption is running for this app.
    ExemptionActive,
    /// A resume command was emitted less than the debounce window ago.
    ResumeDebounced,
    /// A preserved intervention resumes instead of restarting.
    PreservedResume,
    /// The overlay surface is already up (or in flight).
    SurfaceActive,
    /// The app is mid-session (effective state not Idle/PostChoice).
    SessionInProgress,
    /// The rolling quota is spent.
    QuotaExhausted,
    /// Quit-suppression window still running.
    QuitSuppressed,
    /// Wake-suppression window still running.
    WakeSuppressed,
    /// Entry admitted.
    Admitted,
}

/// One admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    #[serde(flatten)]
    pub action: EntryAction,
    pub reason: DecisionReason,
}

impl Decision {
    fn no_action(reason: DecisionReason) -> Self {
        Self {
            action: EntryAction::NoAction,
            reason,
        }
    }
}

/// A consistent read-only snapshot of everything the gate looks at.
///
/// The service assembles this inside the single-writer context, so no field
/// can change while the ladder runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntrySnapshot {
    pub is_monitored: bool,
    pub quota_remaining: u32,
    pub is_surface_active: bool,
    pub app_state: AppState,
    /// Remaining exemption time; `<= 0` means none.
    pub intention_remaining_ms: i64,
    pub is_intervention_preserved: bool,
    /// When the last resume command was emitted for this app, if ever.
    pub last_intervention_emitted_at: Option<DateTime<Utc>>,
    /// Remaining quit-suppression; `None` means no entry. A `Some` value
    /// `<= 0` is an expired entry that behaves as absent.
    pub quit_suppression_remaining_ms: Option<i64>,
    /// Remaining wake-suppression, same convention.
    pub wake_suppression_remaining_ms: Option<i64>,
    /// Forced entries skip both suppression windows.
    pub is_force_entry: bool,
}

/// The pure decision gate.
#[derive(Debug, Clone)]
pub struct AccessEntryEvaluator {
    resume_debounce: Duration,
}

impl Default for AccessEntryEvaluator {
    fn default() -> Self {
        Self::new(Duration::milliseconds(800))
    }
}

impl AccessEntryEvaluator {
    pub fn new(resume_debounce: Duration) -> Self {
        Self { resume_debounce }
    }

    /// Evaluate one entry event. Pure and deterministic.
    pub fn evaluate(&self, now: DateTime<Utc>, snapshot: &EntrySnapshot) -> Decision {
        // 1. Unmonitored apps are invisible to the engine.
        if !snapshot.is_monitored {
            return Decision::no_action(DecisionReason::NotMonitored);
        }

        // 2. An active exemption suppresses everything.
        if snapshot.intention_remaining_ms > 0 {
            return Decision::no_action(DecisionReason::ExemptionActive);
        }

        // 3. Preserved interventions resume, debounced against duplicate
        //    resume emissions in quick succession.
        if snapshot.is_intervention_preserved {
            if let Some(last) = snapshot.last_intervention_emitted_at {
                if now - last < self.resume_debounce {
                    return Decision::no_action(DecisionReason::ResumeDebounced);
                }
            }
            return Decision {
                action: EntryAction::StartIntervention { resume: true },
                reason: DecisionReason::PreservedResume,
            };
        }

        // 4. A non-preserved intervention reads as Idle for the rest of the
        //    ladder. Computed view only; the commit happens in the service.
        let effective_state = if snapshot.app_state == AppState::InterventionActive {
            AppState::Idle
        } else {
            snapshot.app_state
        };

        // 5.
        if snapshot.is_surface_active {
            return Decision::no_action(DecisionReason::SurfaceActive);
        }

        // 6.
        if !matches!(effective_state, AppState::Idle | AppState::PostChoice) {
            return Decision::no_action(DecisionReason::SessionInProgress);
        }

        // 7.
        if snapshot.quota_remaining == 0 {
            return Decision::no_action(DecisionReason::QuotaExhausted);
        }

        // 8. An expired suppression entry behaves as if absent.
        if let Some(remaining) = snapshot.quit_suppression_remaining_ms {
            if remaining > 0 && !snapshot.is_force_entry {
                return Decision::no_action(DecisionReason::QuitSuppressed);
            }
        }

        // 9.
        if let Some(remaining) = snapshot.wake_suppression_remaining_ms {
            if remaining > 0 && !snapshot.is_force_entry {
                return Decision::no_action(DecisionReason::WakeSuppressed);
            }
        }

        // 10.
        Decision {
            action: EntryAction::StartQuickTask,
            reason: DecisionReason::Admitted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_snapshot() -> EntrySnapshot {
        EntrySnapshot {
            is_monitored: true,
            quota_remaining: 3,
            is_surface_active: false,
            app_state: AppState::Idle,
            intention_remaining_ms: 0,
            is_intervention_preserved: false,
            last_intervention_emitted_at: None,
            quit_suppression_remaining_ms: None,
            wake_suppression_remaining_ms: None,
            is_force_entry: false,
        }
    }

    fn gate() -> AccessEntryEvaluator {
        AccessEntryEvaluator::default()
    }

    #[test]
    fn admits_open_entry() {
        let d = gate().evaluate(Utc::now(), &open_snapshot());
        assert_eq!(d.action, EntryAction::StartQuickTask);
        assert_eq!(d.reason, DecisionReason::Admitted);
    }

    #[test]
    fn unmonitored_wins_over_everything() {
        let mut snap = open_snapshot();
        snap.is_monitored = false;
        snap.is_intervention_preserved = true;
        let d = gate().evaluate(Utc::now(), &snap);
        assert_eq!(d.action, EntryAction::NoAction);
        assert_eq!(d.reason, DecisionReason::NotMonitored);
    }

    #[test]
    fn exemption_suppresses_preserved_resume() {
        let mut snap = open_snapshot();
        snap.intention_remaining_ms = 60_000;
        snap.is_intervention_preserved = true;
        let d = gate().evaluate(Utc::now(), &snap);
        assert_eq!(d.reason, DecisionReason::ExemptionActive);
    }

    #[test]
    fn preserved_resumes_after_debounce() {
        let now = Utc::now();
        let mut snap = open_snapshot();
        snap.is_intervention_preserved = true;
        snap.app_state = AppState::InterventionActive;

        snap.last_intervention_emitted_at = Some(now - Duration::milliseconds(300));
        let d = gate().evaluate(now, &snap);
        assert_eq!(d.action, EntryAction::NoAction);
        assert_eq!(d.reason, DecisionReason::ResumeDebounced);

        snap.last_intervention_emitted_at = Some(now - Duration::milliseconds(900));
        let d = gate().evaluate(now, &snap);
        assert_eq!(d.action, EntryAction::StartIntervention { resume: true });
        assert_eq!(d.reason, DecisionReason::PreservedResume);
    }

    #[test]
    fn preserved_resume_beats_surface_active() {
        // Rule 3 sits above rule 5: a resume is re-emitted even while the
        // surface is up, and downstream dedupes on the envelope nonce.
        let mut snap = open_snapshot();
        snap.is_intervention_preserved = true;
        snap.is_surface_active = true;
        let d = gate().evaluate(Utc::now(), &snap);
        assert_eq!(d.action, EntryAction::StartIntervention { resume: true });
    }

    #[test]
    fn unpreserved_intervention_reads_as_idle() {
        let mut snap = open_snapshot();
        snap.app_state = AppState::InterventionActive;
        let d = gate().evaluate(Utc::now(), &snap);
        assert_eq!(d.action, EntryAction::StartQuickTask);
    }

    #[test]
    fn surface_active_blocks() {
        let mut snap = open_snapshot();
        snap.is_surface_active = true;
        let d = gate().evaluate(Utc::now(), &snap);
        assert_eq!(d.reason, DecisionReason::SurfaceActive);
    }

    #[test]
    fn mid_session_states_block() {
        for state in [AppState::Decision, AppState::Active] {
            let mut snap = open_snapshot();
            snap.app_state = state;
            let d = gate().evaluate(Utc::now(), &snap);
            assert_eq!(d.reason, DecisionReason::SessionInProgress, "{state:?}");
        }
    }

    #[test]
    fn quota_exhausted_blocks() {
        let mut snap = open_snapshot();
        snap.quota_remaining = 0;
        let d = gate().evaluate(Utc::now(), &snap);
        assert_eq!(d.reason, DecisionReason::QuotaExhausted);
    }

    #[test]
    fn suppression_blocks_unless_forced_or_expired() {
        let mut snap = open_snapshot();
        snap.quit_suppression_remaining_ms = Some(700);
        let d = gate().evaluate(Utc::now(), &snap);
        assert_eq!(d.reason, DecisionReason::QuitSuppressed);

        snap.is_force_entry = true;
        let d = gate().evaluate(Utc::now(), &snap);
        assert_eq!(d.action, EntryAction::StartQuickTask);

        snap.is_force_entry = false;
        snap.quit_suppression_remaining_ms = Some(0);
        let d = gate().evaluate(Utc::now(), &snap);
        assert_eq!(d.action, EntryAction::StartQuickTask);

        snap.wake_suppression_remaining_ms = Some(1500);
        let d = gate().evaluate(Utc::now(), &snap);
        assert_eq!(d.reason, DecisionReason::WakeSuppressed);

        snap.wake_suppression_remaining_ms = Some(-20);
        let d = gate().evaluate(Utc::now(), &snap);
        assert_eq!(d.reason, DecisionReason::Admitted);
    }

    #[test]
    fn quit_suppression_checked_before_wake() {
        let mut snap = open_snapshot();
        snap.quit_suppression_remaining_ms = Some(500);
        snap.wake_suppression_remaining_ms = Some(500);
        let d = gate().evaluate(Utc::now(), &snap);
        assert_eq!(d.reason, DecisionReason::QuitSuppressed);
    }
}
