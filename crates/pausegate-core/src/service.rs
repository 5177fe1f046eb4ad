//! The single-writer engine service.
//!
//! Every state mutation -- state-machine transitions, quota changes,
//! suppression writes, surface register/close -- happens inside this
//! service, which the runtime drives from exactly one task. External inputs
//! are funneled in as [`EngineEvent`]s; delayed work comes back through
//! [`advance`].
//!
//! Admission follows a two-phase evaluate-then-commit transaction: the pure
//! gate computes a decision (including the effective-state view of a
//! non-preserved intervention), then this service commits the implied state
//! reset and the decision's side effects atomically within the same turn.
//! No side effect is emitted before the `Idle -> Decision` admission lock
//! is taken.
//!
//! The in-memory state is authoritative; durable writes are best-effort
//! crash-recovery backups and never fail a turn.
//!
//! [`advance`]: EngineService::advance

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::commands::{Command, CommandEmitter, CommandSink};
use crate::events::{AppId, EngineEvent, SurfaceLifecycleKind, UserIntentKind};
use crate::gate::{AccessEntryEvaluator, DecisionReason, EntryAction, EntrySnapshot};
use crate::quota::{QuotaLedger, QuotaState};
use crate::session::{AppState, SessionTable};
use crate::storage::{EngineConfig, Store};
use crate::suppression::{SuppressionKind, SuppressionWindows};
use crate::surface::{
    CloseBegin, PendingWake, RegisterOutcome, SurfaceLifecycleManager, SurfaceSession, WakeReason,
};
use crate::timers::{TimerKey, TimerSupervisor};

/// Serializable view of the engine for inspection tooling.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineSnapshot {
    pub apps: Vec<crate::session::AppEntry>,
    pub quota: QuotaState,
    pub monitored: Vec<AppId>,
    pub preserved: Vec<AppId>,
    pub surface: Option<SurfaceSession>,
    pub pending_wake: Option<PendingWake>,
    pub raw_foreground: Option<AppId>,
}

/// The admission-control engine.
pub struct EngineService {
    config: EngineConfig,
    evaluator: AccessEntryEvaluator,
    store: Store,
    sessions: SessionTable,
    quota: QuotaLedger,
    suppression: SuppressionWindows,
    timers: TimerSupervisor,
    surface: SurfaceLifecycleManager,
    emitter: CommandEmitter,
    monitored: HashSet<AppId>,
    preserved: HashSet<AppId>,
    exemptions: HashMap<AppId, DateTime<Utc>>,
    raw_foreground: Option<AppId>,
    presentation_ready: bool,
    /// Apps whose deferred decision retry is already scheduled or spent.
    deferred_retried: HashSet<AppId>,
}

fn ms(value: u64) -> Duration {
    Duration::milliseconds(value as i64)
}

impl EngineService {
    pub fn new(
        config: EngineConfig,
        store: Store,
        sink: Box<dyn CommandSink>,
        now: DateTime<Utc>,
    ) -> Self {
        let evaluator = AccessEntryEvaluator::new(ms(config.timing.resume_debounce_ms));
        let quota = QuotaLedger::new(
            config.quota.max,
            Duration::minutes(config.quota.window_minutes as i64),
            now,
        );
        Self {
            config,
            evaluator,
            store,
            sessions: SessionTable::new(),
            quota,
            suppression: SuppressionWindows::new(),
            timers: TimerSupervisor::new(),
            surface: SurfaceLifecycleManager::new(),
            emitter: CommandEmitter::new(sink),
            monitored: HashSet::new(),
            preserved: HashSet::new(),
            exemptions: HashMap::new(),
            raw_foreground: None,
            presentation_ready: true,
            deferred_retried: HashSet::new(),
        }
    }

    // ── Restore ─────────────────────────────────────────────────────

    /// Rebuild in-memory state from the durable store. Idempotent: calling
    /// it twice is equivalent to calling it once.
    pub fn restore(&mut self, now: DateTime<Utc>) {
        self.timers.clear();
        self.surface.clear();
        self.sessions.clear();
        self.exemptions.clear();
        self.deferred_retried.clear();

        self.monitored = self.store.load_allowlist().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "allowlist unreadable; monitoring nothing");
            HashSet::new()
        });
        self.preserved = self.store.load_preserved().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "preserved set unreadable; treating as empty");
            HashSet::new()
        });

        let window = Duration::minutes(self.config.quota.window_minutes as i64);
        self.quota = match self.store.load_quota() {
            Ok(Some(state)) => QuotaLedger::from_state(state, window),
            Ok(None) => QuotaLedger::new(self.config.quota.max, window, now),
            Err(e) => {
                tracing::warn!(error = %e, "quota record unreadable; starting fresh window");
                QuotaLedger::new(self.config.quota.max, window, now)
            }
        };
        if self.quota.check_refill(now) {
            self.save_quota();
        }

        let records = self.store.load_entries().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "app records unreadable; restoring none");
            Vec::new()
        });
        for record in records {
            match record.state {
                AppState::Active => match record.expires_at {
                    Some(expires_at) if expires_at > now => {
                        let entry = self.sessions.entry_mut(&record.app_id);
                        entry.state = AppState::Active;
                        entry.expires_at = Some(expires_at);
                        self.timers.schedule(
                            TimerKey::QuickTaskExpiry {
                                app_id: record.app_id.clone(),
                            },
                            expires_at,
                        );
                        tracing::info!(app_id = %record.app_id, %expires_at, "restored active quick task");
                    }
                    _ => {
                        tracing::debug!(app_id = %record.app_id, "discarding expired quick task record");
                        if let Err(e) = self.store.delete_entry(&record.app_id) {
                            tracing::warn!(error = %e, "failed to drop expired record");
                        }
                    }
                },
                AppState::InterventionActive => {
                    self.sessions.switch_to_intervention(&record.app_id);
                    tracing::info!(app_id = %record.app_id, "restored intervention record");
                }
                other => {
                    tracing::warn!(app_id = %record.app_id, state = ?other, "ignoring non-durable record");
                }
            }
        }

        // The preserved flag wins over the primary record: a preserved app
        // is forced to InterventionActive even if the record disagrees.
        for app_id in self.preserved.clone() {
            if self.sessions.state_of(&app_id) != AppState::InterventionActive {
                self.sessions.switch_to_intervention(&app_id);
                tracing::info!(%app_id, "forced intervention state from preserved flag");
            }
        }

        if let Err(e) = self.store.kv_set("last_restore_at", &now.to_rfc3339()) {
            tracing::warn!(error = %e, "failed to stamp restore time");
        }
    }

    // ── Event funnel ────────────────────────────────────────────────

    pub fn handle_event(&mut self, event: EngineEvent, now: DateTime<Utc>) {
        match event {
            EngineEvent::ForegroundChanged { app_id, at } => {
                self.on_foreground_changed(app_id, at, now)
            }
            EngineEvent::UserIntent {
                kind,
                app_id,
                session_id,
            } => self.on_user_intent(kind, &app_id, session_id, now),
            EngineEvent::SurfaceLifecycle {
                kind,
                instance_id,
                session_id,
            } => self.on_surface_lifecycle(kind, instance_id, session_id, now),
            EngineEvent::TimerFired { app_id } => {
                // Externally mirrored timer; fold into the internal path.
                self.timers.cancel(&TimerKey::QuickTaskExpiry {
                    app_id: app_id.clone(),
                });
                self.on_quick_task_expiry(&app_id, now);
            }
            EngineEvent::ExemptionGranted { app_id, until } => {
                if until > now {
                    tracing::debug!(%app_id, %until, "exemption granted");
                    self.exemptions.insert(app_id, until);
                } else {
                    self.exemptions.remove(&app_id);
                }
            }
            EngineEvent::WakeSuppression { app_id, until } => {
                tracing::debug!(%app_id, %until, "wake suppression set");
                self.suppression.set(SuppressionKind::Wake, &app_id, until);
            }
            EngineEvent::SetInterventionPreserved { app_id, preserved } => {
                tracing::debug!(%app_id, preserved, "preserved flag updated");
                if preserved {
                    self.preserved.insert(app_id.clone());
                } else {
                    self.preserved.remove(&app_id);
                }
                if let Err(e) = self.store.set_preserved(&app_id, preserved) {
                    tracing::warn!(error = %e, "failed to persist preserved flag");
                }
            }
            EngineEvent::PresentationReady { ready } => {
                tracing::info!(ready, "presentation readiness changed");
                self.presentation_ready = ready;
            }
        }
    }

    /// Fire every due timer. The runtime calls this after each sleep and
    /// after each handled event.
    pub fn advance(&mut self, now: DateTime<Utc>) {
        for (key, generation) in self.timers.take_due(now) {
            tracing::debug!(?key, generation, "timer fired");
            match key {
                TimerKey::QuickTaskExpiry { app_id } => self.on_quick_task_expiry(&app_id, now),
                TimerKey::BootWatchdog { session_id } => self.on_boot_watchdog(session_id, now),
                TimerKey::FinishVerify { session_id } => self.on_finish_verify(session_id),
                TimerKey::MismatchCheck => self.on_mismatch_check(now),
                TimerKey::SettleReplay { app_id } => self.on_settle_replay(&app_id, now),
                TimerKey::DeferredEntry { app_id } => self.on_deferred_entry(&app_id, now),
            }
        }
    }

    /// Earliest pending deadline for the runtime driver.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.timers.next_deadline()
    }

    // ── Foreground entry ────────────────────────────────────────────

    fn on_foreground_changed(&mut self, app_id: AppId, at: DateTime<Utc>, now: DateTime<Utc>) {
        tracing::debug!(%app_id, observed_at = %at, "foreground changed");
        self.raw_foreground = Some(app_id.clone());
        self.check_quota_refill(now);
        self.track_mismatch(&app_id, now);

        if app_id == self.config.surface.overlay_package {
            return;
        }

        // POST_CHOICE is a hard lock: entry events are rejected outright,
        // not re-evaluated.
        if self.sessions.state_of(&app_id) == AppState::PostChoice {
            tracing::debug!(%app_id, "entry rejected: post-choice lock");
            return;
        }

        self.evaluate_entry(&app_id, now, false);
    }

    fn track_mismatch(&mut self, app_id: &str, now: DateTime<Utc>) {
        let Some(current) = self.surface.current() else {
            return;
        };
        let matches_session =
            app_id == self.config.surface.overlay_package || app_id == current.app_id;
        if matches_session {
            self.surface.clear_mismatch();
            self.timers.cancel(&TimerKey::MismatchCheck);
        } else if self.config.is_transient_surface(app_id) {
            // Input methods, launchers, permission prompts: neither a
            // mismatch nor proof the session is healthy.
        } else if self.surface.note_mismatch(now) {
            self.timers.schedule(
                TimerKey::MismatchCheck,
                now + ms(self.config.timing.mismatch_threshold_ms),
            );
        }
    }

    fn entry_snapshot(&self, app_id: &str, now: DateTime<Utc>, force: bool) -> EntrySnapshot {
        let intention_remaining_ms = self
            .exemptions
            .get(app_id)
            .map(|until| (*until - now).num_milliseconds())
            .unwrap_or(0);
        EntrySnapshot {
            is_monitored: self.monitored.contains(app_id),
            quota_remaining: self.quota.remaining(),
            is_surface_active: self.surface.is_active(),
            app_state: self.sessions.state_of(app_id),
            intention_remaining_ms,
            is_intervention_preserved: self.preserved.contains(app_id),
            last_intervention_emitted_at: self
                .sessions
                .get(app_id)
                .and_then(|e| e.last_recovery_launch_at),
            quit_suppression_remaining_ms: self.suppression.remaining_ms(
                SuppressionKind::Quit,
                app_id,
                now,
            ),
            wake_suppression_remaining_ms: self.suppression.remaining_ms(
                SuppressionKind::Wake,
                app_id,
                now,
            ),
            is_force_entry: force,
        }
    }

    fn evaluate_entry(&mut self, app_id: &str, now: DateTime<Utc>, force: bool) {
        // Lazily drop an expired exemption so the snapshot reads clean.
        if let Some(until) = self.exemptions.get(app_id) {
            if *until <= now {
                self.exemptions.remove(app_id);
            }
        }
        // Read-and-prune both suppression windows: an expired entry is
        // removed here and reads as absent from the snapshot on.
        self.suppression
            .is_suppressed(SuppressionKind::Quit, app_id, now);
        self.suppression
            .is_suppressed(SuppressionKind::Wake, app_id, now);

        let snapshot = self.entry_snapshot(app_id, now, force);
        let decision = self.evaluator.evaluate(now, &snapshot);
        tracing::debug!(%app_id, action = ?decision.action, reason = ?decision.reason, "entry evaluated");

        // Commit the effective-state view the gate computed: a non-preserved
        // intervention ends now, before any side effect is emitted.
        let ladder_reached_rule_4 = !matches!(
            decision.reason,
            DecisionReason::NotMonitored | DecisionReason::ExemptionActive
        );
        if ladder_reached_rule_4
            && snapshot.app_state == AppState::InterventionActive
            && !snapshot.is_intervention_preserved
        {
            tracing::info!(%app_id, "intervention ended (not preserved)");
            self.sessions.reset_to_idle(app_id);
            self.persist(app_id);
        }

        match decision.action {
            EntryAction::NoAction => {
                if decision.reason == DecisionReason::QuotaExhausted {
                    self.emitter.emit(
                        now,
                        Command::QuotaExhausted {
                            app_id: app_id.to_string(),
                        },
                    );
                }
            }
            EntryAction::StartQuickTask => self.start_quick_task_offer(app_id, now),
            EntryAction::StartIntervention { resume } => {
                // The gate only produces resume decisions; fresh
                // interventions come in as user intents.
                debug_assert!(resume);
                self.start_intervention_resume(app_id, now);
            }
        }
    }

    /// True when a decision may execute now. Otherwise defers it exactly
    /// once: the event is retried after a short fixed delay, then dropped.
    fn ensure_ready_or_defer(&mut self, app_id: &str, now: DateTime<Utc>) -> bool {
        if self.presentation_ready {
            self.deferred_retried.remove(app_id);
            return true;
        }
        if self.deferred_retried.insert(app_id.to_string()) {
            tracing::warn!(%app_id, "presentation not ready; deferring decision once");
            self.timers.schedule(
                TimerKey::DeferredEntry {
                    app_id: app_id.to_string(),
                },
                now + ms(self.config.timing.deferred_retry_ms),
            );
        } else {
            self.deferred_retried.remove(app_id);
            tracing::warn!(%app_id, "presentation still not ready; dropping decision");
        }
        false
    }

    fn start_quick_task_offer(&mut self, app_id: &str, now: DateTime<Utc>) {
        if !self.ensure_ready_or_defer(app_id, now) {
            return;
        }
        // The admission lock: taken synchronously before any side effect.
        if let Err(e) = self.sessions.begin_decision(app_id) {
            tracing::warn!(error = %e, "admission raced a state change; dropping");
            return;
        }
        let (session_id, replaced) = self
            .surface
            .begin_wake(app_id, WakeReason::QuickTaskOffer, now);
        if let Some(stale) = replaced {
            tracing::debug!(%stale, "superseded a pending wake");
        }
        tracing::info!(%app_id, %session_id, "quick-task offer");
        self.emitter.emit(
            now,
            Command::ShowQuickTaskOffer {
                app_id: app_id.to_string(),
            },
        );
    }

    fn start_intervention_resume(&mut self, app_id: &str, now: DateTime<Utc>) {
        if !self.ensure_ready_or_defer(app_id, now) {
            return;
        }
        self.sessions.switch_to_intervention(app_id);
        self.sessions.mark_recovery_launch(
            app_id,
            now,
            now + ms(self.config.timing.resume_debounce_ms),
        );
        self.persist(app_id);
        if self.surface.current().is_none() {
            let (session_id, _) = self.surface.begin_wake(app_id, WakeReason::Intervention, now);
            tracing::info!(%app_id, %session_id, "resuming intervention");
        } else {
            // The live surface navigates in place; no second session.
            tracing::info!(%app_id, "resuming intervention on live surface");
        }
        self.emitter.emit(
            now,
            Command::ShowIntervention {
                app_id: app_id.to_string(),
                resume: true,
            },
        );
    }

    // ── User intents ────────────────────────────────────────────────

    fn on_user_intent(
        &mut self,
        kind: UserIntentKind,
        app_id: &str,
        session_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) {
        if let (Some(sid), Some(current)) = (session_id, self.surface.current()) {
            if current.session_id != sid {
                tracing::warn!(%app_id, intent = ?kind, %sid, "stale intent for superseded session");
                return;
            }
        }
        tracing::debug!(%app_id, intent = ?kind, "user intent");
        match kind {
            UserIntentKind::AcceptQuickTask => self.on_accept_quick_task(app_id, now),
            UserIntentKind::DeclineQuickTask => self.on_decline_quick_task(app_id, now),
            UserIntentKind::SwitchToIntervention => self.on_switch_to_intervention(app_id, now),
            UserIntentKind::PostChoiceContinue => self.on_post_choice(app_id, true, now),
            UserIntentKind::PostChoiceQuit => self.on_post_choice(app_id, false, now),
        }
    }

    /// Decision -> Active: decrement quota, arm the expiry timer, persist.
    fn grant_quick_task(&mut self, app_id: &str, now: DateTime<Utc>) -> bool {
        let expires_at = now + Duration::minutes(self.config.quick_task_minutes(app_id) as i64);
        if let Err(e) = self.sessions.activate(app_id, expires_at) {
            tracing::warn!(error = %e, "stale accept; dropping");
            return false;
        }
        self.quota.decrement();
        self.save_quota();
        self.timers.schedule(
            TimerKey::QuickTaskExpiry {
                app_id: app_id.to_string(),
            },
            expires_at,
        );
        self.persist(app_id);
        tracing::info!(%app_id, %expires_at, remaining = self.quota.remaining(), "quick task granted");
        self.emitter.emit(
            now,
            Command::QuickTaskActivated {
                app_id: app_id.to_string(),
                expires_at,
            },
        );
        self.emitter.emit(
            now,
            Command::QuotaUpdated {
                remaining: self.quota.remaining(),
            },
        );
        true
    }

    fn on_accept_quick_task(&mut self, app_id: &str, now: DateTime<Utc>) {
        if self.grant_quick_task(app_id, now) {
            self.close_current_surface("quick_task_accepted", now);
        }
    }

    fn on_decline_quick_task(&mut self, app_id: &str, now: DateTime<Utc>) {
        if let Err(e) = self.sessions.decline(app_id) {
            tracing::warn!(error = %e, "stale decline; dropping");
            return;
        }
        self.close_current_surface("offer_declined", now);
    }

    fn on_switch_to_intervention(&mut self, app_id: &str, now: DateTime<Utc>) {
        self.sessions.switch_to_intervention(app_id);
        self.preserved.insert(app_id.to_string());
        if let Err(e) = self.store.set_preserved(app_id, true) {
            tracing::warn!(error = %e, "failed to persist preserved flag");
        }
        self.persist(app_id);
        if self.surface.current().is_none() && self.surface.pending().is_none() {
            let (session_id, _) = self.surface.begin_wake(app_id, WakeReason::Intervention, now);
            tracing::info!(%app_id, %session_id, "starting intervention");
        }
        self.emitter.emit(
            now,
            Command::ShowIntervention {
                app_id: app_id.to_string(),
                resume: false,
            },
        );
    }

    fn on_post_choice(&mut self, app_id: &str, keep_going: bool, now: DateTime<Utc>) {
        // Continue and quit funnel through the same finalize.
        if let Err(e) = self.sessions.finalize_post_choice(app_id) {
            tracing::warn!(error = %e, "stale post-choice intent; dropping");
            return;
        }
        self.timers.cancel(&TimerKey::QuickTaskExpiry {
            app_id: app_id.to_string(),
        });
        self.persist(app_id);

        if keep_going {
            self.check_quota_refill(now);
            if self.quota.remaining() > 0 {
                // An immediate re-grant, no second offer screen.
                if self.sessions.begin_decision(app_id).is_ok() {
                    self.grant_quick_task(app_id, now);
                }
            } else {
                self.emitter.emit(
                    now,
                    Command::QuotaExhausted {
                        app_id: app_id.to_string(),
                    },
                );
            }
            self.close_current_surface("post_choice_continue", now);
        } else {
            self.suppression.set(
                SuppressionKind::Quit,
                app_id,
                now + ms(self.config.timing.quit_suppression_ms),
            );
            self.close_current_surface("post_choice_quit", now);
        }
    }

    // ── Surface lifecycle ───────────────────────────────────────────

    fn on_surface_lifecycle(
        &mut self,
        kind: SurfaceLifecycleKind,
        instance_id: Uuid,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) {
        match kind {
            SurfaceLifecycleKind::Registered => {
                match self.surface.register(session_id, instance_id, now) {
                    RegisterOutcome::Promoted => {
                        tracing::debug!(%session_id, %instance_id, "surface registered");
                        self.timers.schedule(
                            TimerKey::BootWatchdog { session_id },
                            now + ms(self.config.timing.boot_watchdog_ms),
                        );
                    }
                    RegisterOutcome::Duplicate => {
                        tracing::debug!(%session_id, "duplicate register ignored");
                    }
                    RegisterOutcome::Stale => {
                        tracing::warn!(%session_id, "register from superseded session; finishing it");
                        self.emitter.emit(now, Command::FinishSurface { session_id });
                    }
                }
            }
            SurfaceLifecycleKind::Mounted => {
                if self.surface.notify_mounted(instance_id) {
                    tracing::debug!(%instance_id, "surface mounted");
                    self.timers.cancel(&TimerKey::BootWatchdog { session_id });
                } else {
                    tracing::debug!(%instance_id, "stale mounted signal ignored");
                }
            }
            SurfaceLifecycleKind::Destroyed => {
                self.timers.cancel(&TimerKey::FinishVerify { session_id });
                self.timers.cancel(&TimerKey::BootWatchdog { session_id });
                match self.surface.confirm_destroyed(session_id) {
                    Some(None) => {
                        tracing::debug!(%session_id, "surface teardown confirmed");
                    }
                    Some(Some(app_id)) => {
                        // The OS killed the current surface without a close
                        // request having been issued.
                        tracing::warn!(%session_id, %app_id, "surface destroyed without close request");
                        self.timers.cancel(&TimerKey::MismatchCheck);
                        self.reconcile_after_close(&app_id);
                    }
                    None => {
                        tracing::debug!(%session_id, "stale destroyed signal ignored");
                    }
                }
            }
        }
    }

    /// Close the overlay session. Idempotent per session id: a duplicate
    /// concurrent call is a no-op. The logical close (end the session
    /// record, reconcile app state) happens strictly before the physical
    /// close (FinishSurface + finish-verification watchdog).
    pub fn request_close(&mut self, session_id: Uuid, reason: &str, now: DateTime<Utc>) {
        match self.surface.begin_close(session_id) {
            CloseBegin::AlreadyClosing => {
                tracing::debug!(%session_id, reason, "duplicate close request ignored");
            }
            CloseBegin::Unknown => {
                tracing::debug!(%session_id, reason, "close request for unknown session ignored");
            }
            CloseBegin::Accepted { app_id } => {
                tracing::info!(%session_id, %app_id, reason, "closing surface session");
                self.timers.cancel(&TimerKey::BootWatchdog { session_id });
                self.timers.cancel(&TimerKey::MismatchCheck);
                self.reconcile_after_close(&app_id);
                self.emitter.emit(now, Command::FinishSurface { session_id });
                self.timers.schedule(
                    TimerKey::FinishVerify { session_id },
                    now + ms(self.config.timing.finish_verify_ms),
                );
            }
        }
    }

    fn close_current_surface(&mut self, reason: &str, now: DateTime<Utc>) {
        let session_id = self
            .surface
            .current()
            .map(|s| s.session_id)
            .or_else(|| self.surface.pending().map(|p| p.session_id));
        if let Some(session_id) = session_id {
            self.request_close(session_id, reason, now);
        }
    }

    /// Logical-close reconciliation: a session that dies mid-screen must
    /// not leave its app wedged. Decision reverts to Idle (the offer was
    /// never answered); PostChoice reverts to Idle (the hard lock must not
    /// outlive its screen); Active and InterventionActive survive the
    /// surface.
    fn reconcile_after_close(&mut self, app_id: &str) {
        match self.sessions.state_of(app_id) {
            AppState::Decision | AppState::PostChoice => {
                tracing::debug!(%app_id, "reconciling unresolved session to idle");
                self.sessions.reset_to_idle(app_id);
                self.persist(app_id);
            }
            _ => {}
        }
    }

    // ── Timer handlers ──────────────────────────────────────────────

    fn on_quick_task_expiry(&mut self, app_id: &str, now: DateTime<Utc>) {
        // Guard against fires racing cancellation: the state must still
        // match what the timer was scheduled for.
        let Some(entry) = self.sessions.get(app_id) else {
            tracing::debug!(%app_id, "stale expiry fire: no entry");
            return;
        };
        if entry.state != AppState::Active {
            tracing::debug!(%app_id, state = ?entry.state, "stale expiry fire ignored");
            return;
        }
        if let Some(expires_at) = entry.expires_at {
            if expires_at > now {
                tracing::debug!(%app_id, %expires_at, "early expiry fire; rescheduling");
                self.timers.schedule(
                    TimerKey::QuickTaskExpiry {
                        app_id: app_id.to_string(),
                    },
                    expires_at,
                );
                return;
            }
        }

        self.check_quota_refill(now);
        let in_foreground = self.effective_foreground().as_deref() == Some(app_id);

        if in_foreground && self.quota.remaining() > 0 {
            if let Err(e) = self.sessions.enter_post_choice(app_id) {
                tracing::warn!(error = %e, "post-choice transition raced; dropping");
                return;
            }
            self.persist(app_id);
            let (session_id, _) = self.surface.begin_wake(app_id, WakeReason::PostChoice, now);
            tracing::info!(%app_id, %session_id, "quick task expired in foreground");
            self.emitter.emit(
                now,
                Command::ShowPostChoice {
                    app_id: app_id.to_string(),
                },
            );
        } else {
            // Background, or foreground with nothing left to offer: the
            // session ends silently, zero outbound commands.
            if self.sessions.expire_to_idle(app_id).is_ok() {
                self.persist(app_id);
                tracing::debug!(%app_id, in_foreground, "quick task expired silently");
            }
        }
    }

    fn on_boot_watchdog(&mut self, session_id: Uuid, now: DateTime<Utc>) {
        let still_booting = self
            .surface
            .current()
            .map(|s| s.session_id == session_id && !s.mounted)
            .unwrap_or(false);
        if !still_booting {
            tracing::debug!(%session_id, "stale boot watchdog ignored");
            return;
        }
        tracing::warn!(%session_id, "surface never mounted; forcing finish");
        self.request_close(session_id, "boot_watchdog", now);
    }

    fn on_finish_verify(&mut self, session_id: Uuid) {
        if self.surface.is_closing(session_id) {
            // An OS-forced kill swallowed the teardown notification.
            tracing::warn!(%session_id, "teardown never confirmed; forcing cleanup");
            self.surface.force_clear(session_id);
        } else {
            tracing::debug!(%session_id, "stale finish-verify ignored");
        }
    }

    fn on_mismatch_check(&mut self, now: DateTime<Utc>) {
        let Some(current) = self.surface.current() else {
            return;
        };
        let Some(since) = self.surface.mismatch_since() else {
            return;
        };
        let Some(raw) = self.raw_foreground.clone() else {
            return;
        };
        let still_mismatched = raw != self.config.surface.overlay_package
            && raw != current.app_id
            && !self.config.is_transient_surface(&raw);
        if !still_mismatched {
            self.surface.clear_mismatch();
            return;
        }
        let threshold = ms(self.config.timing.mismatch_threshold_ms);
        if now - since < threshold {
            self.timers
                .schedule(TimerKey::MismatchCheck, since + threshold);
            return;
        }
        let session_id = current.session_id;
        tracing::warn!(%session_id, foreground = %raw, "stale surface session; forcing close");
        self.request_close(session_id, "foreground_mismatch", now);
        self.timers.schedule(
            TimerKey::SettleReplay { app_id: raw },
            now + ms(self.config.timing.settle_delay_ms),
        );
    }

    fn on_settle_replay(&mut self, app_id: &str, now: DateTime<Utc>) {
        if self.raw_foreground.as_deref() != Some(app_id) {
            tracing::debug!(%app_id, "settle replay obsolete; foreground moved on");
            return;
        }
        if app_id == self.config.surface.overlay_package
            || self.sessions.state_of(app_id) == AppState::PostChoice
        {
            return;
        }
        self.evaluate_entry(app_id, now, false);
    }

    fn on_deferred_entry(&mut self, app_id: &str, now: DateTime<Utc>) {
        if self.raw_foreground.as_deref() != Some(app_id) {
            self.deferred_retried.remove(app_id);
            tracing::debug!(%app_id, "deferred entry obsolete; foreground moved on");
            return;
        }
        if self.sessions.state_of(app_id) == AppState::PostChoice {
            self.deferred_retried.remove(app_id);
            return;
        }
        self.evaluate_entry(app_id, now, false);
    }

    // ── Shared helpers ──────────────────────────────────────────────

    /// The app the user is semantically interacting with: while the overlay
    /// host is the raw foreground and a session is current, the session's
    /// underlying app.
    pub fn effective_foreground(&self) -> Option<AppId> {
        let raw = self.raw_foreground.as_ref()?;
        if *raw == self.config.surface.overlay_package {
            if let Some(current) = self.surface.current() {
                return Some(current.app_id.clone());
            }
        }
        Some(raw.clone())
    }

    fn check_quota_refill(&mut self, now: DateTime<Utc>) {
        if self.quota.check_refill(now) {
            tracing::info!(remaining = self.quota.remaining(), "quota window refilled");
            self.save_quota();
            self.emitter.emit(
                now,
                Command::QuotaUpdated {
                    remaining: self.quota.remaining(),
                },
            );
        }
    }

    fn save_quota(&mut self) {
        if let Err(e) = self.store.save_quota(&self.quota.snapshot()) {
            tracing::warn!(error = %e, "failed to persist quota");
        }
    }

    fn persist(&mut self, app_id: &str) {
        let result = match self.sessions.get(app_id) {
            Some(entry) => self.store.persist_entry(entry),
            None => self.store.delete_entry(app_id),
        };
        if let Err(e) = result {
            tracing::warn!(%app_id, error = %e, "failed to persist app record");
        }
    }

    // ── Host configuration surface ──────────────────────────────────

    /// Put an app under admission control.
    pub fn allow_app(&mut self, app_id: &str) {
        self.monitored.insert(app_id.to_string());
        if let Err(e) = self.store.allow_app(app_id) {
            tracing::warn!(error = %e, "failed to persist allowlist add");
        }
    }

    /// Remove an app from admission control, ending any session it has.
    pub fn disallow_app(&mut self, app_id: &str) {
        self.monitored.remove(app_id);
        if let Err(e) = self.store.disallow_app(app_id) {
            tracing::warn!(error = %e, "failed to persist allowlist remove");
        }
        if self.sessions.state_of(app_id) != AppState::Idle {
            self.sessions.reset_to_idle(app_id);
            self.timers.cancel(&TimerKey::QuickTaskExpiry {
                app_id: app_id.to_string(),
            });
            self.persist(app_id);
        }
    }

    /// Re-run entry evaluation for an app on the host's explicit request,
    /// skipping quit- and wake-suppression windows. The post-choice hard
    /// lock still applies.
    pub fn force_entry(&mut self, app_id: &str, now: DateTime<Utc>) {
        if self.sessions.state_of(app_id) == AppState::PostChoice {
            tracing::debug!(%app_id, "forced entry rejected: post-choice lock");
            return;
        }
        self.evaluate_entry(app_id, now, true);
    }

    /// Change the quota cap at runtime.
    pub fn set_quota_max(&mut self, max: u32, now: DateTime<Utc>) {
        self.quota.set_max(max);
        self.save_quota();
        self.emitter.emit(
            now,
            Command::QuotaUpdated {
                remaining: self.quota.remaining(),
            },
        );
    }

    /// Serializable inspection view, deterministically ordered.
    pub fn snapshot(&self) -> EngineSnapshot {
        let mut apps: Vec<_> = self.sessions.iter().cloned().collect();
        apps.sort_by(|a, b| a.app_id.cmp(&b.app_id));
        let mut monitored: Vec<_> = self.monitored.iter().cloned().collect();
        monitored.sort();
        let mut preserved: Vec<_> = self.preserved.iter().cloned().collect();
        preserved.sort();
        EngineSnapshot {
            apps,
            quota: self.quota.snapshot(),
            monitored,
            preserved,
            surface: self.surface.current().cloned(),
            pending_wake: self.surface.pending().cloned(),
            raw_foreground: self.raw_foreground.clone(),
        }
    }

    pub fn state_of(&self, app_id: &str) -> AppState {
        self.sessions.state_of(app_id)
    }

    pub fn quota_remaining(&self) -> u32 {
        self.quota.remaining()
    }

    pub fn current_session_id(&self) -> Option<Uuid> {
        self.surface.current().map(|s| s.session_id)
    }

    pub fn pending_session_id(&self) -> Option<Uuid> {
        self.surface.pending().map(|p| p.session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CollectingSink;

    fn service() -> (EngineService, CollectingSink, DateTime<Utc>) {
        let now = Utc::now();
        let sink = CollectingSink::new();
        let store = Store::open_memory().unwrap();
        let mut svc = EngineService::new(
            EngineConfig::default(),
            store,
            Box::new(sink.clone()),
            now,
        );
        svc.allow_app("com.example.feed");
        (svc, sink, now)
    }

    fn fg(app: &str, at: DateTime<Utc>) -> EngineEvent {
        EngineEvent::ForegroundChanged {
            app_id: app.to_string(),
            at,
        }
    }

    #[test]
    fn effective_foreground_shadows_overlay() {
        let (mut svc, _sink, now) = service();
        svc.handle_event(fg("com.example.feed", now), now);
        assert_eq!(
            svc.effective_foreground().as_deref(),
            Some("com.example.feed")
        );

        // Overlay in front with a current session: the underlying app is
        // the effective foreground.
        let session_id = svc.pending_session_id().unwrap();
        let instance_id = Uuid::new_v4();
        svc.handle_event(
            EngineEvent::SurfaceLifecycle {
                kind: SurfaceLifecycleKind::Registered,
                instance_id,
                session_id,
            },
            now,
        );
        svc.handle_event(fg("app.pausegate.overlay", now), now);
        assert_eq!(
            svc.effective_foreground().as_deref(),
            Some("com.example.feed")
        );
    }

    #[test]
    fn unmonitored_entry_is_ignored() {
        let (mut svc, sink, now) = service();
        svc.handle_event(fg("com.other.app", now), now);
        assert!(sink.is_empty());
        assert_eq!(svc.state_of("com.other.app"), AppState::Idle);
    }

    #[test]
    fn entry_opens_offer_and_takes_admission_lock() {
        let (mut svc, sink, now) = service();
        svc.handle_event(fg("com.example.feed", now), now);
        assert_eq!(svc.state_of("com.example.feed"), AppState::Decision);
        assert_eq!(
            sink.commands(),
            vec![Command::ShowQuickTaskOffer {
                app_id: "com.example.feed".to_string()
            }]
        );
        assert!(svc.pending_session_id().is_some());
    }

    #[test]
    fn deferred_decision_retries_once() {
        let (mut svc, sink, now) = service();
        svc.handle_event(EngineEvent::PresentationReady { ready: false }, now);
        svc.handle_event(fg("com.example.feed", now), now);
        assert!(sink.is_empty());
        assert_eq!(svc.state_of("com.example.feed"), AppState::Idle);

        // Still not ready at the retry: the decision is dropped for good.
        let retry_at = now + Duration::milliseconds(500);
        svc.advance(retry_at);
        assert!(sink.is_empty());
        assert!(svc.next_deadline().is_none());

        // Once ready, a fresh entry works.
        svc.handle_event(EngineEvent::PresentationReady { ready: true }, retry_at);
        svc.handle_event(fg("com.example.feed", retry_at), retry_at);
        assert_eq!(sink.commands().len(), 1);
    }

    #[test]
    fn deferred_decision_executes_when_ready_in_time() {
        let (mut svc, sink, now) = service();
        svc.handle_event(EngineEvent::PresentationReady { ready: false }, now);
        svc.handle_event(fg("com.example.feed", now), now);
        assert!(sink.is_empty());

        svc.handle_event(
            EngineEvent::PresentationReady { ready: true },
            now + Duration::milliseconds(100),
        );
        svc.advance(now + Duration::milliseconds(500));
        assert_eq!(
            sink.commands(),
            vec![Command::ShowQuickTaskOffer {
                app_id: "com.example.feed".to_string()
            }]
        );
    }

    #[test]
    fn disallow_ends_running_session() {
        let (mut svc, _sink, now) = service();
        svc.handle_event(fg("com.example.feed", now), now);
        svc.handle_event(
            EngineEvent::UserIntent {
                kind: UserIntentKind::AcceptQuickTask,
                app_id: "com.example.feed".to_string(),
                session_id: None,
            },
            now,
        );
        assert_eq!(svc.state_of("com.example.feed"), AppState::Active);

        svc.disallow_app("com.example.feed");
        assert_eq!(svc.state_of("com.example.feed"), AppState::Idle);
        // The expiry timer went away with the session (only the
        // finish-verify watchdog from the close may remain).
        let expiry = svc.timers.is_pending(&TimerKey::QuickTaskExpiry {
            app_id: "com.example.feed".to_string(),
        });
        assert!(!expiry);
    }

    #[test]
    fn exemption_suppresses_entry() {
        let (mut svc, sink, now) = service();
        svc.handle_event(
            EngineEvent::ExemptionGranted {
                app_id: "com.example.feed".to_string(),
                until: now + Duration::minutes(10),
            },
            now,
        );
        svc.handle_event(fg("com.example.feed", now), now);
        assert!(sink.is_empty());
        assert_eq!(svc.state_of("com.example.feed"), AppState::Idle);

        // Expired exemptions are pruned lazily and stop suppressing.
        let later = now + Duration::minutes(11);
        svc.handle_event(fg("com.example.feed", later), later);
        assert_eq!(sink.commands().len(), 1);
    }
}
