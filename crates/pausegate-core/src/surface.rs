//! Overlay-surface session ownership.
//!
//! At most one surface session is current at any time, and this manager is
//! its exclusive owner. The life of a session:
//!
//! ```text
//! begin_wake (command emitted)        -> pending
//! Registered echo from presentation   -> current (boot watchdog armed)
//! Mounted                             -> current, mounted
//! request_close: logical close        -> closing set (physical close +
//!                                        finish-verify watchdog follow)
//! Destroyed                           -> gone
//! ```
//!
//! Watchdog deadlines themselves live in the engine's timer map; this module
//! keeps the bookkeeping the watchdog handlers consult: which session is
//! current, whether it mounted, which session ids are mid-close, and since
//! when the foreground has disagreed with the session's underlying app.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::AppId;

/// Why the overlay surface was woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeReason {
    QuickTaskOffer,
    PostChoice,
    Intervention,
}

/// One overlay-surface presentation instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurfaceSession {
    pub session_id: Uuid,
    pub instance_id: Uuid,
    /// The app the surface is shown over.
    pub app_id: AppId,
    pub wake_reason: WakeReason,
    pub created_at: DateTime<Utc>,
    /// The presentation layer confirmed the surface is visible.
    pub mounted: bool,
}

/// A surface command was emitted but the presentation layer has not yet
/// echoed `Registered` for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWake {
    pub session_id: Uuid,
    pub app_id: AppId,
    pub wake_reason: WakeReason,
    pub requested_at: DateTime<Utc>,
}

/// Outcome of a `Registered` echo.
#[derive(Debug, PartialEq)]
pub enum RegisterOutcome {
    /// The pending wake was promoted to the current session.
    Promoted,
    /// Same session and instance already current; duplicate signal.
    Duplicate,
    /// No pending wake matches; the session belongs to a superseded wake.
    Stale,
}

/// Outcome of starting a close.
#[derive(Debug, PartialEq)]
pub enum CloseBegin {
    /// Logical close performed; `app_id` is the session's underlying app.
    Accepted { app_id: AppId },
    /// A close for this session id is already in flight.
    AlreadyClosing,
    /// Not the current session, not pending, not closing.
    Unknown,
}

/// Owner of the single overlay-surface session.
#[derive(Debug, Default)]
pub struct SurfaceLifecycleManager {
    current: Option<SurfaceSession>,
    pending: Option<PendingWake>,
    closing: HashSet<Uuid>,
    mismatch_since: Option<DateTime<Utc>>,
}

impl SurfaceLifecycleManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&SurfaceSession> {
        self.current.as_ref()
    }

    pub fn pending(&self) -> Option<&PendingWake> {
        self.pending.as_ref()
    }

    /// A surface is up or in flight. Pending wakes count: a second decision
    /// while the first surface boots would double-present.
    pub fn is_active(&self) -> bool {
        self.current.is_some() || self.pending.is_some()
    }

    /// Mint a session for a surface-opening command. A stale pending wake is
    /// replaced; its session id is returned so the caller can log it.
    pub fn begin_wake(
        &mut self,
        app_id: &str,
        wake_reason: WakeReason,
        now: DateTime<Utc>,
    ) -> (Uuid, Option<Uuid>) {
        let session_id = Uuid::new_v4();
        let replaced = self
            .pending
            .replace(PendingWake {
                session_id,
                app_id: app_id.to_string(),
                wake_reason,
                requested_at: now,
            })
            .map(|stale| stale.session_id);
        (session_id, replaced)
    }

    /// Handle the presentation layer's `Registered` echo.
    pub fn register(
        &mut self,
        session_id: Uuid,
        instance_id: Uuid,
        now: DateTime<Utc>,
    ) -> RegisterOutcome {
        if let Some(current) = &self.current {
            if current.session_id == session_id && current.instance_id == instance_id {
                return RegisterOutcome::Duplicate;
            }
        }
        match self.pending.take() {
            Some(pending) if pending.session_id == session_id => {
                self.current = Some(SurfaceSession {
                    session_id,
                    instance_id,
                    app_id: pending.app_id,
                    wake_reason: pending.wake_reason,
                    created_at: now,
                    mounted: false,
                });
                self.mismatch_since = None;
                RegisterOutcome::Promoted
            }
            other => {
                self.pending = other;
                RegisterOutcome::Stale
            }
        }
    }

    /// Handle a `Mounted` signal. Only the currently registered instance may
    /// mount; stale signals from superseded sessions report false.
    pub fn notify_mounted(&mut self, instance_id: Uuid) -> bool {
        match &mut self.current {
            Some(session) if session.instance_id == instance_id => {
                session.mounted = true;
                true
            }
            _ => false,
        }
    }

    /// Logical close: end the session record and remember the id as
    /// mid-close. Idempotent per session id.
    pub fn begin_close(&mut self, session_id: Uuid) -> CloseBegin {
        if self.closing.contains(&session_id) {
            return CloseBegin::AlreadyClosing;
        }
        match self.current.take() {
            Some(session) if session.session_id == session_id => {
                self.closing.insert(session_id);
                self.mismatch_since = None;
                return CloseBegin::Accepted {
                    app_id: session.app_id,
                };
            }
            other => self.current = other,
        }
        match self.pending.take() {
            Some(pending) if pending.session_id == session_id => {
                self.closing.insert(session_id);
                return CloseBegin::Accepted {
                    app_id: pending.app_id,
                };
            }
            other => self.pending = other,
        }
        CloseBegin::Unknown
    }

    /// Handle a `Destroyed` signal. Returns the underlying app id when the
    /// signal matched a known session (mid-close or an OS-forced kill of the
    /// current session).
    pub fn confirm_destroyed(&mut self, session_id: Uuid) -> Option<Option<AppId>> {
        if self.closing.remove(&session_id) {
            // Normal teardown after a close request.
            return Some(None);
        }
        match self.current.take() {
            Some(session) if session.session_id == session_id => {
                self.mismatch_since = None;
                Some(Some(session.app_id))
            }
            other => {
                self.current = other;
                None
            }
        }
    }

    /// Finish-verify watchdog path: forget the close no matter what the
    /// presentation layer did.
    pub fn force_clear(&mut self, session_id: Uuid) {
        self.closing.remove(&session_id);
        if let Some(current) = &self.current {
            if current.session_id == session_id {
                self.current = None;
                self.mismatch_since = None;
            }
        }
    }

    pub fn is_closing(&self, session_id: Uuid) -> bool {
        self.closing.contains(&session_id)
    }

    /// Record that the foreground disagrees with the current session's
    /// underlying app. Returns true when the mismatch just started.
    pub fn note_mismatch(&mut self, now: DateTime<Utc>) -> bool {
        if self.mismatch_since.is_some() {
            return false;
        }
        self.mismatch_since = Some(now);
        true
    }

    pub fn clear_mismatch(&mut self) {
        self.mismatch_since = None;
    }

    pub fn mismatch_since(&self) -> Option<DateTime<Utc>> {
        self.mismatch_since
    }

    /// Drop all surface state (restore path).
    pub fn clear(&mut self) {
        self.current = None;
        self.pending = None;
        self.closing.clear();
        self.mismatch_since = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with_current() -> (SurfaceLifecycleManager, Uuid, Uuid) {
        let mut manager = SurfaceLifecycleManager::new();
        let now = Utc::now();
        let (session_id, _) = manager.begin_wake("com.example.a", WakeReason::QuickTaskOffer, now);
        let instance_id = Uuid::new_v4();
        assert_eq!(
            manager.register(session_id, instance_id, now),
            RegisterOutcome::Promoted
        );
        (manager, session_id, instance_id)
    }

    #[test]
    fn wake_register_mount_walk() {
        let (mut manager, session_id, instance_id) = manager_with_current();
        assert!(manager.is_active());
        assert!(!manager.current().unwrap().mounted);

        assert!(manager.notify_mounted(instance_id));
        assert!(manager.current().unwrap().mounted);
        assert_eq!(manager.current().unwrap().session_id, session_id);
    }

    #[test]
    fn stale_mounted_ignored() {
        let (mut manager, _, _) = manager_with_current();
        assert!(!manager.notify_mounted(Uuid::new_v4()));
        assert!(!manager.current().unwrap().mounted);
    }

    #[test]
    fn register_without_pending_is_stale() {
        let mut manager = SurfaceLifecycleManager::new();
        assert_eq!(
            manager.register(Uuid::new_v4(), Uuid::new_v4(), Utc::now()),
            RegisterOutcome::Stale
        );
        assert!(!manager.is_active());
    }

    #[test]
    fn duplicate_register_detected() {
        let (mut manager, session_id, instance_id) = manager_with_current();
        assert_eq!(
            manager.register(session_id, instance_id, Utc::now()),
            RegisterOutcome::Duplicate
        );
    }

    #[test]
    fn new_wake_replaces_stale_pending() {
        let mut manager = SurfaceLifecycleManager::new();
        let now = Utc::now();
        let (first, replaced) = manager.begin_wake("a", WakeReason::QuickTaskOffer, now);
        assert_eq!(replaced, None);
        let (_, replaced) = manager.begin_wake("b", WakeReason::Intervention, now);
        assert_eq!(replaced, Some(first));
        // The superseded session can no longer register.
        assert_eq!(
            manager.register(first, Uuid::new_v4(), now),
            RegisterOutcome::Stale
        );
    }

    #[test]
    fn close_is_idempotent_per_session() {
        let (mut manager, session_id, _) = manager_with_current();
        assert_eq!(
            manager.begin_close(session_id),
            CloseBegin::Accepted {
                app_id: "com.example.a".to_string()
            }
        );
        assert_eq!(manager.begin_close(session_id), CloseBegin::AlreadyClosing);
        assert!(manager.current().is_none());
        assert!(manager.is_closing(session_id));

        assert_eq!(manager.confirm_destroyed(session_id), Some(None));
        assert!(!manager.is_closing(session_id));
    }

    #[test]
    fn close_of_unknown_session_rejected() {
        let (mut manager, _, _) = manager_with_current();
        assert_eq!(manager.begin_close(Uuid::new_v4()), CloseBegin::Unknown);
        assert!(manager.current().is_some());
    }

    #[test]
    fn os_forced_destroy_without_close_request() {
        let (mut manager, session_id, _) = manager_with_current();
        // No begin_close: the OS killed the surface outright.
        assert_eq!(
            manager.confirm_destroyed(session_id),
            Some(Some("com.example.a".to_string()))
        );
        assert!(manager.current().is_none());
        // Unknown ids are reported as such.
        assert_eq!(manager.confirm_destroyed(session_id), None);
    }

    #[test]
    fn mismatch_tracking_resets_on_close() {
        let (mut manager, session_id, _) = manager_with_current();
        let now = Utc::now();
        assert!(manager.note_mismatch(now));
        assert!(!manager.note_mismatch(now));
        assert_eq!(manager.mismatch_since(), Some(now));
        manager.begin_close(session_id);
        assert_eq!(manager.mismatch_since(), None);
    }
}
