//! Inbound events consumed by the engine.
//!
//! Every external input -- foreground changes, user intents from the overlay
//! surface, surface lifecycle signals, timer fires -- is expressed as an
//! [`EngineEvent`] and funneled into the single-writer service. Callback
//! threads never touch engine state directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of an application as reported by the platform (package name).
pub type AppId = String;

/// What the user chose on the overlay surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserIntentKind {
    /// Accept the quick-task bypass offer.
    AcceptQuickTask,
    /// Decline the offer and leave the app alone.
    DeclineQuickTask,
    /// Switch from the offer into the full reflective intervention flow.
    SwitchToIntervention,
    /// On the post-choice screen: keep using the app (spends quota).
    PostChoiceContinue,
    /// On the post-choice screen: quit the app.
    PostChoiceQuit,
}

/// Lifecycle signals reported by the presentation layer for its overlay
/// surface instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceLifecycleKind {
    /// The surface instance was created and bound to a session.
    Registered,
    /// The surface finished booting and is visible.
    Mounted,
    /// The surface was torn down.
    Destroyed,
}

/// An inbound event for the engine.
///
/// `ForegroundChanged` carries its own observation timestamp because the
/// platform may deliver it late; everything else is stamped with the wall
/// clock at the moment the single-writer context processes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// The foreground application changed.
    ForegroundChanged { app_id: AppId, at: DateTime<Utc> },

    /// The user made a choice on the overlay surface.
    UserIntent {
        kind: UserIntentKind,
        app_id: AppId,
        /// Session the intent originated from, when the surface knows it.
        /// Intents carrying a session id that is no longer current are
        /// treated as stale and dropped.
        #[serde(default)]
        session_id: Option<Uuid>,
    },

    /// Overlay-surface lifecycle signal.
    SurfaceLifecycle {
        kind: SurfaceLifecycleKind,
        instance_id: Uuid,
        session_id: Uuid,
    },

    /// External re-injection of a quick-task expiry for an app. The engine
    /// schedules its own timers; this exists for hosts that mirror engine
    /// timers into OS alarms and deliver them back.
    TimerFired { app_id: AppId },

    /// An externally-granted time-boxed exemption: take no action for this
    /// app until `until`.
    ExemptionGranted { app_id: AppId, until: DateTime<Utc> },

    /// Externally-driven wake suppression: do not re-decide for this app
    /// before `until`.
    WakeSuppression { app_id: AppId, until: DateTime<Utc> },

    /// The reflective flow marks (or unmarks) an intervention as worth
    /// resuming after a surface teardown. The engine persists the flag but
    /// does not decide when to set it.
    SetInterventionPreserved { app_id: AppId, preserved: bool },

    /// Whether the presentation layer is able to execute surface commands.
    /// While not ready, admission decisions are deferred and retried once.
    PresentationReady { ready: bool },
}
