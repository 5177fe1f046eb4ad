//! # Pausegate Core Library
//!
//! This library is the background admission-control engine behind the
//! Pausegate behavioral-intervention product. On every foreground-app
//! change it decides whether to show a lightweight quick-task bypass offer,
//! a full reflective-pause flow, or nothing, and it enforces time-boxed
//! exemptions and a rolling quick-task quota. The visual screens are an
//! external collaborator: they consume [`Command`]s and feed back
//! [`EngineEvent`]s.
//!
//! ## Architecture
//!
//! - **Decision gate**: a pure evaluator from a consistent state snapshot
//!   to one admission decision with a machine-readable reason
//! - **Per-app state machine**: Idle/Decision/Active/PostChoice/
//!   InterventionActive with validated edges
//! - **Single-writer service**: every mutation runs on one serialized
//!   context; timers and watchdogs post back into it
//! - **Surface lifecycle**: exclusive ownership of the one overlay-surface
//!   session, with boot/finish watchdogs and stale-session recovery
//! - **Storage**: SQLite crash-recovery records and TOML configuration
//!
//! ## Key Components
//!
//! - [`EngineService`]: the engine itself, driven by events and timers
//! - [`EngineRuntime`]: tokio single-writer loop around the service
//! - [`AccessEntryEvaluator`]: the pure decision gate
//! - [`Store`] / [`EngineConfig`]: persistence and configuration

pub mod commands;
pub mod error;
pub mod events;
pub mod gate;
pub mod quota;
pub mod runtime;
pub mod service;
pub mod session;
pub mod storage;
pub mod suppression;
pub mod surface;
pub mod timers;

pub use commands::{Command, CommandEnvelope, CommandSink, CollectingSink};
pub use error::{ConfigError, CoreError, Result, StoreError};
pub use events::{AppId, EngineEvent, SurfaceLifecycleKind, UserIntentKind};
pub use gate::{AccessEntryEvaluator, Decision, DecisionReason, EntryAction, EntrySnapshot};
pub use quota::{QuotaLedger, QuotaState};
pub use runtime::{EngineHandle, EngineRuntime};
pub use service::{EngineService, EngineSnapshot};
pub use session::{AppEntry, AppState, SessionTable, TransitionError};
pub use storage::{EngineConfig, Store};
pub use suppression::{SuppressionKind, SuppressionWindows};
pub use surface::{SurfaceLifecycleManager, SurfaceSession, WakeReason};
pub use timers::{TimerKey, TimerSupervisor};
