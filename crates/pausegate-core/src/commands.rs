//! Outbound commands for the presentation layer.
//!
//! The engine never renders anything itself. Decisions and transitions are
//! translated into [`Command`] messages, wrapped in a [`CommandEnvelope`]
//! carrying a nonce and timestamp, and handed to a [`CommandSink`]. Delivery
//! is fire-and-forget: a duplicate delivery is detectable downstream via the
//! nonce and safely ignorable.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::AppId;

/// A command for the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Show the quick-task bypass offer for an app.
    ShowQuickTaskOffer { app_id: AppId },
    /// A quick task was granted; the overlay may close and show a countdown.
    QuickTaskActivated {
        app_id: AppId,
        expires_at: DateTime<Utc>,
    },
    /// The quick task expired with the app still in use; show the
    /// continue-or-quit screen.
    ShowPostChoice { app_id: AppId },
    /// Show the full reflective intervention flow. `resume` restores a
    /// previously preserved flow instead of restarting it.
    ShowIntervention { app_id: AppId, resume: bool },
    /// Tear down the overlay surface for the given session.
    FinishSurface { session_id: Uuid },
    /// An entry was denied solely because the quota is spent.
    QuotaExhausted { app_id: AppId },
    /// The remaining quick-task quota changed.
    QuotaUpdated { remaining: u32 },
}

/// A command stamped for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub nonce: Uuid,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub command: Command,
}

/// Delivery target for command envelopes.
///
/// Implementations must not block: the sink is called from the single-writer
/// engine context.
pub trait CommandSink: Send {
    fn deliver(&mut self, envelope: CommandEnvelope);
}

/// Stamps commands into envelopes and hands them to the sink.
pub struct CommandEmitter {
    sink: Box<dyn CommandSink>,
}

impl CommandEmitter {
    pub fn new(sink: Box<dyn CommandSink>) -> Self {
        Self { sink }
    }

    /// Stamp and deliver a command. Returns the envelope nonce.
    pub fn emit(&mut self, now: DateTime<Utc>, command: Command) -> Uuid {
        let nonce = Uuid::new_v4();
        tracing::debug!(?command, %nonce, "emit");
        self.sink.deliver(CommandEnvelope {
            nonce,
            at: now,
            command,
        });
        nonce
    }
}

/// A sink that buffers envelopes in memory.
///
/// Used by the replay harness (drain-and-print per step) and by tests.
#[derive(Clone, Default)]
pub struct CollectingSink {
    buffer: Arc<Mutex<Vec<CommandEnvelope>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything delivered so far.
    pub fn drain(&self) -> Vec<CommandEnvelope> {
        let mut buf = self.buffer.lock().expect("sink poisoned");
        std::mem::take(&mut *buf)
    }

    /// Copy of the delivered commands, envelopes stripped.
    pub fn commands(&self) -> Vec<Command> {
        let buf = self.buffer.lock().expect("sink poisoned");
        buf.iter().map(|e| e.command.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().expect("sink poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CommandSink for CollectingSink {
    fn deliver(&mut self, envelope: CommandEnvelope) {
        self.buffer.lock().expect("sink poisoned").push(envelope);
    }
}
