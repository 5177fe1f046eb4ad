//! Tokio wrapper realizing the serialized execution context.
//!
//! One spawned task owns the [`EngineService`]. Inbound events arrive on an
//! unbounded channel; between events the task sleeps until the engine's
//! earliest timer deadline and then drains due timers. Nothing else ever
//! touches the service, so no two decisions are in flight concurrently.

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::events::EngineEvent;
use crate::service::EngineService;

/// Cloneable sender for feeding events into the engine loop.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EngineHandle {
    /// Enqueue an event. Returns false if the engine loop has exited.
    pub fn send(&self, event: EngineEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Handle to the running engine loop.
/// - dropping `shutdown_tx` (via [`shutdown_and_join`]) stops the loop
/// - `join()` waits for it to finish
///
/// [`shutdown_and_join`]: EngineRuntime::shutdown_and_join
pub struct EngineRuntime {
    handle: EngineHandle,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl EngineRuntime {
    /// Spawn the single-writer loop around a restored service.
    pub fn spawn(mut service: EngineService) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<EngineEvent>();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            loop {
                let deadline = service.next_deadline();
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    event = rx.recv() => {
                        match event {
                            Some(event) => {
                                let now = Utc::now();
                                service.handle_event(event, now);
                                service.advance(now);
                            }
                            // All handles dropped.
                            None => break,
                        }
                    }
                    _ = sleep_until(deadline) => {
                        service.advance(Utc::now());
                    }
                }
            }
            tracing::info!("engine loop stopped");
        });

        Self {
            handle: EngineHandle { tx },
            shutdown_tx,
            join,
        }
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Request shutdown and wait for the loop to drain.
    pub async fn shutdown_and_join(self) {
        // ignore send error: the loop may already have exited
        let _ = self.shutdown_tx.send(true);
        let _ = self.join.await;
    }
}

/// Sleep until a wall-clock deadline, or forever when there is none.
async fn sleep_until(deadline: Option<DateTime<Utc>>) {
    match deadline {
        Some(at) => {
            let wait = (at - Utc::now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);
            tokio::time::sleep(wait).await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{CollectingSink, Command};
    use crate::storage::{EngineConfig, Store};

    #[tokio::test]
    async fn events_flow_through_the_loop() {
        let sink = CollectingSink::new();
        let store = Store::open_memory().unwrap();
        let now = Utc::now();
        let mut service =
            EngineService::new(EngineConfig::default(), store, Box::new(sink.clone()), now);
        service.allow_app("com.example.feed");
        service.restore(now);

        let runtime = EngineRuntime::spawn(service);
        let handle = runtime.handle();
        assert!(handle.send(EngineEvent::ForegroundChanged {
            app_id: "com.example.feed".to_string(),
            at: Utc::now(),
        }));

        // Give the loop a moment to process, then stop it.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        runtime.shutdown_and_join().await;

        assert_eq!(
            sink.commands(),
            vec![Command::ShowQuickTaskOffer {
                app_id: "com.example.feed".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn send_fails_after_shutdown() {
        let sink = CollectingSink::new();
        let store = Store::open_memory().unwrap();
        let now = Utc::now();
        let service =
            EngineService::new(EngineConfig::default(), store, Box::new(sink), now);
        let runtime = EngineRuntime::spawn(service);
        let handle = runtime.handle();
        runtime.shutdown_and_join().await;
        assert!(!handle.send(EngineEvent::PresentationReady { ready: true }));
    }
}
