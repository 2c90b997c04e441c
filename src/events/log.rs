//! # LogWriter: bus handler that traces deliveries
//!
//! A minimal handler that writes every delivered [`Event`] to `tracing`.
//! Use it for debugging or demos (feature `logging`).
//!
//! ## Example output
//! ```text
//! INFO [state-changed] seq=12 paths=["user", "settings.theme"]
//! WARN [sync-conflict] seq=13 path="user.name" kept=B discarded=A
//! WARN [status-changed] seq=14 from=Healthy to=DegradedPerformance attempts=0
//! INFO [recovery-started] seq=15 attempt=1 failing=["event-bus"]
//! INFO [recovery-finished] seq=16 attempt=1 strategy=Some("reset-event-bus")
//! INFO [custom] seq=17 name="motd:updated" payload={"text":"hi"}
//! ```

use super::event::{BridgeEvent, Event};
use super::handler::{BoxHandlerFuture, Delivery, Handler};

/// Tracing handler for bus deliveries.
#[derive(Default)]
pub struct LogWriter;

impl LogWriter {
    /// Construct a new [`LogWriter`].
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn write(e: &Event) {
        match &e.payload {
            BridgeEvent::StateChanged(p) => {
                tracing::info!(seq = e.seq, paths = ?p.paths, "[state-changed]");
            }
            BridgeEvent::SyncConflict(p) => {
                tracing::warn!(
                    seq = e.seq,
                    path = %p.path,
                    kept = ?p.kept,
                    discarded = ?p.discarded,
                    "[sync-conflict]"
                );
            }
            BridgeEvent::StatusChanged(p) => {
                tracing::warn!(
                    seq = e.seq,
                    from = ?p.from,
                    to = ?p.to,
                    attempts = p.recovery_attempts,
                    message = %p.message,
                    "[status-changed]"
                );
            }
            BridgeEvent::RecoveryStarted(p) => {
                tracing::info!(seq = e.seq, attempt = p.attempt, failing = ?p.failing_checks, "[recovery-started]");
            }
            BridgeEvent::RecoveryFinished(p) => {
                tracing::info!(seq = e.seq, attempt = p.attempt, strategy = ?p.strategy, "[recovery-finished]");
            }
            BridgeEvent::Custom { name, payload } => {
                tracing::info!(seq = e.seq, name = %name, payload = %payload, "[custom]");
            }
        }
    }
}

impl Handler for LogWriter {
    fn name(&self) -> &str {
        "LogWriter"
    }

    fn handle(&self, delivery: Delivery) -> BoxHandlerFuture {
        for e in delivery.events() {
            Self::write(e);
        }
        Box::pin(async { Ok(()) })
    }
}
