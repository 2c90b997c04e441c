//! Bridge core: composition and lifecycle.
//!
//! The public API from this module is [`BridgeCoordinator`], which builds the
//! components for a pair of state trees, and [`BridgeHandle`], the single
//! surface a host talks to.
//!
//! Internal modules:
//! - [`coordinator`]: connect / disconnect / reconnect, health wiring;
//! - [`handle`]: the host-facing facade with the inactive guard;
//! - [`diagnostics`]: serializable snapshot of every component.

mod coordinator;
mod diagnostics;
mod handle;

pub use coordinator::BridgeCoordinator;
pub use diagnostics::{ComponentDiagnostics, Diagnostics, HealthDiagnostics};
pub use handle::BridgeHandle;
