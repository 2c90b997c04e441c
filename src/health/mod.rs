//! Health supervision and self-healing.
//!
//! ## Contents
//! - [`BridgeState`], [`BridgeStatus`]: the status state machine
//! - [`HealthCheck`], [`RecoveryStrategy`], [`StrategyFn`]: registrations
//! - [`HealthSupervisor`]: timer, checks, ordered recovery

mod check;
mod status;
mod supervisor;

pub use check::{CheckFn, HealthCheck, RecoveryStrategy, StrategyFn, StrategyRef};
pub use status::{BridgeState, BridgeStatus};
pub use supervisor::HealthSupervisor;
