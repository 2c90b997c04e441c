//! # Bridge status and its state machine.
//!
//! ```text
//!                ┌──────────────► Healthy ◄───────────────┐
//!                │                   │                    │
//!                │                   ▼                    │
//!                │         DegradedPerformance            │
//!                │          │        │        │           │
//!                │          ▼        │        ▼           │
//!            SyncError ◄────┼──► CommunicationError ──────┘
//!                │          │        │
//!                └──────────┼────────┘
//!                           ▼
//!                    CriticalFailure (terminal until reset)
//! ```

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Health state of the bridge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BridgeState {
    Healthy,
    DegradedPerformance,
    SyncError,
    CommunicationError,
    CriticalFailure,
}

impl BridgeState {
    /// Ordering by badness: `Healthy` is 0, `CriticalFailure` is 3.
    pub fn severity(self) -> u8 {
        match self {
            BridgeState::Healthy => 0,
            BridgeState::DegradedPerformance => 1,
            BridgeState::SyncError | BridgeState::CommunicationError => 2,
            BridgeState::CriticalFailure => 3,
        }
    }

    /// Whether the supervisor may move from `self` to `next` on its own.
    pub fn can_transition_to(self, next: BridgeState) -> bool {
        use BridgeState::*;
        matches!(
            (self, next),
            (Healthy, DegradedPerformance)
                | (DegradedPerformance, Healthy)
                | (DegradedPerformance, SyncError)
                | (DegradedPerformance, CommunicationError)
                | (DegradedPerformance, CriticalFailure)
                | (SyncError, Healthy)
                | (SyncError, CommunicationError)
                | (SyncError, CriticalFailure)
                | (CommunicationError, Healthy)
                | (CommunicationError, SyncError)
                | (CommunicationError, CriticalFailure)
        )
    }

    pub fn as_label(self) -> &'static str {
        match self {
            BridgeState::Healthy => "healthy",
            BridgeState::DegradedPerformance => "degraded_performance",
            BridgeState::SyncError => "sync_error",
            BridgeState::CommunicationError => "communication_error",
            BridgeState::CriticalFailure => "critical_failure",
        }
    }
}

/// Current status as reported by [`HealthSupervisor::get_status`](crate::HealthSupervisor::get_status).
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BridgeStatus {
    pub state: BridgeState,
    pub message: String,
    /// Names of the checks that failed on the last tick.
    pub affected_components: Vec<String>,
    /// Recovery cycles since the status last was `Healthy`.
    pub recovery_attempts: u32,
    pub timestamp: SystemTime,
}

impl BridgeStatus {
    pub fn healthy() -> Self {
        Self {
            state: BridgeState::Healthy,
            message: "all checks passing".into(),
            affected_components: Vec::new(),
            recovery_attempts: 0,
            timestamp: SystemTime::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.state == BridgeState::Healthy
    }
}

impl Default for BridgeStatus {
    fn default() -> Self {
        Self::healthy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use BridgeState::*;

    #[test]
    fn test_critical_failure_is_terminal() {
        for next in [Healthy, DegradedPerformance, SyncError, CommunicationError] {
            assert!(!CriticalFailure.can_transition_to(next));
        }
    }

    #[test]
    fn test_healthy_only_degrades() {
        assert!(Healthy.can_transition_to(DegradedPerformance));
        assert!(!Healthy.can_transition_to(SyncError));
        assert!(!Healthy.can_transition_to(CriticalFailure));
    }

    #[test]
    fn test_error_states_interchange_and_recover() {
        assert!(SyncError.can_transition_to(CommunicationError));
        assert!(CommunicationError.can_transition_to(SyncError));
        assert!(SyncError.can_transition_to(Healthy));
        assert!(!SyncError.can_transition_to(DegradedPerformance));
        assert!(CriticalFailure.severity() > SyncError.severity());
    }
}
