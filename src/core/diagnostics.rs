use std::collections::BTreeMap;

use serde::Serialize;

use crate::events::BusDiagnostics;
use crate::health::BridgeStatus;
use crate::state::ManagerDiagnostics;

/// Per-component counters in the shape hosts render.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ComponentDiagnostics {
    pub listener_count: usize,
    pub watcher_count: usize,
    pub subscriber_count: usize,
    pub paths_watched: usize,
}

/// Health supervisor registrations and timer state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HealthDiagnostics {
    pub checks: usize,
    pub strategies: usize,
    pub running: bool,
    pub interval_ms: u64,
}

/// Point-in-time snapshot returned by [`BridgeHandle::get_diagnostics`](crate::BridgeHandle::get_diagnostics).
#[derive(Clone, Debug, Serialize)]
pub struct Diagnostics {
    /// Keyed by component name (`event-bus`, `state-manager`).
    pub components: BTreeMap<String, ComponentDiagnostics>,
    pub status: BridgeStatus,
    pub health: HealthDiagnostics,
    pub bus: BusDiagnostics,
    pub state: ManagerDiagnostics,
}

impl Diagnostics {
    pub(crate) fn collect(
        status: BridgeStatus,
        health: HealthDiagnostics,
        bus: BusDiagnostics,
        state: ManagerDiagnostics,
    ) -> Self {
        let mut components = BTreeMap::new();
        components.insert(
            "event-bus".to_string(),
            ComponentDiagnostics {
                listener_count: bus.listener_count,
                ..ComponentDiagnostics::default()
            },
        );
        components.insert(
            "state-manager".to_string(),
            ComponentDiagnostics {
                watcher_count: state.watcher_count,
                subscriber_count: state.subscriber_count,
                paths_watched: state.paths_watched.len(),
                ..ComponentDiagnostics::default()
            },
        );
        Self {
            components,
            status,
            health,
            bus,
            state,
        }
    }

    pub fn component(&self, name: &str) -> Option<&ComponentDiagnostics> {
        self.components.get(name)
    }
}
