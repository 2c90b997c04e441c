//! # BridgeCoordinator: wires the bus, the state manager and the supervisor.
//!
//! [`BridgeCoordinator::connect`] builds one instance of every component for a
//! pair of trees and hands out a single [`BridgeHandle`].
//!
//! ```text
//! connect(a, b)
//!   ├─► EventBus::new(cfg.bus)
//!   ├─► DualStateManager::new(cfg.sync, bus) ─► connect(a, b)
//!   ├─► HealthSupervisor::new(cfg.health, bus)
//!   │     checks:     event-bus (CommunicationError), state-manager (SyncError)
//!   │     strategies: reset-event-bus ─► reset-state-manager ─► full-reconnect
//!   └─► start_health_checks() when cfg.health.autostart
//!
//! disconnect()
//!   stop timer ─► close bus ─► disconnect manager ─► handle inactive
//! ```
//!
//! A strategy succeeds only when the whole bridge verifies healthy after its
//! action, so a cheap reset that does not address the failure falls through to
//! the next strategy.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::handle::BridgeHandle;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, ErrorCode};
use crate::events::EventBus;
use crate::health::{BridgeState, HealthCheck, HealthSupervisor, StrategyFn};
use crate::result::BridgeResult;
use crate::state::{DualStateManager, StateTree};

const COMPONENT: &str = "bridge-coordinator";

struct Session {
    handle: BridgeHandle,
    side_a: Weak<dyn StateTree>,
    side_b: Weak<dyn StateTree>,
}

/// Owns at most one live bridge between two state trees.
pub struct BridgeCoordinator {
    cfg: BridgeConfig,
    session: Mutex<Option<Session>>,
}

impl BridgeCoordinator {
    pub fn new(cfg: BridgeConfig) -> Self {
        Self {
            cfg,
            session: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.cfg
    }

    pub fn is_connected(&self) -> bool {
        self.session.lock().is_some()
    }

    /// Connects the two trees and returns the bridge handle.
    ///
    /// While connected, further calls return the existing handle and ignore
    /// their arguments. Must be called inside a tokio runtime.
    pub fn connect(
        &self,
        side_a: &Arc<dyn StateTree>,
        side_b: &Arc<dyn StateTree>,
    ) -> BridgeResult<BridgeHandle> {
        let mut session = self.session.lock();
        if let Some(existing) = session.as_ref() {
            tracing::debug!("bridge already connected, returning existing handle");
            return Ok(existing.handle.clone());
        }

        let handle = self.build(side_a, side_b).map_err(|e| {
            BridgeError::new(
                ErrorCode::InitializationFailed,
                COMPONENT,
                "connect",
                format!("bridge setup failed: {}", e.message),
            )
            .with_cause(e)
        })?;

        *session = Some(Session {
            handle: handle.clone(),
            side_a: Arc::downgrade(side_a),
            side_b: Arc::downgrade(side_b),
        });
        tracing::info!(side_a = side_a.label(), side_b = side_b.label(), "bridge connected");
        Ok(handle)
    }

    fn build(&self, side_a: &Arc<dyn StateTree>, side_b: &Arc<dyn StateTree>) -> BridgeResult<BridgeHandle> {
        let bus = EventBus::new(self.cfg.bus.clone())?;
        let manager = DualStateManager::new(self.cfg.sync.clone(), Some(bus.clone()))?;
        if let Err(e) = manager.connect(side_a, side_b) {
            manager.disconnect();
            bus.close();
            return Err(e);
        }
        let health = HealthSupervisor::new(&self.cfg.health, Some(bus.clone()))?;

        register_checks(&health, &bus, &manager);
        register_strategies(
            &health,
            &bus,
            &manager,
            Arc::downgrade(side_a),
            Arc::downgrade(side_b),
        );
        if self.cfg.health.autostart {
            health.start_health_checks();
        }
        Ok(BridgeHandle::new(bus, manager, health))
    }

    /// Tears the bridge down; every outstanding handle becomes inactive.
    ///
    /// Returns `false` when nothing was connected.
    pub fn disconnect(&self) -> bool {
        let Some(session) = self.session.lock().take() else {
            return false;
        };
        let handle = session.handle;
        handle.deactivate();
        handle.health().stop_health_checks();
        handle.bus().close();
        handle.manager().disconnect();
        tracing::info!("bridge disconnected");
        true
    }

    /// Host intervention: re-attaches the original trees, resets the bus and
    /// forces the status back to `Healthy`.
    ///
    /// The existing handle stays valid and is returned. This is the way out
    /// of `CriticalFailure`.
    pub fn reconnect(&self) -> BridgeResult<BridgeHandle> {
        let session = self.session.lock();
        let Some(session) = session.as_ref() else {
            return Err(BridgeError::new(
                ErrorCode::InvalidState,
                COMPONENT,
                "reconnect",
                "bridge is not connected",
            ));
        };
        let (Some(a), Some(b)) = (session.side_a.upgrade(), session.side_b.upgrade()) else {
            return Err(BridgeError::new(
                ErrorCode::InvalidState,
                COMPONENT,
                "reconnect",
                "a connected state tree was dropped",
            ));
        };

        let handle = &session.handle;
        handle.bus().reset();
        handle.manager().connect(&a, &b)?;
        handle.health().reset_status();
        if self.cfg.health.autostart {
            handle.health().start_health_checks();
        }
        tracing::info!("bridge reconnected");
        Ok(handle.clone())
    }
}

impl Drop for BridgeCoordinator {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn register_checks(health: &HealthSupervisor, bus: &EventBus, manager: &DualStateManager) {
    let b = bus.clone();
    health.register_check(HealthCheck::new(
        "event-bus",
        BridgeState::CommunicationError,
        move || b.is_healthy(),
    ));
    let m = manager.clone();
    health.register_check(HealthCheck::new(
        "state-manager",
        BridgeState::SyncError,
        move || m.is_healthy(),
    ));
}

fn register_strategies(
    health: &HealthSupervisor,
    bus: &EventBus,
    manager: &DualStateManager,
    side_a: Weak<dyn StateTree>,
    side_b: Weak<dyn StateTree>,
) {
    let (b, m) = (bus.clone(), manager.clone());
    health.register_strategy(StrategyFn::arc("reset-event-bus", move || {
        let (bus, manager) = (b.clone(), m.clone());
        async move {
            bus.reset();
            verify(&bus, &manager, "reset-event-bus")
        }
    }));

    let (b, m) = (bus.clone(), manager.clone());
    health.register_strategy(StrategyFn::arc("reset-state-manager", move || {
        let (bus, manager) = (b.clone(), m.clone());
        async move {
            manager.reset()?;
            verify(&bus, &manager, "reset-state-manager")
        }
    }));

    let (b, m) = (bus.clone(), manager.clone());
    health.register_strategy(StrategyFn::arc("full-reconnect", move || {
        let (bus, manager) = (b.clone(), m.clone());
        let sides = (side_a.upgrade(), side_b.upgrade());
        async move {
            let (Some(tree_a), Some(tree_b)) = sides else {
                return Err(BridgeError::new(
                    ErrorCode::InvalidState,
                    COMPONENT,
                    "full-reconnect",
                    "a connected state tree was dropped",
                ));
            };
            bus.reset();
            manager.connect(&tree_a, &tree_b)?;
            verify(&bus, &manager, "full-reconnect")
        }
    }));
}

fn verify(bus: &EventBus, manager: &DualStateManager, operation: &'static str) -> BridgeResult<()> {
    match (bus.is_healthy(), manager.is_healthy()) {
        (true, true) => Ok(()),
        (bus_ok, manager_ok) => Err(BridgeError::new(
            ErrorCode::Internal,
            COMPONENT,
            operation,
            format!("bridge still unhealthy (event-bus: {bus_ok}, state-manager: {manager_ok})"),
        )
        .recoverable(true)),
    }
}
