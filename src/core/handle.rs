//! # BridgeHandle: the single API surface handed to the host.
//!
//! A handle is cheap to clone; all clones refer to the same connected bridge.
//! After [`BridgeCoordinator::disconnect`](crate::BridgeCoordinator::disconnect)
//! every call through a stale handle fails with
//! [`ErrorCode::ComponentInactive`](crate::ErrorCode::ComponentInactive).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;

use super::diagnostics::{Diagnostics, HealthDiagnostics};
use crate::error::BridgeError;
use crate::events::{BridgeEvent, EventBus, HandlerRef, SubscribeOptions, Subscription, SubscriptionId};
use crate::health::{BridgeState, BridgeStatus, HealthSupervisor};
use crate::result::BridgeResult;
use crate::state::{DualStateManager, PathSubscription, Side, StatePath};

const COMPONENT: &str = "bridge";

struct Inner {
    active: AtomicBool,
    bus: EventBus,
    manager: DualStateManager,
    health: HealthSupervisor,
}

/// Handle to a connected bridge.
#[derive(Clone)]
pub struct BridgeHandle {
    inner: Arc<Inner>,
}

impl BridgeHandle {
    pub(crate) fn new(bus: EventBus, manager: DualStateManager, health: HealthSupervisor) -> Self {
        Self {
            inner: Arc::new(Inner {
                active: AtomicBool::new(true),
                bus,
                manager,
                health,
            }),
        }
    }

    pub(crate) fn deactivate(&self) {
        self.inner.active.store(false, Ordering::Release);
    }

    pub(crate) fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub(crate) fn manager(&self) -> &DualStateManager {
        &self.inner.manager
    }

    pub(crate) fn health(&self) -> &HealthSupervisor {
        &self.inner.health
    }

    fn ensure_active(&self, operation: &'static str) -> BridgeResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(BridgeError::inactive(COMPONENT, operation))
        }
    }

    /// `false` once the coordinator disconnected.
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// `true` while active and not in `CriticalFailure`.
    ///
    /// Hosts use it to decide whether the bridge's state can be relied on.
    pub fn is_trusted(&self) -> bool {
        self.is_active() && self.inner.health.get_status().state != BridgeState::CriticalFailure
    }

    // ---- events ----

    pub fn emit(&self, event: BridgeEvent) -> BridgeResult<()> {
        self.ensure_active("emit")?;
        self.inner.bus.emit(event)
    }

    /// Validates an untyped event at the boundary, then emits it.
    pub fn emit_raw(&self, name: &str, payload: Value) -> BridgeResult<()> {
        self.ensure_active("emit_raw")?;
        self.inner.bus.emit(BridgeEvent::parse(name, payload)?)
    }

    pub fn on(
        &self,
        event: impl Into<Arc<str>>,
        handler: HandlerRef,
        opts: SubscribeOptions,
    ) -> BridgeResult<Subscription> {
        self.ensure_active("on")?;
        self.inner.bus.on(event, handler, opts)
    }

    pub fn once(
        &self,
        event: impl Into<Arc<str>>,
        handler: HandlerRef,
        opts: SubscribeOptions,
    ) -> BridgeResult<Subscription> {
        self.ensure_active("once")?;
        self.inner.bus.once(event, handler, opts)
    }

    /// Idempotent; always `false` on an inactive handle.
    pub fn off(&self, id: impl Into<SubscriptionId>) -> bool {
        self.is_active() && self.inner.bus.off(id)
    }

    pub fn clear(&self) -> BridgeResult<()> {
        self.ensure_active("clear")?;
        self.inner.bus.clear();
        Ok(())
    }

    // ---- state ----

    pub fn get_state(&self, path: impl Into<StatePath>) -> BridgeResult<Option<Value>> {
        self.ensure_active("get_state")?;
        self.inner.manager.get_state(path)
    }

    /// Writes through side A and mirrors to side B.
    pub fn set_state(&self, path: impl Into<StatePath>, value: Value) -> BridgeResult<()> {
        self.set_state_from(Side::A, path, value)
    }

    pub fn set_state_from(&self, source: Side, path: impl Into<StatePath>, value: Value) -> BridgeResult<()> {
        self.ensure_active("set_state")?;
        self.inner.manager.set_state(path, value, source)
    }

    pub fn subscribe<F>(&self, path: impl Into<StatePath>, callback: F) -> BridgeResult<PathSubscription>
    where
        F: Fn(&StatePath, Option<&Value>) + Send + Sync + 'static,
    {
        self.ensure_active("subscribe")?;
        self.inner.manager.subscribe(path, callback)
    }

    // ---- status ----

    pub fn get_status(&self) -> BridgeResult<BridgeStatus> {
        self.ensure_active("get_status")?;
        Ok(self.inner.health.get_status())
    }

    pub fn get_diagnostics(&self) -> BridgeResult<Diagnostics> {
        self.ensure_active("get_diagnostics")?;
        let health = &self.inner.health;
        Ok(Diagnostics::collect(
            health.get_status(),
            HealthDiagnostics {
                checks: health.check_count(),
                strategies: health.strategy_count(),
                running: health.is_running(),
                interval_ms: health.interval().as_millis() as u64,
            },
            self.inner.bus.diagnostics(),
            self.inner.manager.diagnostics(),
        ))
    }
}

impl PartialEq for BridgeHandle {
    /// Handles are equal when they refer to the same connection.
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for BridgeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeHandle")
            .field("active", &self.is_active())
            .finish()
    }
}
