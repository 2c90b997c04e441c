//! # HealthSupervisor: periodic checks, status machine, ordered recovery.
//!
//! ## Tick
//! ```text
//! tick ─► run all checks (panic = failed)
//!          ├─ all pass ─► status != Healthy/Critical ─► Healthy, attempts = 0
//!          └─ failing  ─► Healthy ─► DegradedPerformance
//!                         Degraded ─► failing check's escalation state
//!                         worse    ─► unchanged
//!                         └─► recovery cycle (unless one is running or Critical)
//!
//! recovery cycle: attempts += 1
//!   strategy[0] ─► Err/panic ─► strategy[1] ─► Ok ─► stop (next tick re-verifies)
//!   ... all failed ─► CriticalFailure
//! ```
//!
//! Status changes are published as `bridge:status-changed`; cycles as
//! `recovery:started` / `recovery:finished`.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::check::{HealthCheck, StrategyRef};
use super::status::{BridgeState, BridgeStatus};
use crate::config::HealthConfig;
use crate::error::{BridgeError, ErrorCode};
use crate::events::{BridgeEvent, EventBus, RecoveryFinished, RecoveryStarted, StatusChanged};
use crate::result::{BridgeResult, panic_message};

const COMPONENT: &str = "health-supervisor";

#[derive(Default)]
struct Registry {
    checks: Vec<HealthCheck>,
    strategies: Vec<StrategyRef>,
}

struct Timer {
    token: CancellationToken,
    _task: JoinHandle<()>,
}

struct Inner {
    interval: Mutex<Duration>,
    runtime: Handle,
    bus: Option<EventBus>,
    status: RwLock<BridgeStatus>,
    registry: RwLock<Registry>,
    recovering: AtomicBool,
    timer: Mutex<Option<Timer>>,
}

/// Runs health checks and drives recovery.
///
/// Cheap to clone: clones share status, registrations and the timer.
#[derive(Clone)]
pub struct HealthSupervisor {
    inner: Arc<Inner>,
}

impl HealthSupervisor {
    /// Creates a stopped supervisor; `bus` receives status and recovery events.
    pub fn new(cfg: &HealthConfig, bus: Option<EventBus>) -> BridgeResult<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            BridgeError::new(
                ErrorCode::InitializationFailed,
                COMPONENT,
                "new",
                "health supervisor requires a tokio runtime",
            )
            .with_cause(e)
        })?;

        Ok(Self {
            inner: Arc::new(Inner {
                interval: Mutex::new(cfg.check_interval_clamped()),
                runtime,
                bus,
                status: RwLock::new(BridgeStatus::healthy()),
                registry: RwLock::new(Registry::default()),
                recovering: AtomicBool::new(false),
                timer: Mutex::new(None),
            }),
        })
    }

    pub fn register_check(&self, check: HealthCheck) {
        tracing::debug!(check = check.name(), "health check registered");
        self.inner.registry.write().checks.push(check);
    }

    /// Appends a strategy; strategies are tried in registration order.
    pub fn register_strategy(&self, strategy: StrategyRef) {
        tracing::debug!(strategy = strategy.name(), "recovery strategy registered");
        self.inner.registry.write().strategies.push(strategy);
    }

    pub fn check_count(&self) -> usize {
        self.inner.registry.read().checks.len()
    }

    pub fn strategy_count(&self) -> usize {
        self.inner.registry.read().strategies.len()
    }

    pub fn get_status(&self) -> BridgeStatus {
        self.inner.status.read().clone()
    }

    /// Starts the periodic timer (no-op when already running).
    ///
    /// The first tick fires one interval after the start.
    pub fn start_health_checks(&self) {
        let mut timer = self.inner.timer.lock();
        if timer.is_some() {
            return;
        }
        let period = *self.inner.interval.lock();
        let token = CancellationToken::new();
        let task = self.inner.runtime.spawn(tick_loop(
            Arc::downgrade(&self.inner),
            period,
            token.clone(),
        ));
        *timer = Some(Timer { token, _task: task });
        tracing::debug!(interval_ms = period.as_millis() as u64, "health checks started");
    }

    /// Stops the timer; checks and strategies stay registered.
    ///
    /// A check or recovery cycle already running completes.
    pub fn stop_health_checks(&self) {
        if let Some(timer) = self.inner.timer.lock().take() {
            timer.token.cancel();
            tracing::debug!("health checks stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.timer.lock().is_some()
    }

    /// Changes the interval, restarting a running timer.
    pub fn set_health_check_interval(&self, interval: Duration) {
        *self.inner.interval.lock() = interval.max(Duration::from_millis(1));
        if self.is_running() {
            self.stop_health_checks();
            self.start_health_checks();
        }
    }

    pub fn interval(&self) -> Duration {
        *self.inner.interval.lock()
    }

    /// Runs one tick now and returns the resulting status.
    pub async fn check_now(&self) -> BridgeStatus {
        self.inner.tick().await;
        self.get_status()
    }

    /// Host intervention: forces the status back to `Healthy` with zero attempts.
    ///
    /// The only way out of `CriticalFailure`.
    pub fn reset_status(&self) {
        let change = {
            let mut st = self.inner.status.write();
            let from = st.state;
            *st = BridgeStatus {
                message: "status reset".into(),
                ..BridgeStatus::healthy()
            };
            (from != BridgeState::Healthy).then(|| StatusChanged {
                from,
                to: BridgeState::Healthy,
                message: st.message.clone(),
                recovery_attempts: 0,
            })
        };
        if let Some(change) = change {
            tracing::info!(from = change.from.as_label(), "bridge status reset");
            self.inner.publish(BridgeEvent::StatusChanged(change));
        }
    }
}

async fn tick_loop(weak: Weak<Inner>, period: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = weak.upgrade() else {
            break;
        };
        inner.tick().await;
    }
}

impl Inner {
    async fn tick(&self) {
        let checks = self.registry.read().checks.clone();
        let failing: Vec<HealthCheck> = checks
            .into_iter()
            .filter(|check| !run_check(check))
            .collect();

        if failing.is_empty() {
            self.on_all_passing();
            return;
        }

        let names: Vec<String> = failing.iter().map(|c| c.name().to_string()).collect();
        let current = self.status.read().state;
        let next = match current {
            BridgeState::Healthy => BridgeState::DegradedPerformance,
            BridgeState::DegradedPerformance => failing[0].escalates_to(),
            worse => worse,
        };
        self.transition(next, format!("checks failing: {}", names.join(", ")), names.clone());

        if self.status.read().state == BridgeState::CriticalFailure {
            return;
        }
        self.recover(names).await;
    }

    fn on_all_passing(&self) {
        let state = self.status.read().state;
        if matches!(state, BridgeState::Healthy | BridgeState::CriticalFailure) {
            return;
        }
        self.transition(BridgeState::Healthy, "all checks passing".into(), Vec::new());
    }

    async fn recover(&self, failing: Vec<String>) {
        if self.recovering.swap(true, Ordering::AcqRel) {
            tracing::debug!("recovery already in progress, skipping cycle");
            return;
        }
        let _cycle = CycleGuard(&self.recovering);

        let attempt = {
            let mut st = self.status.write();
            st.recovery_attempts = st.recovery_attempts.saturating_add(1);
            st.recovery_attempts
        };
        tracing::info!(attempt, failing = ?failing, "recovery started");
        self.publish(BridgeEvent::RecoveryStarted(RecoveryStarted {
            attempt,
            failing_checks: failing,
        }));

        let strategies = self.registry.read().strategies.clone();
        let mut succeeded = None;
        for strategy in strategies {
            match AssertUnwindSafe(strategy.recover()).catch_unwind().await {
                Ok(Ok(())) => {
                    tracing::info!(attempt, strategy = strategy.name(), "recovery strategy succeeded");
                    succeeded = Some(strategy.name().to_string());
                    break;
                }
                Ok(Err(e)) => {
                    tracing::warn!(attempt, strategy = strategy.name(), error = %e, "recovery strategy failed");
                }
                Err(panic) => {
                    tracing::warn!(
                        attempt,
                        strategy = strategy.name(),
                        reason = %panic_message(panic.as_ref()),
                        "recovery strategy panicked"
                    );
                }
            }
        }

        self.publish(BridgeEvent::RecoveryFinished(RecoveryFinished {
            attempt,
            strategy: succeeded.clone(),
        }));

        if succeeded.is_none() {
            let affected = self.status.read().affected_components.clone();
            self.transition(
                BridgeState::CriticalFailure,
                "all recovery strategies failed".into(),
                affected,
            );
        }
    }

    /// Moves along a valid edge; staying in the same state refreshes the details.
    fn transition(&self, next: BridgeState, message: String, affected: Vec<String>) {
        let change = {
            let mut st = self.status.write();
            let from = st.state;
            if from != next && !from.can_transition_to(next) {
                tracing::debug!(from = from.as_label(), to = next.as_label(), "transition not allowed");
                return;
            }
            st.message = message;
            st.affected_components = affected;
            st.timestamp = SystemTime::now();
            if from == next {
                return;
            }
            st.state = next;
            if next == BridgeState::Healthy {
                st.recovery_attempts = 0;
            }
            StatusChanged {
                from,
                to: next,
                message: st.message.clone(),
                recovery_attempts: st.recovery_attempts,
            }
        };

        if change.to == BridgeState::CriticalFailure {
            tracing::error!(from = change.from.as_label(), attempts = change.recovery_attempts, message = %change.message, "bridge status critical");
        } else {
            tracing::warn!(from = change.from.as_label(), to = change.to.as_label(), message = %change.message, "bridge status changed");
        }
        self.publish(BridgeEvent::StatusChanged(change));
    }

    fn publish(&self, event: BridgeEvent) {
        if let Some(bus) = &self.bus {
            if let Err(e) = bus.emit(event) {
                tracing::debug!(error = %e, "health event not published");
            }
        }
    }
}

fn run_check(check: &HealthCheck) -> bool {
    match std::panic::catch_unwind(AssertUnwindSafe(|| check.run())) {
        Ok(ok) => ok,
        Err(panic) => {
            tracing::warn!(check = check.name(), reason = %panic_message(panic.as_ref()), "health check panicked");
            false
        }
    }
}

/// Clears the in-progress flag when a recovery cycle ends.
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
