//! # Health checks and recovery strategies.
//!
//! A [`HealthCheck`] is a named synchronous predicate plus the state the
//! supervisor escalates to when it keeps failing. A [`RecoveryStrategy`] is a
//! named async operation; [`StrategyFn`] wraps a closure producing a fresh
//! future per attempt.
//!
//! ## Example
//! ```rust
//! use statebridge::{BridgeError, BridgeState, HealthCheck, StrategyFn, StrategyRef};
//!
//! let check = HealthCheck::new("cache", BridgeState::SyncError, || true);
//! assert_eq!(check.name(), "cache");
//!
//! let s: StrategyRef = StrategyFn::arc("flush-cache", || async {
//!     Ok::<_, BridgeError>(())
//! });
//! assert_eq!(s.name(), "flush-cache");
//! ```

use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use super::status::BridgeState;
use crate::result::BridgeResult;

/// Predicate run on every tick.
pub type CheckFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// Named health predicate.
#[derive(Clone)]
pub struct HealthCheck {
    name: Cow<'static, str>,
    escalates_to: BridgeState,
    check: CheckFn,
}

impl HealthCheck {
    pub fn new<F>(name: impl Into<Cow<'static, str>>, escalates_to: BridgeState, check: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            escalates_to,
            check: Arc::new(check),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// State entered from `DegradedPerformance` when this check fails.
    pub fn escalates_to(&self) -> BridgeState {
        self.escalates_to
    }

    pub(crate) fn run(&self) -> bool {
        (self.check)()
    }
}

impl fmt::Debug for HealthCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthCheck")
            .field("name", &self.name)
            .field("escalates_to", &self.escalates_to)
            .finish()
    }
}

/// Shared handle to a strategy.
pub type StrategyRef = Arc<dyn RecoveryStrategy>;

/// # Recovery step tried by the supervisor.
///
/// Strategies should be short and idempotent; a started strategy is never
/// cancelled.
#[async_trait]
pub trait RecoveryStrategy: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn recover(&self) -> BridgeResult<()>;
}

/// Function-backed strategy.
pub struct StrategyFn<F> {
    name: Cow<'static, str>,
    f: F,
}

impl<F> StrategyFn<F> {
    pub fn new(name: impl Into<Cow<'static, str>>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }

    /// Creates the strategy and returns it as a shared handle.
    pub fn arc(name: impl Into<Cow<'static, str>>, f: F) -> Arc<Self> {
        Arc::new(Self::new(name, f))
    }
}

#[async_trait]
impl<F, Fut> RecoveryStrategy for StrategyFn<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = BridgeResult<()>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn recover(&self) -> BridgeResult<()> {
        (self.f)().await
    }
}
