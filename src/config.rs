//! # Bridge runtime configuration.
//!
//! Provides [`BridgeConfig`], centralized settings for every bridge component:
//! - [`BusConfig`]: batching and handler defaults for the [`EventBus`](crate::EventBus);
//! - [`SyncConfig`]: conflict window and notification debounce for the
//!   [`DualStateManager`](crate::DualStateManager);
//! - [`HealthConfig`]: check interval for the [`HealthSupervisor`](crate::HealthSupervisor).
//!
//! ## Sentinel values
//! - `batch_delay = 0s` → batching disabled (every emit delivers immediately)
//! - `max_batch_size = 0` → no size threshold (only the delay flushes)
//! - `handler_timeout = 0s` → handlers run without a per-handler timeout by default
//! - `stall_timeout = 0s` → no dispatcher stall guard (a stuck handler blocks the bus)
//! - `conflict_window = 0s` → operations are resolved on the next scheduler turn
//!
//! All configs are `serde`-(de)serializable; durations are encoded in
//! milliseconds so a host can keep them in JSON.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration handed to [`BridgeCoordinator`](crate::BridgeCoordinator).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Event bus settings.
    pub bus: BusConfig,
    /// State synchronization settings.
    pub sync: SyncConfig,
    /// Health supervision settings.
    pub health: HealthConfig,
}

/// Event bus configuration.
///
/// ## Field semantics
/// - `batch_delay`: how long the first emit for a name waits for company (`0s` = no batching)
/// - `max_batch_size`: pending payloads that force an immediate flush (`0` = unbounded)
/// - `handler_timeout`: default guard for handlers registered without one (`0s` = none)
/// - `max_handler_failures`: failures since the last reset after which the bus reports unhealthy
/// - `stall_timeout`: how long a handler without a timeout may hold the dispatcher before it is
///   detached; a dispatcher busy with one handler for longer reports unhealthy (`0s` = no guard)
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Batch window started by the first emit for an event name.
    #[serde(with = "millis")]
    pub batch_delay: Duration,
    /// Pending payload count that flushes a batch without waiting.
    pub max_batch_size: usize,
    /// Default per-handler timeout guard.
    #[serde(with = "millis")]
    pub handler_timeout: Duration,
    /// Failure budget before [`EventBus::is_healthy`](crate::EventBus::is_healthy) turns false.
    pub max_handler_failures: u64,
    /// Dispatcher guard for handlers running without a timeout.
    #[serde(with = "millis")]
    pub stall_timeout: Duration,
}

impl BusConfig {
    /// Returns `true` when emits are grouped into batches.
    #[inline]
    pub fn batching_enabled(&self) -> bool {
        self.batch_delay > Duration::ZERO
    }

    /// Returns the size threshold as an `Option`.
    ///
    /// - `None` → only the delay timer flushes
    /// - `Some(n)` → `n` pending payloads flush immediately
    #[inline]
    pub fn size_threshold(&self) -> Option<usize> {
        if self.max_batch_size == 0 {
            None
        } else {
            Some(self.max_batch_size)
        }
    }

    /// Returns the default handler timeout as an `Option`.
    #[inline]
    pub fn default_handler_timeout(&self) -> Option<Duration> {
        if self.handler_timeout == Duration::ZERO {
            None
        } else {
            Some(self.handler_timeout)
        }
    }

    /// Returns the stall guard as an `Option` (`None` when disabled).
    #[inline]
    pub fn stall_guard(&self) -> Option<Duration> {
        if self.stall_timeout == Duration::ZERO {
            None
        } else {
            Some(self.stall_timeout)
        }
    }

    /// Configuration with batching disabled; everything else default.
    pub fn unbatched() -> Self {
        Self {
            batch_delay: Duration::ZERO,
            ..Self::default()
        }
    }
}

impl Default for BusConfig {
    /// Default configuration:
    ///
    /// - `batch_delay = 50ms`
    /// - `max_batch_size = 10`
    /// - `handler_timeout = 0s` (no guard)
    /// - `max_handler_failures = 50`
    /// - `stall_timeout = 5s`
    fn default() -> Self {
        Self {
            batch_delay: Duration::from_millis(50),
            max_batch_size: 10,
            handler_timeout: Duration::ZERO,
            max_handler_failures: 50,
            stall_timeout: Duration::from_secs(5),
        }
    }
}

/// State synchronization configuration.
///
/// The two windows are independent timers: an externally detected change is
/// applied when its conflict window closes and its subscribers are notified one
/// debounce window after that. Explicit `set_state` writes skip the conflict
/// window and only wait for the debounce.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Lock window during which concurrent operations queue before resolution.
    #[serde(with = "millis")]
    pub conflict_window: Duration,
    /// Debounce before accumulated changed paths are notified.
    #[serde(with = "millis")]
    pub notify_debounce: Duration,
}

impl Default for SyncConfig {
    /// Default configuration:
    ///
    /// - `conflict_window = 200ms`
    /// - `notify_debounce = 50ms`
    fn default() -> Self {
        Self {
            conflict_window: Duration::from_millis(200),
            notify_debounce: Duration::from_millis(50),
        }
    }
}

/// Health supervision configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Interval between health check ticks.
    #[serde(with = "millis")]
    pub check_interval: Duration,
    /// Start the timer as part of `connect`.
    pub autostart: bool,
}

impl HealthConfig {
    /// Returns the check interval clamped to a minimum of 1ms.
    ///
    /// `tokio::time::interval` panics on a zero period.
    #[inline]
    pub fn check_interval_clamped(&self) -> Duration {
        self.check_interval.max(Duration::from_millis(1))
    }
}

impl Default for HealthConfig {
    /// Default configuration:
    ///
    /// - `check_interval = 5s`
    /// - `autostart = true`
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            autostart: true,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        let ms = d.as_millis().min(u128::from(u64::MAX)) as u64;
        s.serialize_u64(ms)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_windows() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.bus.batch_delay, Duration::from_millis(50));
        assert_eq!(cfg.sync.conflict_window, Duration::from_millis(200));
        assert_eq!(cfg.sync.notify_debounce, Duration::from_millis(50));
        assert!(cfg.bus.batching_enabled());
    }

    #[test]
    fn test_sentinels() {
        let bus = BusConfig {
            max_batch_size: 0,
            ..BusConfig::unbatched()
        };
        assert!(!bus.batching_enabled());
        assert_eq!(bus.size_threshold(), None);
        assert_eq!(bus.default_handler_timeout(), None);
        assert_eq!(bus.stall_guard(), Some(Duration::from_secs(5)));
        let unguarded = BusConfig {
            stall_timeout: Duration::ZERO,
            ..BusConfig::default()
        };
        assert_eq!(unguarded.stall_guard(), None);

        let health = HealthConfig {
            check_interval: Duration::ZERO,
            autostart: false,
        };
        assert_eq!(health.check_interval_clamped(), Duration::from_millis(1));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: BridgeConfig =
            serde_json::from_str(r#"{ "bus": { "batch_delay": 0 }, "sync": { "conflict_window": 10 } }"#)
                .unwrap();
        assert!(!cfg.bus.batching_enabled());
        assert_eq!(cfg.bus.max_batch_size, 10);
        assert_eq!(cfg.sync.conflict_window, Duration::from_millis(10));
        assert_eq!(cfg.sync.notify_debounce, Duration::from_millis(50));
        assert_eq!(cfg.health.check_interval, Duration::from_secs(5));
    }
}
