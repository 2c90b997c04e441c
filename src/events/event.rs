//! # Bridge events and their payload shapes.
//!
//! Every event name carries a fixed payload shape, modeled as a variant of
//! [`BridgeEvent`]. Host-defined topics use [`BridgeEvent::Custom`] with a free
//! JSON payload. Untyped input (`name` + JSON) is validated at the boundary by
//! [`BridgeEvent::parse`].
//!
//! | Name                    | Variant                          | Publisher         |
//! |-------------------------|----------------------------------|-------------------|
//! | `state:changed`         | [`BridgeEvent::StateChanged`]    | state manager     |
//! | `sync:conflict`         | [`BridgeEvent::SyncConflict`]    | state manager     |
//! | `bridge:status-changed` | [`BridgeEvent::StatusChanged`]   | health supervisor |
//! | `recovery:started`      | [`BridgeEvent::RecoveryStarted`] | health supervisor |
//! | `recovery:finished`     | [`BridgeEvent::RecoveryFinished`]| health supervisor |
//!
//! The [`Event`] envelope adds a global sequence number and a timestamp.
//!
//! ## Example
//! ```rust
//! use serde_json::json;
//! use statebridge::BridgeEvent;
//!
//! let ev = BridgeEvent::parse("state:changed", json!({ "paths": ["user.name"] })).unwrap();
//! assert_eq!(ev.name(), "state:changed");
//!
//! assert!(BridgeEvent::parse("state:changed", json!({ "paths": 3 })).is_err());
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BridgeError, ErrorCode};
use crate::health::BridgeState;
use crate::result::BridgeResult;
use crate::state::Side;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Payload of `state:changed`: the collapsed set of notified paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChanged {
    pub paths: Vec<String>,
}

/// Payload of `sync:conflict`: one discarded operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub path: String,
    /// Side whose operation was applied.
    pub kept: Side,
    /// Side whose operation was dropped.
    pub discarded: Side,
    /// Timestamp of the applied operation (ms since the Unix epoch).
    pub kept_at_ms: u64,
    /// Timestamp of the dropped operation (ms since the Unix epoch).
    pub discarded_at_ms: u64,
}

/// Payload of `bridge:status-changed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChanged {
    pub from: BridgeState,
    pub to: BridgeState,
    pub message: String,
    pub recovery_attempts: u32,
}

/// Payload of `recovery:started`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStarted {
    /// Recovery cycle number since the last healthy state.
    pub attempt: u32,
    pub failing_checks: Vec<String>,
}

/// Payload of `recovery:finished`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryFinished {
    pub attempt: u32,
    /// Strategy that succeeded, `None` if the chain was exhausted.
    pub strategy: Option<String>,
}

/// Typed bridge event.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    StateChanged(StateChanged),
    SyncConflict(SyncConflict),
    StatusChanged(StatusChanged),
    RecoveryStarted(RecoveryStarted),
    RecoveryFinished(RecoveryFinished),
    /// Host-defined topic with an arbitrary payload.
    Custom { name: Arc<str>, payload: Value },
}

impl BridgeEvent {
    pub const STATE_CHANGED: &'static str = "state:changed";
    pub const SYNC_CONFLICT: &'static str = "sync:conflict";
    pub const STATUS_CHANGED: &'static str = "bridge:status-changed";
    pub const RECOVERY_STARTED: &'static str = "recovery:started";
    pub const RECOVERY_FINISHED: &'static str = "recovery:finished";

    /// Creates a host-defined event.
    pub fn custom(name: impl Into<Arc<str>>, payload: Value) -> Self {
        BridgeEvent::Custom {
            name: name.into(),
            payload,
        }
    }

    /// Topic this event is published under.
    pub fn name(&self) -> &str {
        match self {
            BridgeEvent::StateChanged(_) => Self::STATE_CHANGED,
            BridgeEvent::SyncConflict(_) => Self::SYNC_CONFLICT,
            BridgeEvent::StatusChanged(_) => Self::STATUS_CHANGED,
            BridgeEvent::RecoveryStarted(_) => Self::RECOVERY_STARTED,
            BridgeEvent::RecoveryFinished(_) => Self::RECOVERY_FINISHED,
            BridgeEvent::Custom { name, .. } => &**name,
        }
    }

    /// Validates an untyped `name` + JSON payload into a typed event.
    ///
    /// Reserved names must match their payload shape exactly; any other
    /// non-empty name becomes [`BridgeEvent::Custom`].
    pub fn parse(name: &str, payload: Value) -> BridgeResult<Self> {
        let ev = match name {
            Self::STATE_CHANGED => BridgeEvent::StateChanged(decode(name, payload)?),
            Self::SYNC_CONFLICT => BridgeEvent::SyncConflict(decode(name, payload)?),
            Self::STATUS_CHANGED => BridgeEvent::StatusChanged(decode(name, payload)?),
            Self::RECOVERY_STARTED => BridgeEvent::RecoveryStarted(decode(name, payload)?),
            Self::RECOVERY_FINISHED => BridgeEvent::RecoveryFinished(decode(name, payload)?),
            "" => {
                return Err(BridgeError::new(
                    ErrorCode::InvalidPayload,
                    "event-bus",
                    "parse",
                    "event name must not be empty",
                ));
            }
            other => BridgeEvent::custom(other, payload),
        };
        Ok(ev)
    }

    /// Payload as JSON (the inverse of [`BridgeEvent::parse`]).
    pub fn payload(&self) -> Value {
        let encoded = match self {
            BridgeEvent::StateChanged(p) => serde_json::to_value(p),
            BridgeEvent::SyncConflict(p) => serde_json::to_value(p),
            BridgeEvent::StatusChanged(p) => serde_json::to_value(p),
            BridgeEvent::RecoveryStarted(p) => serde_json::to_value(p),
            BridgeEvent::RecoveryFinished(p) => serde_json::to_value(p),
            BridgeEvent::Custom { payload, .. } => return payload.clone(),
        };
        encoded.unwrap_or(Value::Null)
    }
}

fn decode<T: serde::de::DeserializeOwned>(name: &str, payload: Value) -> BridgeResult<T> {
    serde_json::from_value(payload).map_err(|e| {
        BridgeError::new(
            ErrorCode::InvalidPayload,
            "event-bus",
            "parse",
            format!("invalid payload for `{name}`: {e}"),
        )
        .with_cause(e)
    })
}

/// Bridge event with ordering metadata.
///
/// - `seq`: monotonic global sequence
/// - `at`: wall-clock timestamp (for logs)
#[derive(Debug, Clone)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Typed payload.
    pub payload: BridgeEvent,
}

impl Event {
    /// Wraps a payload with the next sequence number and current timestamp.
    pub fn new(payload: BridgeEvent) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            payload,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.payload.name()
    }
}

/// Milliseconds since the Unix epoch (saturating, `0` before the epoch).
pub(crate) fn epoch_millis(t: SystemTime) -> u64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}
