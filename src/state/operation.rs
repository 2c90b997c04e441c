use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::path::StatePath;

static OP_SEQ: AtomicU64 = AtomicU64::new(0);

/// One of the two synchronized state trees.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    A,
    B,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }

    pub fn as_label(self) -> &'static str {
        match self {
            Side::A => "a",
            Side::B => "b",
        }
    }
}

/// A write observed on one side, waiting for conflict resolution.
///
/// `value == None` is a removal. `seq` records arrival order and breaks
/// timestamp ties (the later arrival wins).
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateOperation {
    pub path: StatePath,
    pub value: Option<Value>,
    pub timestamp: SystemTime,
    pub source: Side,
    pub seq: u64,
}

impl UpdateOperation {
    pub fn new(path: impl Into<StatePath>, value: Option<Value>, source: Side) -> Self {
        Self::with_timestamp(path, value, source, SystemTime::now())
    }

    pub fn with_timestamp(
        path: impl Into<StatePath>,
        value: Option<Value>,
        source: Side,
        timestamp: SystemTime,
    ) -> Self {
        Self {
            path: path.into(),
            value,
            timestamp,
            source,
            seq: OP_SEQ.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Ordering key used by last-write-wins.
    pub(crate) fn precedence(&self) -> (SystemTime, u64) {
        (self.timestamp, self.seq)
    }
}
