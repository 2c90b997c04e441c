//! # Last-write-wins conflict resolution.
//!
//! Detected writes are queued into windows. The first operation of a window
//! locks the resolver; the owner of that window waits for it to elapse, then
//! takes the queued operations as one cycle:
//!
//! ```text
//! enqueue(op₁) ─► locked, caller schedules the window
//! enqueue(op₂..) ─► queued
//!     ... window elapses ...
//! take_cycle() ─► per path: max (timestamp, arrival) wins
//!                 losers from the opposite side ─► conflicts
//!                 winners sorted by timestamp
//! release() ─► unlocked, or `true` when ops queued meanwhile (next window)
//! ```

use std::collections::HashMap;

use parking_lot::Mutex;

use super::operation::UpdateOperation;
use super::path::StatePath;

/// A discarded opposite-side operation and the one that beat it.
#[derive(Clone, Debug, PartialEq)]
pub struct Conflict {
    pub kept: UpdateOperation,
    pub discarded: UpdateOperation,
}

/// Outcome of one resolution cycle.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResolvedCycle {
    /// Winning operations, in timestamp order.
    pub winners: Vec<UpdateOperation>,
    pub conflicts: Vec<Conflict>,
}

#[derive(Default)]
struct ResolverState {
    locked: bool,
    queue: Vec<UpdateOperation>,
}

/// Windowed last-write-wins resolver.
#[derive(Default)]
pub struct ConflictResolver {
    state: Mutex<ResolverState>,
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `op`. Returns `true` when it opened a new window; the caller
    /// then owns scheduling the window's resolution.
    pub fn enqueue(&self, op: UpdateOperation) -> bool {
        let mut st = self.state.lock();
        st.queue.push(op);
        if st.locked {
            false
        } else {
            st.locked = true;
            true
        }
    }

    /// Queues `op` only if a window is open. Returns whether it was recorded.
    pub fn record(&self, op: UpdateOperation) -> bool {
        let mut st = self.state.lock();
        if st.locked {
            st.queue.push(op);
        }
        st.locked
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Drains the queue and resolves it.
    pub fn take_cycle(&self) -> ResolvedCycle {
        let ops = std::mem::take(&mut self.state.lock().queue);
        resolve(ops)
    }

    /// Ends the current window. Returns `true` (staying locked) when more
    /// operations queued since [`take_cycle`](Self::take_cycle).
    pub fn release(&self) -> bool {
        let mut st = self.state.lock();
        if st.queue.is_empty() {
            st.locked = false;
            false
        } else {
            true
        }
    }

    /// Drops queued operations and unlocks.
    pub fn clear(&self) {
        let mut st = self.state.lock();
        st.queue.clear();
        st.locked = false;
    }
}

/// Resolves one batch of operations by path.
pub fn resolve(ops: Vec<UpdateOperation>) -> ResolvedCycle {
    let mut by_path: HashMap<StatePath, Vec<UpdateOperation>> = HashMap::new();
    for op in ops {
        by_path.entry(op.path.clone()).or_default().push(op);
    }

    let mut cycle = ResolvedCycle::default();
    for (_, mut group) in by_path {
        let Some(idx) = group
            .iter()
            .enumerate()
            .max_by_key(|(_, op)| op.precedence())
            .map(|(i, _)| i)
        else {
            continue;
        };
        let winner = group.swap_remove(idx);
        for loser in group {
            if loser.source != winner.source {
                cycle.conflicts.push(Conflict {
                    kept: winner.clone(),
                    discarded: loser,
                });
            }
        }
        cycle.winners.push(winner);
    }

    cycle.winners.sort_by_key(UpdateOperation::precedence);
    cycle
        .conflicts
        .sort_by_key(|c| c.discarded.precedence());
    cycle
}
