//! Snapshot/rollback guard for writes that touch both sides.
//!
//! [`Transaction::begin`] takes the manager's transaction lock (one open
//! transaction at a time) and snapshots `path` on both trees. Dropping the
//! guard without [`Transaction::commit`] restores the snapshot, which also
//! covers a panic inside the mutation.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;

use super::operation::Side;
use super::path::StatePath;
use super::tree::StateTree;
use crate::error::TreeError;

/// What a side held at the transaction path before it began.
#[derive(Clone, Debug, PartialEq)]
enum Prior {
    /// The node existed with this value.
    Value(Value),
    /// The node did not exist; `created` is the shallowest missing ancestor
    /// (or the path itself), removed again on rollback.
    Absent { created: StatePath },
}

pub(crate) struct Transaction<'a> {
    _lock: MutexGuard<'a, ()>,
    path: StatePath,
    a: Arc<dyn StateTree>,
    b: Arc<dyn StateTree>,
    prior: [Prior; 2],
    committed: bool,
}

impl<'a> Transaction<'a> {
    /// Blocks until no other transaction is open.
    pub(crate) fn begin(
        lock: &'a Mutex<()>,
        path: &StatePath,
        a: Arc<dyn StateTree>,
        b: Arc<dyn StateTree>,
    ) -> Self {
        let guard = lock.lock();
        let prior = [snapshot(a.as_ref(), path), snapshot(b.as_ref(), path)];
        Self {
            _lock: guard,
            path: path.clone(),
            a,
            b,
            prior,
            committed: false,
        }
    }

    fn tree(&self, side: Side) -> &dyn StateTree {
        match side {
            Side::A => self.a.as_ref(),
            Side::B => self.b.as_ref(),
        }
    }

    /// Writes (`Some`) or removes (`None`) the transaction path on `side`.
    pub(crate) fn write(&self, side: Side, value: Option<Value>) -> Result<(), TreeError> {
        let tree = self.tree(side);
        match value {
            Some(v) => tree.write(&self.path, v),
            None => tree.remove(&self.path).map(|_| ()),
        }
    }

    pub(crate) fn commit(mut self) {
        self.committed = true;
    }

    fn rollback(&self) {
        for (side, prior) in [Side::A, Side::B].into_iter().zip(&self.prior) {
            let tree = self.tree(side);
            let res = match prior {
                Prior::Value(v) => tree.write(&self.path, v.clone()),
                Prior::Absent { created } => tree.remove(created).map(|_| ()),
            };
            if let Err(e) = res {
                tracing::error!(
                    tree = tree.label(),
                    path = %self.path,
                    error = %e,
                    "rollback could not restore snapshot"
                );
            }
        }
        tracing::debug!(path = %self.path, "transaction rolled back");
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.rollback();
        }
    }
}

fn snapshot(tree: &dyn StateTree, path: &StatePath) -> Prior {
    if let Some(v) = tree.read(path) {
        return Prior::Value(v);
    }
    let mut at = StatePath::root();
    for seg in path.segments() {
        at = at.join(seg);
        if tree.read(&at).is_none() {
            return Prior::Absent { created: at };
        }
    }
    Prior::Absent {
        created: path.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ObservableTree;
    use serde_json::json;

    fn trees(a: Value, b: Value) -> (Arc<ObservableTree>, Arc<ObservableTree>) {
        (
            Arc::new(ObservableTree::new("a", a).unwrap()),
            Arc::new(ObservableTree::new("b", b).unwrap()),
        )
    }

    #[test]
    fn test_dropped_transaction_restores_both_sides() {
        let (a, b) = trees(json!({ "x": 1 }), json!({ "cfg": 5 }));
        let lock = Mutex::new(());
        {
            let txn = Transaction::begin(&lock, &"cfg.mode".into(), a.clone(), b.clone());
            txn.write(Side::A, Some(json!("dark"))).unwrap();
            assert!(txn.write(Side::B, Some(json!("dark"))).is_err());
        }
        assert_eq!(a.snapshot(), json!({ "x": 1 }));
        assert_eq!(b.snapshot(), json!({ "cfg": 5 }));
    }

    #[test]
    fn test_committed_transaction_keeps_writes() {
        let (a, b) = trees(json!({ "x": 1 }), json!({ "x": 1 }));
        let lock = Mutex::new(());
        let txn = Transaction::begin(&lock, &"x".into(), a.clone(), b.clone());
        txn.write(Side::A, Some(json!(2))).unwrap();
        txn.write(Side::B, None).unwrap();
        txn.commit();
        assert_eq!(a.snapshot(), json!({ "x": 2 }));
        assert_eq!(b.snapshot(), json!({}));
        assert!(lock.try_lock().is_some(), "commit releases the lock");
    }

    #[test]
    fn test_rollback_restores_previous_value() {
        let (a, b) = trees(json!({ "x": { "y": 1 } }), json!({ "x": { "y": 1 } }));
        let lock = Mutex::new(());
        let txn = Transaction::begin(&lock, &"x.y".into(), a.clone(), b.clone());
        txn.write(Side::A, Some(json!(9))).unwrap();
        txn.write(Side::B, None).unwrap();
        drop(txn);
        assert_eq!(a.read(&"x.y".into()), Some(json!(1)));
        assert_eq!(b.read(&"x.y".into()), Some(json!(1)));
    }
}
