//! # DualStateManager: keeps two state trees in sync.
//!
//! The manager owns the synchronization between side A and side B. It holds
//! only weak references to both trees.
//!
//! ## Flows
//! ```text
//! external write on side S ──► observer ──► UpdateOperation ──► ConflictResolver
//!                                                                  │ window (200ms)
//!                                                                  ▼
//!                                       winners ─► txn: write opposite side ─► notifier
//!                                       losers  ─► sync:conflict
//!
//! set_state(p, v, S) ──► txn: write S, mirror to S' ──► commit ─► notifier (50ms)
//!                                     └─ error/panic ─► rollback ─► SyncError (recoverable)
//! ```
//!
//! ## Rules
//! - The manager's own writes are marked in flight; observer callbacks for the
//!   written path itself are ignored while marked.
//! - A change on an ancestor or descendant of an in-flight path is deferred.
//!   Once the write commits, each deferred path whose sides still differ is
//!   queued as an external change and goes through the conflict window. A
//!   failed write discards the deferred paths.
//! - After every mirrored write or removal, observers below the written path
//!   are pruned to the nodes that still exist and new nodes are watched.
//! - A detected change is ignored when the opposite side already holds the value.
//! - While a resolver window is open, explicit writes are recorded in it so
//!   last-write-wins holds against concurrently detected external writes.
//! - Observers run synchronously inside tree writes; a tree observer must not
//!   call back into [`DualStateManager::set_state`] (path subscribers may).

use std::collections::{BTreeSet, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::notifier::{PathSubscription, SelectiveNotifier, ValueReader};
use super::operation::{Side, UpdateOperation};
use super::path::StatePath;
use super::resolver::ConflictResolver;
use super::transaction::Transaction;
use super::tree::{ChangeObserver, ObserverId, StateTree};
use crate::config::SyncConfig;
use crate::error::{BridgeError, ErrorCode, TreeError};
use crate::events::{BridgeEvent, EventBus, SyncConflict, epoch_millis};
use crate::result::{BridgeResult, panic_message};

const COMPONENT: &str = "state-manager";

struct Sides {
    a: Weak<dyn StateTree>,
    b: Weak<dyn StateTree>,
}

#[derive(Default)]
struct Stats {
    applied: AtomicU64,
    conflicts: AtomicU64,
    sync_failures: AtomicU64,
}

struct Inner {
    cfg: SyncConfig,
    runtime: Handle,
    bus: Option<EventBus>,
    sides: RwLock<Option<Sides>>,
    watchers: Mutex<HashMap<(Side, StatePath), ObserverId>>,
    in_flight: Mutex<HashMap<StatePath, usize>>,
    deferred: Mutex<HashSet<(Side, StatePath)>>,
    txn: Mutex<()>,
    resolver: ConflictResolver,
    notifier: SelectiveNotifier,
    cycle: Mutex<Option<JoinHandle<()>>>,
    connected: AtomicBool,
    healthy: AtomicBool,
    stats: Stats,
}

/// Snapshot of manager bookkeeping for diagnostics.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ManagerDiagnostics {
    pub connected: bool,
    pub healthy: bool,
    pub watcher_count: usize,
    pub subscriber_count: usize,
    /// Distinct watched paths, sorted.
    pub paths_watched: Vec<String>,
    pub pending_operations: usize,
    pub pending_notifications: usize,
    pub applied: u64,
    pub conflicts: u64,
    pub sync_failures: u64,
}

/// Synchronizes two [`StateTree`]s.
///
/// Cheap to clone: clones share the same state.
#[derive(Clone)]
pub struct DualStateManager {
    inner: Arc<Inner>,
}

impl DualStateManager {
    /// Creates a disconnected manager on the current tokio runtime.
    ///
    /// `bus` receives `state:changed` and `sync:conflict` events when present.
    pub fn new(cfg: SyncConfig, bus: Option<EventBus>) -> BridgeResult<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            BridgeError::new(
                ErrorCode::InitializationFailed,
                COMPONENT,
                "new",
                "state manager requires a tokio runtime",
            )
            .with_cause(e)
        })?;

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let reader_ref = weak.clone();
            let reader: ValueReader = Arc::new(move |path: &StatePath| {
                reader_ref.upgrade().and_then(|inner| inner.read(Side::A, path))
            });
            Inner {
                notifier: SelectiveNotifier::new(
                    cfg.notify_debounce,
                    runtime.clone(),
                    reader,
                    bus.clone(),
                ),
                cfg,
                runtime,
                bus,
                sides: RwLock::new(None),
                watchers: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                deferred: Mutex::new(HashSet::new()),
                txn: Mutex::new(()),
                resolver: ConflictResolver::new(),
                cycle: Mutex::new(None),
                connected: AtomicBool::new(false),
                healthy: AtomicBool::new(false),
                stats: Stats::default(),
            }
        });
        Ok(Self { inner })
    }

    /// Attaches both trees and installs observers on every node.
    ///
    /// Reconnecting to other trees drops the previous observers first.
    pub fn connect(&self, side_a: &Arc<dyn StateTree>, side_b: &Arc<dyn StateTree>) -> BridgeResult<()> {
        self.inner.remove_watchers();
        *self.inner.sides.write() = Some(Sides {
            a: Arc::downgrade(side_a),
            b: Arc::downgrade(side_b),
        });
        self.inner.connected.store(true, Ordering::Release);

        if let Err(e) = self.inner.install_watchers() {
            self.inner.healthy.store(false, Ordering::Release);
            return Err(e);
        }
        self.inner.healthy.store(true, Ordering::Release);
        tracing::info!(side_a = side_a.label(), side_b = side_b.label(), "state manager connected");
        Ok(())
    }

    /// Removes observers, drops pending work and subscribers, and releases the trees.
    pub fn disconnect(&self) {
        if !self.inner.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner.remove_watchers();
        if let Some(cycle) = self.inner.cycle.lock().take() {
            cycle.abort();
        }
        self.inner.resolver.clear();
        self.inner.deferred.lock().clear();
        self.inner.notifier.close();
        *self.inner.sides.write() = None;
        tracing::info!("state manager disconnected");
    }

    /// Current value at `path` (read from side A).
    pub fn get_state(&self, path: impl Into<StatePath>) -> BridgeResult<Option<Value>> {
        self.get_state_from(Side::A, path)
    }

    pub fn get_state_from(&self, side: Side, path: impl Into<StatePath>) -> BridgeResult<Option<Value>> {
        self.inner.ensure_connected("get_state")?;
        let (a, b) = self.inner.trees("get_state")?;
        let path = path.into();
        Ok(match side {
            Side::A => a.read(&path),
            Side::B => b.read(&path),
        })
    }

    /// Writes `value` at `path` on `source` and mirrors it to the other side.
    ///
    /// No-op when both sides already hold `value`. On failure both sides are
    /// restored and a recoverable [`ErrorCode::SyncError`] is returned.
    pub fn set_state(&self, path: impl Into<StatePath>, value: Value, source: Side) -> BridgeResult<()> {
        self.inner.ensure_connected("set_state")?;
        let path = path.into();
        let (a, b) = self.inner.trees("set_state")?;

        let wanted = Some(&value);
        if a.read(&path).as_ref() == wanted && b.read(&path).as_ref() == wanted {
            return Ok(());
        }

        let op = UpdateOperation::new(path.clone(), Some(value.clone()), source);
        let result = {
            let _flight = InFlight::mark(&self.inner, &path);
            let txn = Transaction::begin(&self.inner.txn, &path, a, b);
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| -> Result<(), TreeError> {
                txn.write(source, Some(value.clone()))?;
                txn.write(source.opposite(), Some(value.clone()))
            }));

            match outcome {
                Ok(Ok(())) => {
                    txn.commit();
                    Ok(())
                }
                Ok(Err(e)) => {
                    drop(txn);
                    Err(BridgeError::new(
                        ErrorCode::SyncError,
                        COMPONENT,
                        "set_state",
                        format!("write to `{path}` failed: {e}"),
                    )
                    .with_cause(e))
                }
                Err(panic) => {
                    drop(txn);
                    Err(BridgeError::new(
                        ErrorCode::SyncError,
                        COMPONENT,
                        "set_state",
                        format!("write to `{path}` panicked: {}", panic_message(panic.as_ref())),
                    ))
                }
            }
        };

        if let Err(err) = result {
            self.inner.deferred.lock().clear();
            self.inner.mark_unhealthy(&err);
            return Err(err.recoverable(true));
        }

        self.inner.rewatch(&path);
        self.inner.resolver.record(op);
        self.inner.notifier.schedule(path);
        self.inner.reconcile_deferred();
        Ok(())
    }

    /// Subscribes to changes at `path` and below.
    pub fn subscribe<F>(&self, path: impl Into<StatePath>, callback: F) -> BridgeResult<PathSubscription>
    where
        F: Fn(&StatePath, Option<&Value>) + Send + Sync + 'static,
    {
        self.inner.ensure_connected("subscribe")?;
        Ok(self.inner.notifier.subscribe(path.into(), Arc::new(callback)))
    }

    pub fn unsubscribe(&self, subscription: &PathSubscription) -> bool {
        self.inner.notifier.unsubscribe(subscription.id())
    }

    /// `false` after a failed watcher setup or mirrored write, or when a tree is gone.
    pub fn is_healthy(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
            && self.inner.healthy.load(Ordering::Acquire)
            && self.inner.trees("is_healthy").is_ok()
    }

    /// Re-installs observers on the last-known trees and clears the unhealthy flag.
    pub fn reset(&self) -> BridgeResult<()> {
        self.inner.ensure_connected("reset")?;
        self.inner.remove_watchers();
        self.inner.install_watchers()?;
        self.inner.healthy.store(true, Ordering::Release);
        tracing::info!("state manager reset");
        Ok(())
    }

    pub fn diagnostics(&self) -> ManagerDiagnostics {
        let (watcher_count, paths_watched) = {
            let watchers = self.inner.watchers.lock();
            let paths: BTreeSet<String> = watchers.keys().map(|(_, p)| p.to_string()).collect();
            (watchers.len(), paths.into_iter().collect())
        };
        let stats = &self.inner.stats;
        ManagerDiagnostics {
            connected: self.inner.connected.load(Ordering::Acquire),
            healthy: self.is_healthy(),
            watcher_count,
            subscriber_count: self.inner.notifier.subscriber_count(),
            paths_watched,
            pending_operations: self.inner.resolver.pending(),
            pending_notifications: self.inner.notifier.pending_count(),
            applied: stats.applied.load(Ordering::Relaxed),
            conflicts: stats.conflicts.load(Ordering::Relaxed),
            sync_failures: stats.sync_failures.load(Ordering::Relaxed),
        }
    }
}

impl Inner {
    fn ensure_connected(&self, operation: &'static str) -> BridgeResult<()> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BridgeError::inactive(COMPONENT, operation))
        }
    }

    fn trees(&self, operation: &'static str) -> BridgeResult<(Arc<dyn StateTree>, Arc<dyn StateTree>)> {
        let sides = self.sides.read();
        let trees = sides
            .as_ref()
            .and_then(|s| Some((s.a.upgrade()?, s.b.upgrade()?)));
        trees.ok_or_else(|| {
            BridgeError::new(
                ErrorCode::InvalidState,
                COMPONENT,
                operation,
                "a state tree is no longer alive",
            )
        })
    }

    fn read(&self, side: Side, path: &StatePath) -> Option<Value> {
        let (a, b) = self.trees("read").ok()?;
        match side {
            Side::A => a.read(path),
            Side::B => b.read(path),
        }
    }

    fn mark_unhealthy(&self, err: &BridgeError) {
        self.healthy.store(false, Ordering::Release);
        self.stats.sync_failures.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(error = %err, "state manager marked unhealthy");
    }

    fn is_in_flight(&self, path: &StatePath) -> bool {
        self.in_flight
            .lock()
            .keys()
            .any(|f| f == path || f.is_ancestor_of(path) || path.is_ancestor_of(f))
    }

    fn install_watchers(self: &Arc<Self>) -> BridgeResult<()> {
        let (a, b) = self.trees("connect")?;
        for (side, tree) in [(Side::A, &a), (Side::B, &b)] {
            let res = std::panic::catch_unwind(AssertUnwindSafe(|| {
                for path in tree.paths(&StatePath::root()) {
                    self.watch(side, tree.as_ref(), path);
                }
            }));
            if let Err(panic) = res {
                return Err(BridgeError::new(
                    ErrorCode::ListenerError,
                    COMPONENT,
                    "connect",
                    format!(
                        "installing observers on `{}` panicked: {}",
                        tree.label(),
                        panic_message(panic.as_ref())
                    ),
                )
                .recoverable(true));
            }
        }
        tracing::debug!(watchers = self.watchers.lock().len(), "observers installed");
        Ok(())
    }

    fn remove_watchers(&self) {
        let drained: Vec<((Side, StatePath), ObserverId)> = self.watchers.lock().drain().collect();
        let Ok((a, b)) = self.trees("disconnect") else {
            return;
        };
        for ((side, _), id) in drained {
            match side {
                Side::A => a.remove_observer(id),
                Side::B => b.remove_observer(id),
            };
        }
    }

    /// Brings the observers at and below `path` in line with the nodes that
    /// exist now: stale ones are removed, then `path`, its ancestors and every
    /// node below it are watched on both sides.
    fn rewatch(self: &Arc<Self>, path: &StatePath) {
        let Ok((a, b)) = self.trees("watch") else {
            return;
        };
        for (side, tree) in [(Side::A, &a), (Side::B, &b)] {
            let live: HashSet<StatePath> = tree.paths(path).into_iter().collect();
            let mut stale = Vec::new();
            self.watchers.lock().retain(|(s, p), id| {
                let keep = *s != side || !(p == path || path.is_ancestor_of(p)) || live.contains(p);
                if !keep {
                    stale.push(*id);
                }
                keep
            });
            if !stale.is_empty() {
                tracing::trace!(side = side.as_label(), path = %path, pruned = stale.len(), "stale observers removed");
            }
            for id in stale {
                tree.remove_observer(id);
            }

            let mut at = StatePath::root();
            for seg in path.segments() {
                at = at.join(seg);
                if tree.read(&at).is_some() {
                    self.watch(side, tree.as_ref(), at.clone());
                }
            }
            for node in live {
                self.watch(side, tree.as_ref(), node);
            }
        }
    }

    fn watch(self: &Arc<Self>, side: Side, tree: &dyn StateTree, path: StatePath) {
        let key = (side, path);
        if self.watchers.lock().contains_key(&key) {
            return;
        }
        let id = tree.on_change(&key.1, self.observer(side));
        let mut watchers = self.watchers.lock();
        if watchers.contains_key(&key) {
            tree.remove_observer(id);
        } else {
            watchers.insert(key, id);
        }
    }

    fn observer(self: &Arc<Self>, side: Side) -> ChangeObserver {
        let weak = Arc::downgrade(self);
        Arc::new(move |path: &StatePath, value: Option<&Value>| {
            if let Some(inner) = weak.upgrade() {
                inner.on_external_change(side, path, value);
            }
        })
    }

    fn on_external_change(self: &Arc<Self>, side: Side, path: &StatePath, value: Option<&Value>) {
        if !self.connected.load(Ordering::Acquire) {
            return;
        }
        if self.is_in_flight(path) {
            if !self.in_flight.lock().contains_key(path) {
                tracing::debug!(side = side.as_label(), path = %path, "external change deferred behind a write");
                self.deferred.lock().insert((side, path.clone()));
            }
            return;
        }
        if self.read(side.opposite(), path).as_ref() == value {
            return;
        }

        tracing::trace!(side = side.as_label(), path = %path, "external change detected");
        self.enqueue(UpdateOperation::new(path.clone(), value.cloned(), side));
    }

    fn enqueue(self: &Arc<Self>, op: UpdateOperation) {
        if self.resolver.enqueue(op) {
            self.spawn_cycle();
        }
    }

    /// Queues deferred changes whose sides still differ, using the value each
    /// side holds now. Paths still in flight stay deferred.
    fn reconcile_deferred(self: &Arc<Self>) {
        let deferred = std::mem::take(&mut *self.deferred.lock());
        for (side, path) in deferred {
            if self.is_in_flight(&path) {
                self.deferred.lock().insert((side, path));
                continue;
            }
            let value = self.read(side, &path);
            if self.read(side.opposite(), &path) == value {
                continue;
            }
            tracing::debug!(side = side.as_label(), path = %path, "deferred external change queued");
            self.enqueue(UpdateOperation::new(path, value, side));
        }
    }

    fn spawn_cycle(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let window = self.cfg.conflict_window;
        let handle = self.runtime.spawn(async move {
            loop {
                tokio::time::sleep(window).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                inner.run_cycle();
                if !inner.resolver.release() {
                    return;
                }
            }
        });
        *self.cycle.lock() = Some(handle);
    }

    fn run_cycle(self: &Arc<Self>) {
        let cycle = self.resolver.take_cycle();

        for conflict in &cycle.conflicts {
            self.stats.conflicts.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                path = %conflict.kept.path,
                kept = conflict.kept.source.as_label(),
                discarded = conflict.discarded.source.as_label(),
                "sync conflict resolved by last write"
            );
            if let Some(bus) = &self.bus {
                let event = BridgeEvent::SyncConflict(SyncConflict {
                    path: conflict.kept.path.to_string(),
                    kept: conflict.kept.source,
                    discarded: conflict.discarded.source,
                    kept_at_ms: epoch_millis(conflict.kept.timestamp),
                    discarded_at_ms: epoch_millis(conflict.discarded.timestamp),
                });
                if let Err(e) = bus.emit(event) {
                    tracing::debug!(error = %e, "sync:conflict not published");
                }
            }
        }

        for op in cycle.winners {
            match self.apply(&op) {
                Ok(true) => {
                    self.stats.applied.fetch_add(1, Ordering::Relaxed);
                    self.notifier.schedule(op.path);
                }
                Ok(false) => {}
                Err(e) => self.mark_unhealthy(&e),
            }
        }
    }

    /// Writes a winning operation into the side opposite its source.
    ///
    /// Returns `Ok(false)` when the target already holds the value.
    fn apply(self: &Arc<Self>, op: &UpdateOperation) -> BridgeResult<bool> {
        if !self.connected.load(Ordering::Acquire) {
            return Ok(false);
        }
        let (a, b) = self.trees("apply")?;
        let target = op.source.opposite();
        let current = match target {
            Side::A => a.read(&op.path),
            Side::B => b.read(&op.path),
        };
        if current == op.value {
            return Ok(false);
        }

        let outcome = {
            let _flight = InFlight::mark(self, &op.path);
            let txn = Transaction::begin(&self.txn, &op.path, a, b);
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| txn.write(target, op.value.clone())));
            if matches!(outcome, Ok(Ok(()))) {
                txn.commit();
            }
            outcome
        };

        match outcome {
            Ok(Ok(())) => {
                self.rewatch(&op.path);
                self.reconcile_deferred();
                Ok(true)
            }
            Ok(Err(e)) => {
                self.deferred.lock().clear();
                Err(BridgeError::new(
                    ErrorCode::SyncError,
                    COMPONENT,
                    "apply",
                    format!("mirroring `{}` to side {} failed: {e}", op.path, target.as_label()),
                )
                .recoverable(true)
                .with_cause(e))
            }
            Err(panic) => {
                self.deferred.lock().clear();
                Err(BridgeError::new(
                    ErrorCode::SyncError,
                    COMPONENT,
                    "apply",
                    format!("mirroring `{}` panicked: {}", op.path, panic_message(panic.as_ref())),
                )
                .recoverable(true))
            }
        }
    }
}

/// Marks a path as being written by the manager until dropped.
struct InFlight<'a> {
    inner: &'a Inner,
    path: StatePath,
}

impl<'a> InFlight<'a> {
    fn mark(inner: &'a Inner, path: &StatePath) -> Self {
        *inner.in_flight.lock().entry(path.clone()).or_insert(0) += 1;
        Self {
            inner,
            path: path.clone(),
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.inner.in_flight.lock();
        if let Some(count) = in_flight.get_mut(&self.path) {
            *count -= 1;
            if *count == 0 {
                in_flight.remove(&self.path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use crate::events::{Delivery, HandlerFn, SubscribeOptions};
    use crate::state::ObservableTree;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        manager: DualStateManager,
        a: Arc<ObservableTree>,
        b: Arc<ObservableTree>,
    }

    fn fixture(a: Value, b: Value, bus: Option<EventBus>) -> Fixture {
        let a = Arc::new(ObservableTree::new("a", a).unwrap());
        let b = Arc::new(ObservableTree::new("b", b).unwrap());
        let manager = DualStateManager::new(SyncConfig::default(), bus).unwrap();
        let side_a: Arc<dyn StateTree> = a.clone();
        let side_b: Arc<dyn StateTree> = b.clone();
        manager.connect(&side_a, &side_b).unwrap();
        Fixture { manager, a, b }
    }

    type Hits = Arc<Mutex<Vec<String>>>;

    fn track(manager: &DualStateManager, path: &str) -> Hits {
        let hits: Hits = Default::default();
        let h = Arc::clone(&hits);
        manager
            .subscribe(path, move |p: &StatePath, _: Option<&Value>| h.lock().push(p.to_string()))
            .unwrap();
        hits
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_trip_mirrors_and_notifies_once() {
        let f = fixture(json!({}), json!({}), None);
        let user = track(&f.manager, "user");
        let name = track(&f.manager, "user.name");
        let other = track(&f.manager, "settings");

        f.manager.set_state("user.name", json!("Ada"), Side::A).unwrap();
        assert_eq!(f.a.read(&"user.name".into()), Some(json!("Ada")));
        assert_eq!(f.b.read(&"user.name".into()), Some(json!("Ada")));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(*user.lock(), vec!["user.name"]);
        assert_eq!(*name.lock(), vec!["user.name"]);
        assert!(other.lock().is_empty());
        assert_eq!(f.manager.get_state("user.name").unwrap(), Some(json!("Ada")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_setting_current_value_is_a_no_op() {
        let f = fixture(json!({ "x": 1 }), json!({ "x": 1 }), None);
        let hits = track(&f.manager, "");

        f.manager.set_state("x", json!(1), Side::B).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(hits.lock().is_empty());
        assert!(f.manager.is_healthy());
        assert_eq!(f.manager.diagnostics().applied, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_then_parent_collapses_to_parent() {
        let f = fixture(json!({}), json!({}), None);
        let hits = track(&f.manager, "a");

        f.manager.set_state("a.b", json!(1), Side::A).unwrap();
        f.manager.set_state("a", json!({ "b": 2, "c": 3 }), Side::A).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(*hits.lock(), vec!["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_mirror_rolls_back_both_sides() {
        let f = fixture(json!({}), json!({ "cfg": 5 }), None);
        let hits = track(&f.manager, "");

        let err = f.manager.set_state("cfg.mode", json!("dark"), Side::A).unwrap_err();
        assert_eq!(err.code, ErrorCode::SyncError);
        assert!(err.recoverable);
        assert_eq!(f.a.snapshot(), json!({}));
        assert_eq!(f.b.snapshot(), json!({ "cfg": 5 }));
        assert!(!f.manager.is_healthy());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(hits.lock().is_empty(), "rollback is not a change");
        assert_eq!(f.manager.diagnostics().pending_operations, 0);

        f.manager.reset().unwrap();
        assert!(f.manager.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_change_is_applied_after_window() {
        let f = fixture(json!({}), json!({}), None);
        let hits = track(&f.manager, "profile");

        f.b.write(&"profile.theme".into(), json!("dark")).unwrap();
        assert_eq!(f.a.read(&"profile.theme".into()), None);

        tokio::time::sleep(Duration::from_millis(210)).await;
        assert_eq!(f.a.read(&"profile.theme".into()), Some(json!("dark")));
        assert!(hits.lock().is_empty(), "notification waits for the debounce");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(*hits.lock(), vec!["profile.theme"]);

        // The new node is watched on both sides now.
        f.a.write(&"profile.theme".into(), json!("light")).unwrap();
        tokio::time::sleep(Duration::from_millis(210)).await;
        assert_eq!(f.b.read(&"profile.theme".into()), Some(json!("light")));
        assert!(f.manager.diagnostics().paths_watched.contains(&"profile.theme".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_external_writes_keep_the_latest() {
        let bus = EventBus::new(BusConfig::unbatched()).unwrap();
        let conflicts = Arc::new(Mutex::new(Vec::new()));
        let c = Arc::clone(&conflicts);
        bus.on(
            BridgeEvent::SYNC_CONFLICT,
            HandlerFn::arc("conflicts", move |d: Delivery| {
                let c = Arc::clone(&c);
                async move {
                    c.lock().extend(d.events().iter().map(|e| e.payload.clone()));
                    Ok::<_, BridgeError>(())
                }
            }),
            SubscribeOptions::default(),
        )
        .unwrap();

        let f = fixture(json!({ "n": 0 }), json!({ "n": 0 }), Some(bus));
        f.a.write(&"n".into(), json!(1)).unwrap();
        f.b.write(&"n".into(), json!(2)).unwrap();

        tokio::time::sleep(Duration::from_millis(210)).await;
        assert_eq!(f.a.read(&"n".into()), Some(json!(2)));
        assert_eq!(f.b.read(&"n".into()), Some(json!(2)));
        assert_eq!(f.manager.diagnostics().conflicts, 1);

        let seen = conflicts.lock().clone();
        assert_eq!(seen.len(), 1);
        match &seen[0] {
            BridgeEvent::SyncConflict(c) => {
                assert_eq!((c.kept, c.discarded), (Side::B, Side::A));
                assert_eq!(c.path, "n");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_write_wins_over_earlier_external_write() {
        let f = fixture(json!({ "n": 0 }), json!({ "n": 0 }), None);
        f.b.write(&"n".into(), json!(1)).unwrap();
        f.manager.set_state("n", json!(5), Side::A).unwrap();

        tokio::time::sleep(Duration::from_millis(210)).await;
        assert_eq!(f.a.read(&"n".into()), Some(json!(5)));
        assert_eq!(f.b.read(&"n".into()), Some(json!(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_removal_propagates() {
        let f = fixture(json!({ "x": { "y": 1 } }), json!({ "x": { "y": 1 } }), None);
        f.a.remove(&"x.y".into()).unwrap();
        tokio::time::sleep(Duration::from_millis(210)).await;
        assert_eq!(f.b.snapshot(), json!({ "x": {} }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replacing_a_subtree_drops_observers_below_it() {
        let f = fixture(json!({}), json!({}), None);
        assert_eq!(f.manager.diagnostics().watcher_count, 2);

        for round in 0..3 {
            for i in 0..100 {
                f.manager.set_state(format!("items.r{round}_{i}"), json!(i), Side::A).unwrap();
            }
            assert_eq!(f.manager.diagnostics().watcher_count, 2 * (2 + 100));
            f.manager.set_state("items", json!({}), Side::A).unwrap();
        }

        let diag = f.manager.diagnostics();
        assert_eq!(diag.watcher_count, 4);
        assert_eq!(diag.paths_watched, vec!["".to_string(), "items".to_string()]);
        assert_eq!(f.a.observer_count(), 2);
        assert_eq!(f.b.observer_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mirrored_removal_unwatches_removed_nodes() {
        let f = fixture(json!({ "x": { "y": 1 } }), json!({ "x": { "y": 1 } }), None);
        assert_eq!(f.manager.diagnostics().watcher_count, 6);

        f.a.remove(&"x".into()).unwrap();
        tokio::time::sleep(Duration::from_millis(210)).await;

        assert_eq!(f.b.snapshot(), json!({}));
        let diag = f.manager.diagnostics();
        assert_eq!(diag.watcher_count, 2);
        assert_eq!(diag.paths_watched, vec!["".to_string()]);

        // A re-created node is still picked up through its watched ancestor.
        f.b.write(&"x.z".into(), json!(2)).unwrap();
        tokio::time::sleep(Duration::from_millis(210)).await;
        assert_eq!(f.a.read(&"x.z".into()), Some(json!(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_on_related_path_during_write_is_reconciled() {
        let f = fixture(json!({ "user": { "name": "x" } }), json!({ "user": { "name": "x" } }), None);
        let b = Arc::clone(&f.b);
        let fired = Arc::new(AtomicBool::new(false));
        let once = Arc::clone(&fired);
        f.a.on_change(
            &"user.name".into(),
            Arc::new(move |_: &StatePath, _: Option<&Value>| {
                if !once.swap(true, Ordering::SeqCst) {
                    b.write(&"user".into(), json!({ "name": "x", "theme": "dark" })).unwrap();
                }
            }),
        );

        f.manager.set_state("user.name", json!("Ada"), Side::A).unwrap();
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(f.b.snapshot(), json!({ "user": { "name": "Ada", "theme": "dark" } }));
        assert_eq!(f.a.read(&"user.theme".into()), None);
        assert_eq!(f.manager.diagnostics().pending_operations, 1);

        tokio::time::sleep(Duration::from_millis(210)).await;
        assert_eq!(f.a.snapshot(), json!({ "user": { "name": "Ada", "theme": "dark" } }));
        assert_eq!(f.a.snapshot(), f.b.snapshot());
        assert!(f.manager.is_healthy());
        assert!(f.manager.diagnostics().paths_watched.contains(&"user.theme".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_and_dropped_trees() {
        let f = fixture(json!({}), json!({}), None);
        f.manager.disconnect();
        let err = f.manager.get_state("x").unwrap_err();
        assert_eq!(err.code, ErrorCode::ComponentInactive);
        assert_eq!(f.a.observer_count(), 0);

        let g = fixture(json!({}), json!({}), None);
        drop(g.a);
        assert!(!g.manager.is_healthy());
        assert_eq!(g.manager.get_state("x").unwrap_err().code, ErrorCode::InvalidState);
    }
}
