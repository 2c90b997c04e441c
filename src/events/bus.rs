//! # Event bus with per-name batching, priorities and guarded handlers.
//!
//! [`EventBus`] delivers [`BridgeEvent`]s to handlers registered by event name.
//! Publishing never blocks: `emit` appends to a batch (or queues a single
//! delivery) and returns; a dedicated dispatcher task invokes handlers.
//!
//! ## Architecture
//! ```text
//! emit(ev) ──► pending[name] ──(delay timer | size threshold)──► flush
//!                                                                  │ snapshot handlers,
//!                                                                  │ drop `once` ones
//!                                                                  ▼
//!                                               [dispatch queue] ─► dispatcher task
//!                                                                  │ priority order
//!                                              ┌───────────────────┼───────────────────┐
//!                                              ▼                   ▼                   ▼
//!                                        handler (p=10)      handler (p=5)       handler (p=0)
//!                                        (timeout guard)
//! ```
//!
//! ## Rules
//! - **Batching**: the first emit for a name opens a window of `batch_delay`; the
//!   batch flushes on the timer or when it reaches `max_batch_size`, whichever first.
//! - **Ordering**: handlers run sequentially by descending priority, ties by
//!   registration order. Deliveries are dispatched in flush order.
//! - **Isolation**: a handler error or panic is logged and counted; remaining
//!   handlers still run.
//! - **Timeout guard**: a handler exceeding its timeout is logged and detached,
//!   not cancelled; dispatch moves on.
//! - **Stall guard**: a handler without a timeout may hold the dispatcher for at
//!   most `stall_timeout`; it is then detached and counted as a failure. A
//!   dispatcher busy with one invocation for longer than `stall_timeout` makes
//!   the bus unhealthy, and `reset` replaces it.
//! - **Snapshots**: dispatch iterates a snapshot, so `off` from inside a handler
//!   is safe and takes effect for the next delivery.
//! - **Clear**: drops handlers and discards pending and queued deliveries.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::event::{BridgeEvent, Event};
use super::handler::{
    Delivery, HandlerRef, SubscribeOptions, Subscription, SubscriptionId,
};
use crate::config::BusConfig;
use crate::error::{BridgeError, ErrorCode};
use crate::result::{BridgeResult, panic_message};

const COMPONENT: &str = "event-bus";

#[derive(Clone)]
struct Registration {
    id: SubscriptionId,
    handler: HandlerRef,
    opts: SubscribeOptions,
}

struct PendingBatch {
    events: Vec<Event>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

struct Dispatch {
    epoch: u64,
    delivery: Delivery,
    targets: Vec<Registration>,
}

/// Counters shared with the dispatcher task.
#[derive(Default)]
struct Counters {
    /// Bumped by `clear`/`reset`; dispatches from an older epoch are discarded.
    epoch: AtomicU64,
    emitted: AtomicU64,
    delivered: AtomicU64,
    handler_failures: AtomicU64,
    failures_since_reset: AtomicU64,
    handler_timeouts: AtomicU64,
    handler_stalls: AtomicU64,
    next_worker: AtomicU64,
    /// Worker id and start of the invocation currently holding the dispatcher.
    running: Mutex<Option<(u64, Instant)>>,
}

impl Counters {
    fn busy_longer_than(&self, bound: Duration) -> bool {
        matches!(*self.running.lock(), Some((_, since)) if since.elapsed() > bound)
    }
}

/// Marks the dispatcher busy for the lifetime of one invocation.
struct RunningMark<'a> {
    counters: &'a Counters,
    worker: u64,
}

impl<'a> RunningMark<'a> {
    fn start(counters: &'a Counters, worker: u64) -> Self {
        *counters.running.lock() = Some((worker, Instant::now()));
        Self { counters, worker }
    }
}

impl Drop for RunningMark<'_> {
    fn drop(&mut self) {
        let mut running = self.counters.running.lock();
        if matches!(*running, Some((id, _)) if id == self.worker) {
            *running = None;
        }
    }
}

struct BusState {
    handlers: HashMap<Arc<str>, Vec<Registration>>,
    pending: HashMap<Arc<str>, PendingBatch>,
    next_id: u64,
    next_generation: u64,
    closed: bool,
    dispatch_tx: mpsc::UnboundedSender<Dispatch>,
    worker: JoinHandle<()>,
}

struct Inner {
    cfg: BusConfig,
    runtime: Handle,
    state: Mutex<BusState>,
    counters: Arc<Counters>,
}

/// Snapshot of bus bookkeeping for diagnostics.
#[derive(Clone, Debug, Default, Serialize)]
pub struct BusDiagnostics {
    pub listener_count: usize,
    /// Event names with at least one handler, sorted.
    pub events: Vec<String>,
    pub pending_batches: usize,
    pub pending_payloads: usize,
    pub emitted: u64,
    pub delivered: u64,
    pub handler_failures: u64,
    pub handler_timeouts: u64,
    /// Handlers detached by the stall guard.
    pub handler_stalls: u64,
}

/// In-process publish/subscribe bus.
///
/// Cheap to clone: clones share the same registry and dispatcher.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    /// Creates a bus and spawns its dispatcher on the current tokio runtime.
    ///
    /// Fails with [`ErrorCode::InitializationFailed`] outside a runtime.
    pub fn new(cfg: BusConfig) -> BridgeResult<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            BridgeError::new(
                ErrorCode::InitializationFailed,
                COMPONENT,
                "new",
                "event bus requires a tokio runtime",
            )
            .with_cause(e)
        })?;

        let counters = Arc::new(Counters::default());
        let (dispatch_tx, worker) = spawn_dispatcher(&runtime, &cfg, Arc::clone(&counters));

        let state = BusState {
            handlers: HashMap::new(),
            pending: HashMap::new(),
            next_id: 0,
            next_generation: 0,
            closed: false,
            dispatch_tx,
            worker,
        };

        Ok(Self {
            inner: Arc::new(Inner {
                cfg,
                runtime,
                state: Mutex::new(state),
                counters,
            }),
        })
    }

    /// Registers `handler` for `event`.
    pub fn on(
        &self,
        event: impl Into<Arc<str>>,
        handler: HandlerRef,
        opts: SubscribeOptions,
    ) -> BridgeResult<Subscription> {
        let event = event.into();
        if event.is_empty() {
            return Err(BridgeError::new(
                ErrorCode::InvalidPayload,
                COMPONENT,
                "on",
                "event name must not be empty",
            ));
        }

        let mut st = self.inner.state.lock();
        if st.closed {
            return Err(BridgeError::inactive(COMPONENT, "on"));
        }

        st.next_id += 1;
        let id = SubscriptionId(st.next_id);
        let list = st.handlers.entry(Arc::clone(&event)).or_default();
        let pos = list.partition_point(|r| r.opts.priority >= opts.priority);
        list.insert(pos, Registration { id, handler, opts });

        tracing::debug!(event = %event, id = id.0, priority = opts.priority, once = opts.once, "handler registered");
        Ok(Subscription::new(id, event))
    }

    /// Registers a handler that is removed before its first invocation.
    pub fn once(
        &self,
        event: impl Into<Arc<str>>,
        handler: HandlerRef,
        opts: SubscribeOptions,
    ) -> BridgeResult<Subscription> {
        self.on(event, handler, opts.once())
    }

    /// Removes a registration by handle or id.
    ///
    /// Idempotent: returns `false` when nothing was registered under the id.
    pub fn off(&self, id: impl Into<SubscriptionId>) -> bool {
        let id = id.into();
        let mut removed = false;
        let mut st = self.inner.state.lock();
        st.handlers.retain(|_, list| {
            if let Some(pos) = list.iter().position(|r| r.id == id) {
                list.remove(pos);
                removed = true;
            }
            !list.is_empty()
        });
        removed
    }

    /// Publishes an event (non-blocking).
    pub fn emit(&self, event: BridgeEvent) -> BridgeResult<()> {
        let name: Arc<str> = Arc::from(event.name());
        let ev = Event::new(event);

        let mut st = self.inner.state.lock();
        if st.closed {
            return Err(BridgeError::inactive(COMPONENT, "emit"));
        }
        self.inner.counters.emitted.fetch_add(1, Ordering::Relaxed);

        if !self.inner.cfg.batching_enabled() {
            self.inner.dispatch_locked(&mut st, name, vec![ev], false);
            return Ok(());
        }

        if !st.pending.contains_key(&name) {
            st.next_generation += 1;
            let generation = st.next_generation;
            let timer = self.inner.spawn_flush_timer(Arc::clone(&name), generation);
            st.pending.insert(
                Arc::clone(&name),
                PendingBatch {
                    events: Vec::new(),
                    generation,
                    timer: Some(timer),
                },
            );
        }

        let threshold = self.inner.cfg.size_threshold();
        let reached = match st.pending.get_mut(&name) {
            Some(batch) => {
                batch.events.push(ev);
                threshold.is_some_and(|n| batch.events.len() >= n)
            }
            None => false,
        };

        if reached {
            if let Some(batch) = st.pending.remove(&name) {
                if let Some(timer) = batch.timer {
                    timer.abort();
                }
                self.inner.dispatch_locked(&mut st, name, batch.events, true);
            }
        }
        Ok(())
    }

    /// Drops every handler and discards pending and queued deliveries.
    pub fn clear(&self) {
        let mut st = self.inner.state.lock();
        st.handlers.clear();
        self.inner.discard_pending(&mut st);
        tracing::debug!("event bus cleared");
    }

    /// Recovery entry point: discards in-flight deliveries, resets the failure
    /// budget and replaces the dispatcher if it stopped or is stalled. Handlers
    /// are kept.
    pub fn reset(&self) {
        let mut st = self.inner.state.lock();
        self.inner.discard_pending(&mut st);
        self.inner
            .counters
            .failures_since_reset
            .store(0, Ordering::Relaxed);

        if st.closed {
            return;
        }
        let stalled = self.inner.is_stalled();
        if st.worker.is_finished() || stalled {
            // Aborting drops the guarded invocation's join handle; the handler
            // itself keeps running detached.
            st.worker.abort();
            *self.inner.counters.running.lock() = None;
            let (tx, worker) = spawn_dispatcher(
                &self.inner.runtime,
                &self.inner.cfg,
                Arc::clone(&self.inner.counters),
            );
            st.dispatch_tx = tx;
            st.worker = worker;
            tracing::info!(stalled, "event bus dispatcher restarted");
        }
    }

    /// Clears the bus and rejects further registrations and emits.
    pub(crate) fn close(&self) {
        let mut st = self.inner.state.lock();
        st.handlers.clear();
        self.inner.discard_pending(&mut st);
        st.closed = true;
        st.worker.abort();
    }

    /// `true` while open, the dispatcher runs and is not stalled, and handler
    /// failures since the last reset stay under `max_handler_failures`.
    pub fn is_healthy(&self) -> bool {
        let st = self.inner.state.lock();
        let failures = self
            .inner
            .counters
            .failures_since_reset
            .load(Ordering::Relaxed);
        !st.closed
            && !st.worker.is_finished()
            && !self.inner.is_stalled()
            && failures < self.inner.cfg.max_handler_failures
    }

    /// Number of handlers registered for `event`, or in total for `None`.
    pub fn listener_count(&self, event: Option<&str>) -> usize {
        let st = self.inner.state.lock();
        match event {
            Some(name) => st.handlers.get(name).map_or(0, Vec::len),
            None => st.handlers.values().map(Vec::len).sum(),
        }
    }

    pub fn diagnostics(&self) -> BusDiagnostics {
        let st = self.inner.state.lock();
        let c = &self.inner.counters;
        let mut events: Vec<String> = st.handlers.keys().map(|k| k.to_string()).collect();
        events.sort_unstable();

        BusDiagnostics {
            listener_count: st.handlers.values().map(Vec::len).sum(),
            events,
            pending_batches: st.pending.len(),
            pending_payloads: st.pending.values().map(|b| b.events.len()).sum(),
            emitted: c.emitted.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            handler_failures: c.handler_failures.load(Ordering::Relaxed),
            handler_timeouts: c.handler_timeouts.load(Ordering::Relaxed),
            handler_stalls: c.handler_stalls.load(Ordering::Relaxed),
        }
    }
}

impl Inner {
    fn is_stalled(&self) -> bool {
        self.cfg
            .stall_guard()
            .is_some_and(|bound| self.counters.busy_longer_than(bound))
    }

    fn spawn_flush_timer(self: &Arc<Self>, name: Arc<str>, generation: u64) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(self);
        let delay = self.cfg.batch_delay;
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.flush(name, generation);
            }
        })
    }

    /// Flushes the batch for `name` if it is still the one the timer was armed for.
    fn flush(&self, name: Arc<str>, generation: u64) {
        let mut st = self.state.lock();
        let current = st
            .pending
            .get(&name)
            .is_some_and(|b| b.generation == generation);
        if !current {
            return;
        }
        if let Some(batch) = st.pending.remove(&name) {
            self.dispatch_locked(&mut st, name, batch.events, true);
        }
    }

    /// Snapshots handlers, removes `once` registrations and queues the delivery.
    fn dispatch_locked(&self, st: &mut BusState, name: Arc<str>, events: Vec<Event>, batched: bool) {
        let targets = match st.handlers.get_mut(&name) {
            Some(list) => {
                let snapshot = list.clone();
                list.retain(|r| !r.opts.once);
                if list.is_empty() {
                    st.handlers.remove(&name);
                }
                snapshot
            }
            None => Vec::new(),
        };

        if targets.is_empty() {
            tracing::trace!(event = %name, count = events.len(), "no handlers, delivery dropped");
            return;
        }

        let dispatch = Dispatch {
            epoch: self.counters.epoch.load(Ordering::Acquire),
            delivery: Delivery::new(name, events, batched),
            targets,
        };
        if st.dispatch_tx.send(dispatch).is_err() {
            self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
            self.counters
                .failures_since_reset
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!("event bus dispatcher is closed, delivery dropped");
        }
    }

    fn discard_pending(&self, st: &mut BusState) {
        for (_, batch) in st.pending.drain() {
            if let Some(timer) = batch.timer {
                timer.abort();
            }
        }
        self.counters.epoch.fetch_add(1, Ordering::AcqRel);
    }
}

/// Time limits applied to one invocation.
#[derive(Clone, Copy)]
struct Guards {
    default_timeout: Option<Duration>,
    stall: Option<Duration>,
}

fn spawn_dispatcher(
    runtime: &Handle,
    cfg: &BusConfig,
    counters: Arc<Counters>,
) -> (mpsc::UnboundedSender<Dispatch>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Dispatch>();
    let guards = Guards {
        default_timeout: cfg.default_handler_timeout(),
        stall: cfg.stall_guard(),
    };
    let worker_id = counters.next_worker.fetch_add(1, Ordering::Relaxed);
    let worker = runtime.spawn(async move {
        while let Some(dispatch) = rx.recv().await {
            for reg in &dispatch.targets {
                if dispatch.epoch != counters.epoch.load(Ordering::Acquire) {
                    break;
                }
                let _busy = RunningMark::start(&counters, worker_id);
                invoke(reg, dispatch.delivery.clone(), guards, &counters).await;
            }
            counters.delivered.fetch_add(1, Ordering::Relaxed);
        }
    });
    (tx, worker)
}

async fn invoke(reg: &Registration, delivery: Delivery, guards: Guards, counters: &Counters) {
    let event: Arc<str> = Arc::from(delivery.name());
    let handler = reg.handler.name().to_string();

    let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| reg.handler.handle(delivery))) {
        Ok(fut) => fut,
        Err(panic) => {
            record_failure(counters, &event, &handler, &panic_message(panic.as_ref()));
            return;
        }
    };

    // The handler runs as its own task so a guard can detach it without
    // cancelling it.
    let mut task = tokio::spawn(AssertUnwindSafe(fut).catch_unwind());
    let (limit, stall) = match reg.opts.timeout.or(guards.default_timeout) {
        Some(limit) => (Some(limit), false),
        None => (guards.stall, true),
    };
    let joined = match limit {
        None => Ok((&mut task).await),
        Some(limit) => tokio::time::timeout(limit, &mut task).await,
    };

    let outcome = match joined {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(join_err)) => {
            record_failure(counters, &event, &handler, &join_err.to_string());
            return;
        }
        Err(_elapsed) if stall => {
            counters.handler_stalls.fetch_add(1, Ordering::Relaxed);
            record_failure(counters, &event, &handler, "handler stalled the dispatcher, detached");
            return;
        }
        Err(_elapsed) => {
            counters.handler_timeouts.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                event = %event,
                handler = %handler,
                timeout_ms = limit.map_or(0, |l| l.as_millis() as u64),
                "handler exceeded its timeout, continuing without it"
            );
            return;
        }
    };

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => record_failure(counters, &event, &handler, &err.to_string()),
        Err(panic) => record_failure(counters, &event, &handler, &panic_message(panic.as_ref())),
    }
}

fn record_failure(counters: &Counters, event: &str, handler: &str, reason: &str) {
    counters.handler_failures.fetch_add(1, Ordering::Relaxed);
    counters
        .failures_since_reset
        .fetch_add(1, Ordering::Relaxed);
    tracing::warn!(event, handler, reason, "event handler failed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::handler::HandlerFn;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;

    type Log = Arc<Mutex<Vec<(String, usize)>>>;

    fn recorder(tag: &'static str, log: Log) -> HandlerRef {
        HandlerFn::arc(tag, move |d: Delivery| {
            let log = Arc::clone(&log);
            async move {
                log.lock().push((tag.to_string(), d.len()));
                Ok::<_, BridgeError>(())
            }
        })
    }

    fn ping(n: u32) -> BridgeEvent {
        BridgeEvent::custom("ping", json!(n))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn tags(log: &Log) -> Vec<String> {
        log.lock().iter().map(|(t, _)| t.clone()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_within_window_are_delivered_as_one_batch() {
        let bus = EventBus::new(BusConfig::default()).unwrap();
        let log: Log = Default::default();
        bus.on("ping", recorder("a", log.clone()), SubscribeOptions::default())
            .unwrap();

        for i in 0..4 {
            bus.emit(ping(i)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(log.lock().is_empty(), "batch must wait for the delay");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*log.lock(), vec![("a".to_string(), 4)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_threshold_flushes_without_waiting() {
        let bus = EventBus::new(BusConfig {
            max_batch_size: 3,
            ..BusConfig::default()
        })
        .unwrap();
        let log: Log = Default::default();
        bus.on("ping", recorder("a", log.clone()), SubscribeOptions::default())
            .unwrap();

        for i in 0..3 {
            bus.emit(ping(i)).unwrap();
        }
        settle().await;
        assert_eq!(*log.lock(), vec![("a".to_string(), 3)]);

        // The aborted timer must not produce a second, empty delivery.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(log.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbatched_delivers_each_emit_singly() {
        let bus = EventBus::new(BusConfig::unbatched()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        bus.on(
            "ping",
            HandlerFn::arc("single", move |d: Delivery| {
                let s = Arc::clone(&s);
                async move {
                    s.lock().push((d.len(), d.is_batch(), d.events()[0].payload.payload()));
                    Ok::<_, BridgeError>(())
                }
            }),
            SubscribeOptions::default(),
        )
        .unwrap();

        bus.emit(ping(1)).unwrap();
        bus.emit(ping(2)).unwrap();
        settle().await;

        assert_eq!(
            *seen.lock(),
            vec![(1, false, json!(1)), (1, false, json!(2))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_handlers_run_by_priority_then_registration_order() {
        let bus = EventBus::new(BusConfig::unbatched()).unwrap();
        let log: Log = Default::default();
        let opts = SubscribeOptions::default();
        bus.on("ping", recorder("low", log.clone()), opts.priority(1)).unwrap();
        bus.on("ping", recorder("high", log.clone()), opts.priority(10)).unwrap();
        bus.on("ping", recorder("mid", log.clone()), opts.priority(5)).unwrap();
        bus.on("ping", recorder("zero-1", log.clone()), opts).unwrap();
        bus.on("ping", recorder("zero-2", log.clone()), opts).unwrap();

        bus.emit(ping(0)).unwrap();
        settle().await;

        assert_eq!(tags(&log), vec!["high", "mid", "low", "zero-1", "zero-2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_once_handler_runs_a_single_time() {
        let bus = EventBus::new(BusConfig::unbatched()).unwrap();
        let log: Log = Default::default();
        bus.once("ping", recorder("once", log.clone()), SubscribeOptions::default())
            .unwrap();
        bus.on("ping", recorder("always", log.clone()), SubscribeOptions::default())
            .unwrap();

        bus.emit(ping(1)).unwrap();
        bus.emit(ping(2)).unwrap();
        settle().await;

        assert_eq!(tags(&log), vec!["once", "always", "always"]);
        assert_eq!(bus.listener_count(Some("ping")), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_handlers_do_not_stop_delivery() {
        let bus = EventBus::new(BusConfig::unbatched()).unwrap();
        let log: Log = Default::default();
        let opts = SubscribeOptions::default();

        bus.on(
            "ping",
            HandlerFn::arc("errs", |_d: Delivery| async {
                Err::<(), _>(BridgeError::new(ErrorCode::Internal, "test", "handle", "nope"))
            }),
            opts.priority(3),
        )
        .unwrap();
        bus.on(
            "ping",
            HandlerFn::arc("panics", |_d: Delivery| async {
                if true {
                    panic!("handler blew up");
                }
                Ok::<_, BridgeError>(())
            }),
            opts.priority(2),
        )
        .unwrap();
        bus.on("ping", recorder("survivor", log.clone()), opts.priority(1))
            .unwrap();

        bus.emit(ping(0)).unwrap();
        settle().await;

        assert_eq!(tags(&log), vec!["survivor"]);
        assert_eq!(bus.diagnostics().handler_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_guard_warns_but_does_not_cancel() {
        let bus = EventBus::new(BusConfig::unbatched()).unwrap();
        let log: Log = Default::default();
        let finished = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&finished);

        bus.on(
            "ping",
            HandlerFn::arc("slow", move |_d: Delivery| {
                let f = Arc::clone(&f);
                async move {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    f.store(true, Ordering::SeqCst);
                    Ok::<_, BridgeError>(())
                }
            }),
            SubscribeOptions::default()
                .priority(10)
                .timeout(Duration::from_millis(100)),
        )
        .unwrap();
        bus.on("ping", recorder("fast", log.clone()), SubscribeOptions::default())
            .unwrap();

        bus.emit(ping(0)).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(tags(&log), vec!["fast"]);
        assert!(!finished.load(Ordering::SeqCst));
        assert_eq!(bus.diagnostics().handler_timeouts, 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(finished.load(Ordering::SeqCst), "slow handler keeps running");
    }

    fn stuck(name: &'static str) -> HandlerRef {
        HandlerFn::arc(name, |_d: Delivery| async {
            futures::future::pending::<()>().await;
            Ok::<_, BridgeError>(())
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_handler_is_detached_and_other_events_keep_flowing() {
        let bus = EventBus::new(BusConfig::unbatched()).unwrap();
        let log: Log = Default::default();
        bus.on("slow", stuck("stuck"), SubscribeOptions::default()).unwrap();
        bus.on("other", recorder("other", log.clone()), SubscribeOptions::default())
            .unwrap();

        bus.emit(BridgeEvent::custom("slow", json!(null))).unwrap();
        for i in 0..5 {
            bus.emit(BridgeEvent::custom("other", json!(i))).unwrap();
        }
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(log.lock().len(), 5);
        assert_eq!(bus.diagnostics().handler_stalls, 1);
        assert!(bus.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatcher_held_past_stall_bound_is_unhealthy_until_reset() {
        let bus = EventBus::new(BusConfig::unbatched()).unwrap();
        let log: Log = Default::default();
        bus.on(
            "slow",
            stuck("stuck"),
            SubscribeOptions::default().timeout(Duration::from_secs(3600)),
        )
        .unwrap();
        bus.on("other", recorder("other", log.clone()), SubscribeOptions::default())
            .unwrap();

        bus.emit(BridgeEvent::custom("slow", json!(null))).unwrap();
        bus.emit(BridgeEvent::custom("other", json!(0))).unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(log.lock().is_empty());
        assert!(!bus.is_healthy());

        bus.reset();
        assert!(bus.is_healthy());
        bus.emit(BridgeEvent::custom("other", json!(1))).unwrap();
        settle().await;
        assert_eq!(log.lock().len(), 1);
        assert!(bus.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_off_accepts_handle_or_id_and_is_idempotent() {
        let bus = EventBus::new(BusConfig::unbatched()).unwrap();
        let log: Log = Default::default();
        let a = bus
            .on("ping", recorder("a", log.clone()), SubscribeOptions::default())
            .unwrap();
        let b = bus
            .on("ping", recorder("b", log.clone()), SubscribeOptions::default())
            .unwrap();

        assert!(bus.off(&a));
        assert!(!bus.off(&a));
        assert!(bus.off(b.id()));
        assert!(!bus.off(b));
        assert_eq!(bus.listener_count(None), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_off_from_inside_a_handler_applies_to_next_delivery() {
        let bus = EventBus::new(BusConfig::unbatched()).unwrap();
        let log: Log = Default::default();
        let victim = bus
            .on("ping", recorder("victim", log.clone()), SubscribeOptions::default())
            .unwrap();

        let bus2 = bus.clone();
        let victim_id = victim.id();
        bus.on(
            "ping",
            HandlerFn::arc("remover", move |_d: Delivery| {
                let bus = bus2.clone();
                async move {
                    bus.off(victim_id);
                    Ok::<_, BridgeError>(())
                }
            }),
            SubscribeOptions::default().priority(10),
        )
        .unwrap();

        bus.emit(ping(1)).unwrap();
        settle().await;
        bus.emit(ping(2)).unwrap();
        settle().await;

        assert_eq!(tags(&log), vec!["victim"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_discards_pending_batches() {
        let bus = EventBus::new(BusConfig::default()).unwrap();
        let log: Log = Default::default();
        bus.on("ping", recorder("a", log.clone()), SubscribeOptions::default())
            .unwrap();

        bus.emit(ping(1)).unwrap();
        bus.clear();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(log.lock().is_empty());
        assert_eq!(bus.diagnostics().pending_batches, 0);
        assert_eq!(bus.listener_count(None), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_budget_drives_health_and_reset_restores_it() {
        let bus = EventBus::new(BusConfig {
            max_handler_failures: 2,
            ..BusConfig::unbatched()
        })
        .unwrap();
        bus.on(
            "ping",
            HandlerFn::arc("errs", |_d: Delivery| async {
                Err::<(), _>(BridgeError::new(ErrorCode::Internal, "test", "handle", "nope"))
            }),
            SubscribeOptions::default(),
        )
        .unwrap();

        assert!(bus.is_healthy());
        bus.emit(ping(1)).unwrap();
        bus.emit(ping(2)).unwrap();
        settle().await;
        assert!(!bus.is_healthy());

        bus.reset();
        assert!(bus.is_healthy());
        assert_eq!(bus.listener_count(Some("ping")), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_bus_rejects_emit_and_on() {
        let bus = EventBus::new(BusConfig::default()).unwrap();
        bus.close();

        let err = bus.emit(ping(1)).unwrap_err();
        assert_eq!(err.code, ErrorCode::ComponentInactive);
        assert!(bus.on("ping", recorder("a", Default::default()), SubscribeOptions::default()).is_err());
        assert!(!bus.is_healthy());
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        let err = EventBus::new(BusConfig::default()).err().map(|e| e.code);
        assert_eq!(err, Some(ErrorCode::InitializationFailed));
    }
}
