//! # Debounced, prefix-collapsed change notification.
//!
//! Changed paths accumulate in a set. The first scheduled path arms a
//! debounce timer; when it fires the set is drained, paths with a pending
//! ancestor are dropped (`"a"` and `"a.b"` → `"a"`), and every subscriber on
//! `P` is called once per remaining path equal to or below `P`. A
//! `state:changed` event with the collapsed paths is then emitted on the bus.

use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::path::StatePath;
use crate::events::{BridgeEvent, EventBus, StateChanged};
use crate::result::panic_message;

/// Path subscriber callback: the notified path and its current value.
pub type PathCallback = Arc<dyn Fn(&StatePath, Option<&Value>) + Send + Sync>;

/// Reads the current value of a path at flush time.
pub(crate) type ValueReader = Arc<dyn Fn(&StatePath) -> Option<Value> + Send + Sync>;

struct Subscriber {
    id: u64,
    path: StatePath,
    callback: PathCallback,
}

#[derive(Default)]
struct NotifierState {
    pending: BTreeSet<StatePath>,
    timer: Option<JoinHandle<()>>,
    subscribers: Vec<Arc<Subscriber>>,
    next_id: u64,
}

struct Inner {
    debounce: Duration,
    runtime: Handle,
    reader: ValueReader,
    bus: Option<EventBus>,
    state: Mutex<NotifierState>,
    flushes: AtomicU64,
}

/// Debounced path notifier.
#[derive(Clone)]
pub struct SelectiveNotifier {
    inner: Arc<Inner>,
}

/// Handle of a path subscription; [`unsubscribe`](Self::unsubscribe) removes it.
#[derive(Clone)]
pub struct PathSubscription {
    id: u64,
    path: StatePath,
    notifier: Weak<Inner>,
}

impl PathSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &StatePath {
        &self.path
    }

    /// Idempotent; returns `false` when already removed.
    pub fn unsubscribe(&self) -> bool {
        match self.notifier.upgrade() {
            Some(inner) => inner.remove(self.id),
            None => false,
        }
    }
}

impl std::fmt::Debug for PathSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathSubscription")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish()
    }
}

impl SelectiveNotifier {
    pub(crate) fn new(
        debounce: Duration,
        runtime: Handle,
        reader: ValueReader,
        bus: Option<EventBus>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                debounce,
                runtime,
                reader,
                bus,
                state: Mutex::new(NotifierState::default()),
                flushes: AtomicU64::new(0),
            }),
        }
    }

    pub fn subscribe(&self, path: StatePath, callback: PathCallback) -> PathSubscription {
        let mut st = self.inner.state.lock();
        st.next_id += 1;
        let id = st.next_id;
        st.subscribers.push(Arc::new(Subscriber {
            id,
            path: path.clone(),
            callback,
        }));
        PathSubscription {
            id,
            path,
            notifier: Arc::downgrade(&self.inner),
        }
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.inner.remove(id)
    }

    /// Marks `path` changed and arms the debounce timer if idle.
    pub fn schedule(&self, path: StatePath) {
        let mut st = self.inner.state.lock();
        st.pending.insert(path);
        if st.timer.is_none() {
            let weak = Arc::downgrade(&self.inner);
            let delay = self.inner.debounce;
            st.timer = Some(self.inner.runtime.spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(inner) = weak.upgrade() {
                    inner.flush();
                }
            }));
        }
    }

    /// Drops pending paths without notifying.
    pub fn discard_pending(&self) {
        let mut st = self.inner.state.lock();
        st.pending.clear();
        if let Some(timer) = st.timer.take() {
            timer.abort();
        }
    }

    /// Discards pending paths and removes every subscriber.
    pub(crate) fn close(&self) {
        self.discard_pending();
        self.inner.state.lock().subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.state.lock().subscribers.len()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Number of flushes that notified at least one path.
    pub fn flush_count(&self) -> u64 {
        self.inner.flushes.load(Ordering::Relaxed)
    }
}

impl Inner {
    fn remove(&self, id: u64) -> bool {
        let mut st = self.state.lock();
        let before = st.subscribers.len();
        st.subscribers.retain(|s| s.id != id);
        st.subscribers.len() != before
    }

    fn flush(&self) {
        let (paths, subscribers) = {
            let mut st = self.state.lock();
            st.timer = None;
            let pending = std::mem::take(&mut st.pending);
            (collapse(pending), st.subscribers.clone())
        };
        if paths.is_empty() {
            return;
        }
        self.flushes.fetch_add(1, Ordering::Relaxed);

        for path in &paths {
            let value = (self.reader)(path);
            for sub in subscribers.iter().filter(|s| path.is_same_or_descendant_of(&s.path)) {
                let res = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    (sub.callback)(path, value.as_ref())
                }));
                if let Err(panic) = res {
                    tracing::warn!(
                        subscription = sub.id,
                        path = %path,
                        reason = %panic_message(panic.as_ref()),
                        "path subscriber panicked"
                    );
                }
            }
        }

        tracing::debug!(count = paths.len(), "state change notified");
        if let Some(bus) = &self.bus {
            let event = BridgeEvent::StateChanged(StateChanged {
                paths: paths.iter().map(ToString::to_string).collect(),
            });
            if let Err(e) = bus.emit(event) {
                tracing::debug!(error = %e, "state:changed not published");
            }
        }
    }
}

/// Drops every path that has a strict ancestor in the set.
pub fn collapse(pending: BTreeSet<StatePath>) -> Vec<StatePath> {
    pending
        .iter()
        .filter(|p| !pending.iter().any(|other| other.is_ancestor_of(p)))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(paths: &[&str]) -> BTreeSet<StatePath> {
        paths.iter().map(|p| StatePath::new(p)).collect()
    }

    fn strings(paths: Vec<StatePath>) -> Vec<String> {
        paths.into_iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_collapse_keeps_shallowest() {
        assert_eq!(strings(collapse(set(&["a.b", "a", "a-b", "c.d"]))), vec!["a", "a-b", "c.d"]);
        assert_eq!(strings(collapse(set(&["x.y", ""]))), vec![""]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribers_fire_once_per_matching_path() {
        let reader: ValueReader = Arc::new(|p: &StatePath| Some(Value::String(p.to_string())));
        let notifier = SelectiveNotifier::new(Duration::from_millis(50), Handle::current(), reader, None);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        notifier.subscribe(
            "user".into(),
            Arc::new(move |p: &StatePath, v: Option<&Value>| s.lock().push((p.to_string(), v.cloned()))),
        );
        let other = notifier.subscribe("other".into(), Arc::new(|_: &StatePath, _: Option<&Value>| {}));

        notifier.schedule("user.name".into());
        notifier.schedule("user.email".into());
        notifier.schedule("user.name".into());
        tokio::time::sleep(Duration::from_millis(60)).await;

        let got: Vec<String> = seen.lock().iter().map(|(p, _)| p.clone()).collect();
        assert_eq!(got, vec!["user.email", "user.name"]);
        assert_eq!(notifier.flush_count(), 1);

        assert!(other.unsubscribe());
        assert!(!other.unsubscribe());
        assert_eq!(notifier.subscriber_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_subscriber_does_not_block_others() {
        let reader: ValueReader = Arc::new(|_: &StatePath| None);
        let notifier = SelectiveNotifier::new(Duration::from_millis(10), Handle::current(), reader, None);
        let hits = Arc::new(AtomicU64::new(0));
        let h = Arc::clone(&hits);

        notifier.subscribe("".into(), Arc::new(|_: &StatePath, _: Option<&Value>| {
            if true {
                panic!("subscriber bug");
            }
        }));
        notifier.subscribe(
            "a".into(),
            Arc::new(move |_: &StatePath, _: Option<&Value>| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );

        notifier.schedule("a".into());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discard_pending_skips_notification() {
        let reader: ValueReader = Arc::new(|_: &StatePath| None);
        let notifier = SelectiveNotifier::new(Duration::from_millis(10), Handle::current(), reader, None);
        notifier.schedule("a".into());
        notifier.discard_pending();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(notifier.flush_count(), 0);
        assert_eq!(notifier.pending_count(), 0);
    }
}
