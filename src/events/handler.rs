//! # Event handlers and subscription options.
//!
//! [`Handler`] is the extension point for reacting to bus deliveries. A handler
//! receives a [`Delivery`]: the batch of [`Event`]s flushed for one event name
//! (a single event when batching is disabled).
//!
//! [`HandlerFn`] wraps a closure `F: Fn(Delivery) -> Fut`, producing a fresh
//! future per delivery. Shared state goes through an explicit `Arc<...>` inside
//! the closure.
//!
//! ## Example
//! ```rust
//! use statebridge::{BridgeError, Delivery, HandlerFn, HandlerRef};
//!
//! let h: HandlerRef = HandlerFn::arc("printer", |d: Delivery| async move {
//!     for ev in d.events() {
//!         println!("{} #{}", ev.name(), ev.seq);
//!     }
//!     Ok::<_, BridgeError>(())
//! });
//! assert_eq!(h.name(), "printer");
//! ```

use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use super::event::Event;
use crate::result::BridgeResult;

/// Boxed future returned by [`Handler::handle`].
pub type BoxHandlerFuture = BoxFuture<'static, BridgeResult<()>>;

/// Shared handle to a handler.
pub type HandlerRef = Arc<dyn Handler>;

/// Contract for bus handlers.
///
/// The returned future is owned (`'static`) so the bus can detach it when a
/// timeout guard fires without cancelling it.
pub trait Handler: Send + Sync + 'static {
    /// Human-readable name (for logs).
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Creates the future handling one delivery.
    fn handle(&self, delivery: Delivery) -> BoxHandlerFuture;
}

/// Function-backed handler.
pub struct HandlerFn<F> {
    name: Cow<'static, str>,
    f: F,
}

impl<F> HandlerFn<F> {
    pub fn new(name: impl Into<Cow<'static, str>>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }

    /// Creates the handler and returns it as a shared handle.
    pub fn arc(name: impl Into<Cow<'static, str>>, f: F) -> Arc<Self> {
        Arc::new(Self::new(name, f))
    }
}

impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = BridgeResult<()>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, delivery: Delivery) -> BoxHandlerFuture {
        Box::pin((self.f)(delivery))
    }
}

/// Events flushed together for one event name.
#[derive(Clone, Debug)]
pub struct Delivery {
    name: Arc<str>,
    events: Arc<[Event]>,
    batched: bool,
}

impl Delivery {
    pub(crate) fn new(name: Arc<str>, events: Vec<Event>, batched: bool) -> Self {
        Self {
            name,
            events: events.into(),
            batched,
        }
    }

    /// Event name all events in this delivery share.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Delivered events in emit order.
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// `true` when produced by a batch flush (even a batch of one).
    pub fn is_batch(&self) -> bool {
        self.batched
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Registration options.
///
/// - `once`: deregister before the first invocation
/// - `priority`: higher runs first (ties by registration order)
/// - `timeout`: warn when the handler runs longer (falls back to the bus default)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub once: bool,
    pub priority: i32,
    pub timeout: Option<Duration>,
}

impl SubscribeOptions {
    #[inline]
    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    #[inline]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[inline]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Identifier of a bus registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub(crate) u64);

impl SubscriptionId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

/// Handle returned by [`EventBus::on`](crate::EventBus::on).
///
/// Pass it (or its [`id`](Subscription::id)) to [`EventBus::off`](crate::EventBus::off).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscription {
    id: SubscriptionId,
    event: Arc<str>,
}

impl Subscription {
    pub(crate) fn new(id: SubscriptionId, event: Arc<str>) -> Self {
        Self { id, event }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn event(&self) -> &str {
        &self.event
    }
}

impl From<&Subscription> for SubscriptionId {
    fn from(s: &Subscription) -> Self {
        s.id
    }
}

impl From<Subscription> for SubscriptionId {
    fn from(s: Subscription) -> Self {
        s.id
    }
}
