//! Bridge events: typed payloads, handlers and the batching bus.
//!
//! ## Contents
//! - [`BridgeEvent`], [`Event`]: event names, payload shapes and envelope
//! - [`Handler`], [`HandlerFn`], [`SubscribeOptions`]: the consumer side
//! - [`EventBus`]: batching publish/subscribe with priorities and timeouts
//!
//! ## Quick reference
//! - **Publishers**: `DualStateManager` (`state:changed`, `sync:conflict`),
//!   `HealthSupervisor` (`bridge:status-changed`, `recovery:*`) and the host
//!   through `BridgeHandle::emit`.
//! - **Consumers**: host handlers registered through `BridgeHandle::on`.

mod bus;
mod event;
mod handler;
#[cfg(feature = "logging")]
mod log;

pub use bus::{BusDiagnostics, EventBus};
pub(crate) use event::epoch_millis;
pub use event::{
    BridgeEvent, Event, RecoveryFinished, RecoveryStarted, StateChanged, StatusChanged,
    SyncConflict,
};
pub use handler::{
    BoxHandlerFuture, Delivery, Handler, HandlerFn, HandlerRef, SubscribeOptions, Subscription,
    SubscriptionId,
};
#[cfg(feature = "logging")]
pub use log::LogWriter;
