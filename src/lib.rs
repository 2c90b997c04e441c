//! # statebridge
//!
//! **Statebridge** keeps two independently-owned state trees in sync.
//!
//! It pairs a batched, prioritized event bus with a dual-state manager that
//! mirrors writes transactionally, resolves concurrent edits last-write-wins,
//! and notifies path subscribers with debounced, collapsed change sets. A
//! health supervisor watches both and runs ordered recovery when they fail.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!   ┌──────────────┐                                  ┌──────────────┐
//!   │  StateTree A │                                  │  StateTree B │
//!   │   (store)    │                                  │    (view)    │
//!   └──────┬───────┘                                  └──────┬───────┘
//!          │ observers                                      │ observers
//!          ▼                                                ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  DualStateManager                                                 │
//! │  - Transaction (write both sides or roll both back)               │
//! │  - ConflictResolver (200ms window, last write wins)               │
//! │  - SelectiveNotifier (50ms debounce, prefix-collapsed paths)      │
//! └──────┬──────────────────────────────────────────────┬─────────────┘
//!        │ state:changed / sync:conflict                │ path callbacks
//!        ▼                                              ▼
//! ┌──────────────────────────────┐               PathSubscription(s)
//! │  EventBus                    │
//! │  - per-name batch windows    │◄──── bridge:status-changed
//! │  - priority-ordered handlers │      recovery:started / finished
//! │  - once / timeout / off      │                 ▲
//! └──────────────┬───────────────┘                 │
//!                ▼                                 │
//!        Handler(s) (isolated)        ┌────────────┴─────────────┐
//!                                     │  HealthSupervisor        │
//!                                     │  - periodic checks       │
//!                                     │  - status state machine  │
//!                                     │  - ordered strategies    │
//!                                     └──────────────────────────┘
//!
//!  BridgeCoordinator ──connect(a, b)──► BridgeHandle (single host surface)
//! ```
//!
//! ### Write path
//! ```text
//! handle.set_state(path, v)
//!   ├─► both sides already v ─► no-op
//!   ├─► txn: write source ─► write opposite
//!   │       └─ error/panic ─► restore both ─► Err(SyncError, recoverable)
//!   ├─► record op in an open conflict window
//!   └─► schedule(path) ─► debounce ─► collapse ─► callbacks ─► state:changed
//!
//! external tree mutation
//!   └─► observer ─► enqueue op ─► window closes ─► resolve per path
//!                                   ├─► losers ─► sync:conflict
//!                                   └─► winner ─► mirror ─► schedule(path)
//! ```
//!
//! ## Features
//! | Area                | Description                                                   | Key types                          |
//! |---------------------|---------------------------------------------------------------|------------------------------------|
//! | **Results**         | Error envelope, panic capture, recovery combinator            | [`BridgeResult`], [`BridgeError`]  |
//! | **Events**          | Batched, prioritized, isolated delivery                       | [`EventBus`], [`BridgeEvent`]      |
//! | **Handlers**        | Function-backed or custom handlers with once/timeout options  | [`Handler`], [`HandlerFn`]         |
//! | **State**           | Mirrored trees, transactions, LWW conflicts, path watchers    | [`DualStateManager`], [`StateTree`]|
//! | **Health**          | Periodic checks, status machine, ordered recovery             | [`HealthSupervisor`]               |
//! | **Composition**     | One connect call, one handle, diagnostics                     | [`BridgeCoordinator`], [`BridgeHandle`] |
//!
//! ## Optional features
//! - `logging`: exports [`LogWriter`], a bus handler that traces every bridge event.
//!
//! ```rust
//! use std::sync::Arc;
//! use serde_json::json;
//! use statebridge::{BridgeConfig, BridgeCoordinator, ObservableTree, StateTree};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store: Arc<dyn StateTree> = Arc::new(ObservableTree::empty("store"));
//!     let view: Arc<dyn StateTree> = Arc::new(ObservableTree::empty("view"));
//!
//!     let coordinator = BridgeCoordinator::new(BridgeConfig::default());
//!     let handle = coordinator.connect(&store, &view)?;
//!
//!     handle.set_state("user.name", json!("ada"))?;
//!     assert_eq!(view.read(&"user.name".into()), Some(json!("ada")));
//!
//!     coordinator.disconnect();
//!     assert!(!handle.is_active());
//!     Ok(())
//! }
//! ```
mod config;
mod core;
mod error;
mod events;
mod health;
mod result;
mod state;

// ---- Public re-exports ----

pub use config::{BridgeConfig, BusConfig, HealthConfig, SyncConfig};
pub use core::{BridgeCoordinator, BridgeHandle, ComponentDiagnostics, Diagnostics, HealthDiagnostics};
pub use error::{BridgeError, ErrorCode, TreeError};
pub use events::{
    BoxHandlerFuture, BridgeEvent, BusDiagnostics, Delivery, Event, EventBus, Handler, HandlerFn,
    HandlerRef, RecoveryFinished, RecoveryStarted, StateChanged, StatusChanged, SubscribeOptions,
    Subscription, SubscriptionId, SyncConflict,
};
pub use health::{
    BridgeState, BridgeStatus, CheckFn, HealthCheck, HealthSupervisor, RecoveryStrategy, StrategyFn,
    StrategyRef,
};
pub use result::{BridgeResult, execute, execute_async, unwrap, with_recovery};
pub use state::{
    ChangeObserver, Conflict, ConflictResolver, DualStateManager, ManagerDiagnostics, ObservableTree,
    ObserverId, PathCallback, PathSubscription, ResolvedCycle, SelectiveNotifier, Side, StatePath,
    StateTree, UpdateOperation, collapse, resolve,
};

// Optional: expose a built-in logging handler (demo/reference).
// Enable with: `--features logging`
#[cfg(feature = "logging")]
pub use events::LogWriter;
