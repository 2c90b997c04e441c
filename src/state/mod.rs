//! Dual-state synchronization.
//!
//! ## Contents
//! - [`StatePath`], [`Side`], [`UpdateOperation`]: addressing and operations
//! - [`StateTree`], [`ObservableTree`]: the observed containers
//! - [`ConflictResolver`]: windowed last-write-wins
//! - [`SelectiveNotifier`], [`PathSubscription`]: debounced path notification
//! - [`DualStateManager`]: mirrors writes, resolves conflicts, owns transactions

mod manager;
mod notifier;
mod operation;
mod path;
mod resolver;
mod transaction;
mod tree;

pub use manager::{DualStateManager, ManagerDiagnostics};
pub use notifier::{PathCallback, PathSubscription, SelectiveNotifier, collapse};
pub use operation::{Side, UpdateOperation};
pub use path::StatePath;
pub use resolver::{Conflict, ConflictResolver, ResolvedCycle, resolve};
pub use tree::{ChangeObserver, ObservableTree, ObserverId, StateTree};
