//! # Example: bridge_demo
//!
//! Connects two in-memory state trees and shows the bridge keeping them in sync.
//!
//! Shows how to:
//! - Build a [`BridgeCoordinator`] and connect two [`ObservableTree`]s.
//! - Attach the built-in [`LogWriter`] to every reserved event.
//! - Write through the handle, mutate one tree directly, and watch both converge.
//! - Subscribe to a path and read [`Diagnostics`](statebridge::Diagnostics).
//!
//! ## Flow
//! ```text
//! handle.set_state("user.name")  ─► store + view written in one transaction
//!                                └─► 50ms debounce ─► subscriber + state:changed
//! view.write("user.theme")        ─► observer ─► conflict window (200ms)
//!                                └─► mirrored to store ─► subscriber + state:changed
//! ```
//!
//! ## Run
//! ```bash
//! RUST_LOG=debug cargo run --example bridge_demo --features logging
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use statebridge::{
    BridgeConfig, BridgeCoordinator, BridgeEvent, HandlerRef, LogWriter, ObservableTree,
    StatePath, StateTree, SubscribeOptions,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let store: Arc<dyn StateTree> = Arc::new(ObservableTree::new(
        "store",
        json!({ "user": { "name": "anonymous", "theme": "light" } }),
    )?);
    let view: Arc<dyn StateTree> = Arc::new(ObservableTree::empty("view"));

    let coordinator = BridgeCoordinator::new(BridgeConfig::default());
    let handle = coordinator.connect(&store, &view)?;

    let logger: HandlerRef = Arc::new(LogWriter::new());
    for name in [
        BridgeEvent::STATE_CHANGED,
        BridgeEvent::SYNC_CONFLICT,
        BridgeEvent::STATUS_CHANGED,
        BridgeEvent::RECOVERY_STARTED,
        BridgeEvent::RECOVERY_FINISHED,
    ] {
        handle.on(name, Arc::clone(&logger), SubscribeOptions::default().priority(-10))?;
    }

    let _user = handle.subscribe("user", |path, value| {
        tracing::info!(%path, value = ?value, "user changed");
    })?;

    handle.set_state("user.name", json!("ada"))?;
    tracing::info!(view = ?view.read(&StatePath::new("user.name")), "mirrored write");

    view.write(&StatePath::new("user.theme"), json!("dark"))?;
    tokio::time::sleep(Duration::from_millis(400)).await;
    tracing::info!(store = ?store.read(&StatePath::new("user.theme")), "external change mirrored");

    let diagnostics = handle.get_diagnostics()?;
    tracing::info!(
        diagnostics = %serde_json::to_string_pretty(&diagnostics)?,
        trusted = handle.is_trusted(),
        "bridge diagnostics"
    );

    coordinator.disconnect();
    Ok(())
}
