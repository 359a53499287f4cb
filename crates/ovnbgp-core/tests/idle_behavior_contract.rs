//! Architectural Contract Test: Idle Behavior
//!
//! This test verifies that the dispatcher does no work without
//! notifications, apart from an explicitly configured periodic resync.
//!
//! Constraints verified:
//! - No exposure actions run without notifications
//! - No sync runs when neither startup sync nor resync is configured
//! - A configured resync interval drives resync, never a full reset
//!
//! If this test fails, someone has added:
//! - Polling loops
//! - Background periodic tasks outside the resync timer

mod common;

use common::*;
use ovnbgp_core::config::EngineConfig;
use ovnbgp_core::watcher::{Dispatcher, EventRegistry};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn idle_dispatcher_does_nothing() {
    let actions = RecordingActions::new();
    let config = EngineConfig {
        event_channel_capacity: 100,
        reconcile_interval_secs: 0,
        sync_on_start: false,
    };
    let (dispatcher, _events) = Dispatcher::new(
        Arc::new(IdleSource),
        Arc::new(actions.clone()),
        EventRegistry::with_default_events(true),
        &config,
    )
    .unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let handle = tokio::spawn(async move { dispatcher.run_with_shutdown(Some(shutdown_rx)).await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown_tx.send(()).unwrap();
    handle.await.unwrap().unwrap();

    assert!(actions.calls().is_empty());
    assert_eq!(actions.sync_call_count(), 0);
    assert_eq!(actions.resync_call_count(), 0);
}

#[tokio::test]
async fn resync_interval_triggers_resync() {
    let actions = RecordingActions::new();
    let config = EngineConfig {
        event_channel_capacity: 100,
        reconcile_interval_secs: 1,
        sync_on_start: true,
    };
    let (dispatcher, _events) = Dispatcher::new(
        Arc::new(IdleSource),
        Arc::new(actions.clone()),
        EventRegistry::with_default_events(false),
        &config,
    )
    .unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let handle = tokio::spawn(async move { dispatcher.run_with_shutdown(Some(shutdown_rx)).await });

    tokio::time::sleep(Duration::from_millis(1500)).await;
    shutdown_tx.send(()).unwrap();
    handle.await.unwrap().unwrap();

    assert_eq!(actions.sync_call_count(), 1, "only the startup sync is full");
    assert!(actions.resync_call_count() >= 1);
    assert!(actions.calls().is_empty());
}
