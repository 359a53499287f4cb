//! Notification dispatcher
//!
//! The Dispatcher is responsible for:
//! - Consuming southbound notifications in commit order
//! - Evaluating every registered row event against each notification
//! - Running the matched actions on the exposure controller, one at a time
//! - Triggering the startup sync and periodic resyncs
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────┐
//! │ NotificationSource │─── Notification ───┐
//! └────────────────────┘                    │
//!                                           ▼
//!                                   ┌──────────────┐
//!                                   │  Dispatcher  │
//!                                   └──────────────┘
//!                                           │
//!         ┌─────────────────────────────────┼──────────────────────────┐
//!         │                                 │                          │
//!         ▼                                 ▼                          ▼
//! ┌───────────────┐               ┌──────────────────┐         ┌─────────────┐
//! │ EventRegistry │               │ ExposureActions  │         │   Events    │
//! │ (match)       │               │ (run)            │         │  (notify)   │
//! └───────────────┘               └──────────────────┘         └─────────────┘
//! ```
//!
//! ## Event Flow
//!
//! 1. Notification received
//! 2. Filter registered events by table and kind
//! 3. Evaluate each predicate against a fresh [`AgentView`]
//! 4. Run matched actions sequentially; failures are logged and skipped
//! 5. Emit event for monitoring/logging

pub mod events;
pub mod registry;

pub use events::RowEvent;
pub use registry::EventRegistry;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::ovn::{Notification, NotificationKind, Row};
use crate::traits::{AgentView, ExposureActions, NotificationSource};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval};
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

/// Events emitted by the Dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEvent {
    /// Dispatcher started
    Started { events_registered: usize },

    /// A full sync finished
    SyncCompleted,

    /// A full sync failed
    SyncFailed { error: String },

    /// A row event matched a notification
    Matched {
        event: &'static str,
        kind: NotificationKind,
        row: String,
    },

    /// A matched action returned an error
    ActionFailed {
        event: &'static str,
        row: String,
        error: String,
    },

    /// Dispatcher stopped
    Stopped { reason: String },
}

/// Human-readable row identity for logs
fn row_label(row: &Row) -> String {
    match row {
        Row::PortBinding(pb) => pb.name().to_string(),
        Row::LoadBalancer(lb) => lb.name().to_string(),
        Row::Chassis(c) | Row::ChassisPrivate(c) => c.name.clone().unwrap_or_default(),
    }
}

/// Sequential notification dispatcher
///
/// ## Lifecycle
///
/// 1. Create with [`Dispatcher::new()`]
/// 2. Start with [`Dispatcher::run()`]
/// 3. Runs until the stream closes or a shutdown signal is received
///
/// ## Ordering
///
/// Notifications are handled one at a time in arrival order. A later
/// notification never starts before every action for an earlier one has
/// returned.
pub struct Dispatcher {
    source: Arc<dyn NotificationSource>,

    agent: Arc<dyn ExposureActions>,

    registry: EventRegistry,

    /// Seconds between periodic resyncs (0 disables)
    reconcile_interval_secs: u64,

    sync_on_start: bool,

    /// Event sender for external monitoring
    event_tx: mpsc::Sender<DispatchEvent>,
}

impl Dispatcher {
    /// Create a new dispatcher
    ///
    /// # Returns
    ///
    /// A tuple of (dispatcher, event_receiver) where event_receiver yields
    /// dispatch events
    pub fn new(
        source: Arc<dyn NotificationSource>,
        agent: Arc<dyn ExposureActions>,
        registry: EventRegistry,
        config: &EngineConfig,
    ) -> Result<(Self, mpsc::Receiver<DispatchEvent>)> {
        if config.event_channel_capacity == 0 {
            return Err(Error::config("event_channel_capacity must be at least 1"));
        }

        let (tx, rx) = mpsc::channel(config.event_channel_capacity);

        let dispatcher = Self {
            source,
            agent,
            registry,
            reconcile_interval_secs: config.reconcile_interval_secs,
            sync_on_start: config.sync_on_start,
            event_tx: tx,
        };

        Ok((dispatcher, rx))
    }

    pub fn registry(&self) -> &EventRegistry {
        &self.registry
    }

    /// Run the dispatcher until SIGINT or the stream closes
    ///
    /// # Returns
    ///
    /// - `Ok(())`: Clean shutdown
    /// - `Err(Error)`: The startup sync failed
    pub async fn run(&self) -> Result<()> {
        self.run_internal(None).await
    }

    /// Run with a caller-controlled shutdown signal
    ///
    /// Used by tests and by the daemon, which owns signal handling.
    pub async fn run_with_shutdown(&self, shutdown_rx: Option<oneshot::Receiver<()>>) -> Result<()> {
        self.run_internal(shutdown_rx).await
    }

    async fn run_internal(&self, shutdown_rx: Option<oneshot::Receiver<()>>) -> Result<()> {
        self.emit_event(DispatchEvent::Started {
            events_registered: self.registry.len(),
        });

        // Subscribe before syncing so changes made during the sync are queued
        let mut stream = self.source.watch();

        if self.sync_on_start {
            if let Err(e) = self.agent.sync().await {
                error!("Initial sync failed: {}", e);
                self.emit_event(DispatchEvent::SyncFailed {
                    error: e.to_string(),
                });
                self.emit_event(DispatchEvent::Stopped {
                    reason: "Initial sync failed".to_string(),
                });
                return Err(e);
            }
            info!("Initial sync completed");
            self.emit_event(DispatchEvent::SyncCompleted);
        }

        let mut ticker = self.reconcile_ticker();

        let shutdown = async move {
            match shutdown_rx {
                Some(rx) => {
                    let _ = rx.await;
                }
                None => {
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        };
        tokio::pin!(shutdown);

        let reason = loop {
            tokio::select! {
                next = stream.next() => match next {
                    Some(notification) => {
                        self.dispatch(&notification).await;
                    }
                    None => break "Notification stream closed",
                },

                _ = tick(ticker.as_mut()) => {
                    debug!("Periodic resync");
                    match self.agent.resync().await {
                        Ok(()) => self.emit_event(DispatchEvent::SyncCompleted),
                        Err(e) => {
                            error!("Periodic resync failed: {}", e);
                            self.emit_event(DispatchEvent::SyncFailed {
                                error: e.to_string(),
                            });
                        }
                    }
                }

                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break "Shutdown signal";
                }
            }
        };

        self.emit_event(DispatchEvent::Stopped {
            reason: reason.to_string(),
        });
        info!("Dispatcher stopped: {}", reason);
        Ok(())
    }

    /// Handle one notification
    ///
    /// Returns the number of events that matched. Action errors are logged
    /// with the row identity and do not stop the remaining events.
    pub async fn dispatch(&self, notification: &Notification) -> usize {
        let row = row_label(&notification.row);
        debug!(
            "Notification: {} {} {}",
            notification.kind,
            notification.table(),
            row
        );

        let mut matched = 0;
        for event in self.registry.candidates(notification) {
            let view: AgentView = self.agent.view().await;
            if !event.matches(notification, &view) {
                continue;
            }
            matched += 1;

            debug!("Event {} matched {}", event.name(), row);
            self.emit_event(DispatchEvent::Matched {
                event: event.name(),
                kind: notification.kind,
                row: row.clone(),
            });

            if let Err(e) = event.run(notification, self.agent.as_ref()).await {
                error!(
                    "Event {} failed for {} row {}: {}",
                    event.name(),
                    notification.table(),
                    row,
                    e
                );
                self.emit_event(DispatchEvent::ActionFailed {
                    event: event.name(),
                    row: row.clone(),
                    error: e.to_string(),
                });
            }
        }
        matched
    }

    fn reconcile_ticker(&self) -> Option<Interval> {
        if self.reconcile_interval_secs == 0 {
            return None;
        }
        let period = Duration::from_secs(self.reconcile_interval_secs);
        Some(tokio::time::interval_at(Instant::now() + period, period))
    }

    fn emit_event(&self, event: DispatchEvent) {
        if self.event_tx.try_send(event).is_err() {
            warn!("Event channel full, dropping event. Consider increasing event_channel_capacity.");
        }
    }
}

/// Next tick of an optional interval; pending forever when disabled
async fn tick(ticker: Option<&mut Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ovn::ChassisRow;

    #[test]
    fn test_row_label() {
        let row = Row::Chassis(ChassisRow::new("chassis-a"));
        assert_eq!(row_label(&row), "chassis-a");
        let row = Row::ChassisPrivate(ChassisRow::default());
        assert_eq!(row_label(&row), "");
    }

    #[test]
    fn test_dispatch_event_clone() {
        let event = DispatchEvent::Matched {
            event: "fip_set",
            kind: NotificationKind::Update,
            row: "patch".into(),
        };
        assert_eq!(event.clone(), event);
    }

    #[tokio::test]
    async fn test_disabled_ticker_never_fires() {
        let fired = tokio::time::timeout(Duration::from_millis(20), tick(None)).await;
        assert!(fired.is_err());
    }
}
