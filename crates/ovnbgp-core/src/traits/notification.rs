// # Notification Source Trait
//
// Delivers southbound change notifications in database order.
//
// ## Usage
//
// ```rust,ignore
// use ovnbgp_core::NotificationSource;
// use tokio_stream::StreamExt;
//
// let mut stream = source.watch();
// while let Some(notification) = stream.next().await {
//     println!("{} on {}", notification.kind, notification.table());
// }
// ```

use crate::config::BackendConfig;
use crate::ovn::Notification;
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::Stream;

/// Source of southbound change notifications
///
/// The stream must preserve the order in which the database committed the
/// changes; the dispatcher relies on it when comparing `row` against `old`.
pub trait NotificationSource: Send + Sync {
    /// Stream of notifications; ends when the source is closed
    fn watch(&self) -> Pin<Box<dyn Stream<Item = Notification> + Send + 'static>>;
}

/// Helper trait for constructing notification sources from configuration
pub trait NotificationSourceFactory: Send + Sync {
    fn create(&self, config: &BackendConfig) -> crate::Result<Arc<dyn NotificationSource>>;
}
