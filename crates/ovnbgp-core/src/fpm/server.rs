//! Loopback accept loop for the routing daemon's FPM connection
//!
//! Each connection runs its own sequential read, decode, transact cycle.
//! A malformed frame closes only that connection.

use super::bridge::RouteBridge;
use super::frame::read_frame_with_timeout;
use crate::config::FpmConfig;
use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Events emitted by the bridge server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    Listening { addr: SocketAddr },

    Connected { peer: String },

    /// A frame's routes were committed
    RoutesCommitted { peer: String, count: usize },

    /// A frame's transaction failed; the connection stays open
    TransactionFailed { peer: String, error: String },

    ConnectionClosed { peer: String, reason: String },

    Stopped,
}

/// Errors after which a connection cannot be trusted to stay in sync
fn closes_connection(err: &Error) -> bool {
    err.is_protocol_violation() || matches!(err, Error::Decode(_) | Error::Io(_))
}

#[derive(Clone)]
pub struct FpmServer {
    bridge: Arc<RouteBridge>,
    addr: SocketAddr,
    read_timeout: Option<Duration>,
    event_tx: mpsc::Sender<BridgeEvent>,
}

impl FpmServer {
    pub fn new(
        bridge: Arc<RouteBridge>,
        config: &FpmConfig,
        event_channel_capacity: usize,
    ) -> Result<(Self, mpsc::Receiver<BridgeEvent>)> {
        if event_channel_capacity == 0 {
            return Err(Error::config("event_channel_capacity must be at least 1"));
        }
        let (tx, rx) = mpsc::channel(event_channel_capacity);
        let server = Self {
            bridge,
            addr: SocketAddr::new(config.listen_addr, config.port),
            read_timeout: config.read_timeout_secs.map(Duration::from_secs),
            event_tx: tx,
        };
        Ok((server, rx))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(self.addr).await?;
        let local = listener.local_addr()?;
        info!("FPM bridge listening on {} ({:?})", local, self.bridge.format());
        self.emit_event(BridgeEvent::Listening { addr: local });
        Ok(listener)
    }

    /// Accept connections until the shutdown signal fires
    ///
    /// Without a signal the loop stops on SIGINT.
    pub async fn run(
        &self,
        listener: TcpListener,
        shutdown_rx: Option<oneshot::Receiver<()>>,
    ) -> Result<()> {
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

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            server.handle_connection(stream, peer.to_string()).await;
                        });
                    }
                    Err(e) => {
                        error!("FPM accept failed: {}", e);
                    }
                },

                _ = &mut shutdown => {
                    info!("FPM bridge shutting down");
                    break;
                }
            }
        }

        self.emit_event(BridgeEvent::Stopped);
        Ok(())
    }

    /// Serve one connection to completion, logging how it ended
    pub async fn handle_connection<S>(&self, stream: S, peer: String)
    where
        S: AsyncRead + Unpin,
    {
        info!("FPM peer {} connected", peer);
        self.emit_event(BridgeEvent::Connected { peer: peer.clone() });

        let reason = match self.serve(stream, &peer).await {
            Ok(total) => {
                info!("FPM peer {} closed after {} route operation(s)", peer, total);
                "peer closed".to_string()
            }
            Err(e) => {
                warn!("Closing FPM connection from {}: {}", peer, e);
                e.to_string()
            }
        };
        self.emit_event(BridgeEvent::ConnectionClosed { peer, reason });
    }

    /// Read frames until end of stream
    ///
    /// Returns the number of committed operations. Transaction failures are
    /// logged and skipped; framing and decode failures end the connection.
    pub async fn serve<S>(&self, mut stream: S, peer: &str) -> Result<usize>
    where
        S: AsyncRead + Unpin,
    {
        let mut total = 0;
        while let Some(frame) = read_frame_with_timeout(&mut stream, self.read_timeout).await? {
            debug!(
                "FPM frame from {}: type {} length {}",
                peer, frame.header.msg_type, frame.header.length
            );
            match self.bridge.handle_frame(&frame).await {
                Ok(0) => {}
                Ok(count) => {
                    total += count;
                    self.emit_event(BridgeEvent::RoutesCommitted {
                        peer: peer.to_string(),
                        count,
                    });
                }
                Err(e) if closes_connection(&e) => return Err(e),
                Err(e) => {
                    error!("FPM frame from {} not applied: {}", peer, e);
                    self.emit_event(BridgeEvent::TransactionFailed {
                        peer: peer.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(total)
    }

    fn emit_event(&self, event: BridgeEvent) {
        if self.event_tx.try_send(event).is_err() {
            warn!("Bridge event channel full, dropping event.");
        }
    }
}
