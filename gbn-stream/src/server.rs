//! UDP streaming server.
//!
//! One socket serves every client.  The accept loop is the only owner of the
//! routing table (`peer address → session queue`):
//!
//! ```text
//!                       ┌──────────── routes ────────────┐
//!  UdpSocket ─recv_from─▶ known peer?  ── yes ──▶ mpsc ──▶ session task (PeerChannel)
//!                       │      │ no                       │
//!                       │      ├─ looks like a GBN packet ─▶ dropped (stale)
//!                       │      └─ otherwise ── spawn new session ──────────┘
//!                       └────────────────────────────────┘
//! ```
//!
//! Session tasks live in a [`JoinSet`]; when one finishes its route is
//! removed, so a later `PLAY` from the same address starts a fresh session.

use std::collections::HashMap;
use std::future::{pending, Future};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::channel::{PeerChannel, MAX_DATAGRAM};
use crate::config::{ConfigError, TransportConfig};
use crate::metrics::MetricsSink;
use crate::packet::Packet;
use crate::session::{Session, SessionId};
use crate::source::ByteSource;

/// Datagrams buffered per session before the accept loop starts dropping.
const PEER_QUEUE: usize = 256;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

struct Route {
    id: SessionId,
    inbound: mpsc::Sender<Vec<u8>>,
}

pub struct Server<S> {
    socket: Arc<UdpSocket>,
    source: Arc<S>,
    config: TransportConfig,
    metrics: Arc<dyn MetricsSink>,
}

impl<S> Server<S>
where
    S: ByteSource + 'static,
{
    pub async fn bind(
        addr: SocketAddr,
        source: S,
        config: TransportConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        let socket = UdpSocket::bind(addr).await?;
        log::info!("[server] listening on {}", socket.local_addr()?);
        Ok(Self {
            socket: Arc::new(socket),
            source: Arc::new(source),
            config,
            metrics,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve until the socket fails.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(pending()).await
    }

    /// Serve until `shutdown` resolves; running sessions are aborted.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut routes: HashMap<SocketAddr, Route> = HashMap::new();
        let mut sessions: JoinSet<(SocketAddr, SessionId)> = JoinSet::new();
        let mut next_id: SessionId = 0;
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("[server] shutting down ({} session(s) active)", sessions.len());
                    break;
                }

                Some(done) = sessions.join_next(), if !sessions.is_empty() => {
                    match done {
                        Ok((peer, id)) => {
                            if routes.get(&peer).is_some_and(|r| r.id == id) {
                                routes.remove(&peer);
                            }
                        }
                        Err(e) => log::warn!("[server] session task failed: {e}"),
                    }
                }

                received = self.socket.recv_from(&mut buf) => {
                    let (n, peer) = received?;
                    let datagram = buf[..n].to_vec();

                    let datagram = match routes.get(&peer) {
                        Some(route) => match route.inbound.try_send(datagram) {
                            Ok(()) => continue,
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                log::debug!("[server] queue full for {peer}; dropping");
                                continue;
                            }
                            // Session already gone: this is a new request.
                            Err(mpsc::error::TrySendError::Closed(datagram)) => {
                                routes.remove(&peer);
                                datagram
                            }
                        },
                        None => datagram,
                    };

                    if Packet::decode(&datagram).is_ok() {
                        log::debug!("[server] stray transport packet from {peer}; dropping");
                        continue;
                    }

                    let id = next_id;
                    next_id += 1;
                    let (tx, rx) = mpsc::channel(PEER_QUEUE);
                    // Fresh queue with capacity; cannot fail.
                    let _ = tx.try_send(datagram);
                    routes.insert(peer, Route { id, inbound: tx });

                    let channel = PeerChannel::new(Arc::clone(&self.socket), peer, rx);
                    let mut session = Session::new(
                        id,
                        channel,
                        Arc::clone(&self.source),
                        self.config.clone(),
                        Arc::clone(&self.metrics),
                    );
                    log::debug!("[server] session {id} for {peer}");
                    sessions.spawn(async move {
                        match session.run().await {
                            Ok(report) => log::info!(
                                "[session {id}] closed with {}",
                                report.response.status_line()
                            ),
                            Err(e) => log::warn!("[session {id}] failed: {e}"),
                        }
                        (peer, id)
                    });
                }
            }
        }
        Ok(())
    }
}
