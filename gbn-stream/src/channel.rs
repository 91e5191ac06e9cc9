//! Unreliable datagram channels.
//!
//! The transport needs exactly two things from the network: send one
//! datagram, and wait for the next one.  [`Channel`] captures that contract
//! and promises nothing else: datagrams may be dropped, duplicated, delayed,
//! reordered, or corrupted.
//!
//! Implementations:
//! - [`UdpChannel`]: a UDP socket talking to one peer (client side).
//! - [`PeerChannel`]: one peer's slice of a shared server socket; inbound
//!   datagrams are routed to it by [`crate::server`].
//! - [`MemoryChannel`]: an in-process pair for tests.
//! - [`crate::simulator::LossyChannel`]: fault injection around any of the above.
//!
//! All methods take `&self` so a channel can be shared by reference inside
//! one task's `select!` loop.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};

/// Maximum UDP payload size (theoretical limit; in practice kept much smaller).
pub const MAX_DATAGRAM: usize = 65_535;

pub trait Channel: Send + Sync {
    /// Send one datagram.  Success means "handed to the network", not
    /// "delivered".
    fn send(&self, datagram: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    /// Wait for the next datagram.  An error means the channel is gone.
    fn recv(&self) -> impl Future<Output = io::Result<Vec<u8>>> + Send;
}

impl<C: Channel> Channel for Arc<C> {
    fn send(&self, datagram: &[u8]) -> impl Future<Output = io::Result<()>> + Send {
        (**self).send(datagram)
    }

    fn recv(&self) -> impl Future<Output = io::Result<Vec<u8>>> + Send {
        (**self).recv()
    }
}

fn disconnected() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "channel closed")
}

// ---------------------------------------------------------------------------
// UdpChannel
// ---------------------------------------------------------------------------

/// A UDP socket talking to a single peer.
///
/// Datagrams from any other address are dropped.  The peer can be re-pointed
/// with [`UdpChannel::connect`].
#[derive(Debug)]
pub struct UdpChannel {
    /// Address this socket is bound to (filled in after the OS assigns an
    /// ephemeral port).
    pub local_addr: SocketAddr,
    inner: UdpSocket,
    peer: std::sync::Mutex<SocketAddr>,
}

impl UdpChannel {
    /// Bind to `local_addr` and talk to `peer`.
    ///
    /// Passing `0.0.0.0:0` lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr, peer: SocketAddr) -> io::Result<Self> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self {
            local_addr,
            inner,
            peer: std::sync::Mutex::new(peer),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        *self.peer.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn connect(&self, peer: SocketAddr) {
        *self.peer.lock().unwrap_or_else(|e| e.into_inner()) = peer;
    }

    /// Receive the next datagram from *any* address.
    pub async fn recv_from(&self) -> io::Result<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (n, addr) = self.inner.recv_from(&mut buf).await?;
        buf.truncate(n);
        Ok((buf, addr))
    }
}

impl Channel for UdpChannel {
    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        let peer = self.peer();
        self.inner.send_to(datagram, peer).await?;
        Ok(())
    }

    async fn recv(&self) -> io::Result<Vec<u8>> {
        loop {
            let (buf, addr) = self.recv_from().await?;
            if addr == self.peer() {
                return Ok(buf);
            }
            log::debug!("[channel] dropping datagram from stranger {addr}");
        }
    }
}

// ---------------------------------------------------------------------------
// PeerChannel
// ---------------------------------------------------------------------------

/// One peer's view of a shared server socket.
///
/// Sends go straight out of the shared socket; receives come from the
/// server's routing loop over an mpsc queue.  When the server drops the
/// sending half, `recv` reports the channel as closed.
#[derive(Debug)]
pub struct PeerChannel {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl PeerChannel {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr, inbound: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            socket,
            peer,
            inbound: Mutex::new(inbound),
        }
    }
}

impl Channel for PeerChannel {
    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        self.socket.send_to(datagram, self.peer).await?;
        Ok(())
    }

    async fn recv(&self) -> io::Result<Vec<u8>> {
        self.inbound.lock().await.recv().await.ok_or_else(disconnected)
    }
}

// ---------------------------------------------------------------------------
// MemoryChannel
// ---------------------------------------------------------------------------

/// One end of an in-process, perfectly reliable datagram pipe.
#[derive(Debug)]
pub struct MemoryChannel {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl MemoryChannel {
    /// Two connected ends: what one sends, the other receives.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: a_tx,
                rx: Mutex::new(b_rx),
            },
            Self {
                tx: b_tx,
                rx: Mutex::new(a_rx),
            },
        )
    }

    /// Take a datagram that is already queued, without waiting.
    pub fn try_recv(&self) -> Option<Vec<u8>> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }
}

impl Channel for MemoryChannel {
    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        self.tx.send(datagram.to_vec()).map_err(|_| disconnected())
    }

    async fn recv(&self) -> io::Result<Vec<u8>> {
        self.rx.lock().await.recv().await.ok_or_else(disconnected)
    }
}
