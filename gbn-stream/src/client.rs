//! `PLAY` client.
//!
//! Sends the request line, waits for the response, and hands back a
//! [`StreamReceiver`] positioned at the start of the stream.  The request is
//! re-sent every `request_timeout` up to `request_retries` times.  A valid
//! transport packet arriving before any response line means the `200 OK` was
//! lost on the way; the packet is kept and the stream starts with it.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::time::timeout_at;

use crate::channel::{Channel, UdpChannel};
use crate::config::{ConfigError, TransportConfig};
use crate::connection::{ConnError, StreamReceiver};
use crate::metrics::MetricsSink;
use crate::packet::{Packet, PacketKind};
use crate::session::{Request, Response};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("server has no stream named {0:?}")]
    NotFound(String),
    #[error("server refused the request: {0}")]
    Rejected(&'static str),
    #[error("no response after {attempts} request(s)")]
    NoResponse { attempts: u32 },
    #[error(transparent)]
    Conn(#[from] ConnError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Conn(ConnError::from(e))
    }
}

pub struct Client<C> {
    channel: C,
    config: TransportConfig,
    metrics: Arc<dyn MetricsSink>,
}

impl Client<UdpChannel> {
    /// Bind an ephemeral UDP port of the same family as `server`.
    pub async fn connect(
        server: SocketAddr,
        config: TransportConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        let local: SocketAddr = if server.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let channel = UdpChannel::bind(local, server).await?;
        log::debug!("[client] bound {} → {}", channel.local_addr, server);
        Ok(Self::new(channel, config, metrics))
    }
}

impl<C: Channel> Client<C> {
    pub fn new(channel: C, config: TransportConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            channel,
            config,
            metrics,
        }
    }

    /// Request `name` and wait for the server's verdict.
    pub async fn play(self, name: &str) -> Result<StreamReceiver<C>, ClientError> {
        let request = Request::Play(name.to_owned()).to_wire();
        let attempts = self.config.request_retries + 1;

        for attempt in 1..=attempts {
            log::info!("[client] PLAY {name} (attempt {attempt}/{attempts})");
            self.channel.send(&request).await?;
            let deadline = tokio::time::Instant::now() + self.config.request_timeout;

            loop {
                let datagram = match timeout_at(deadline, self.channel.recv()).await {
                    Ok(datagram) => datagram?,
                    Err(_) => break,
                };

                if let Ok(packet) = Packet::decode(&datagram) {
                    if packet.kind == PacketKind::Ack {
                        continue;
                    }
                    log::debug!("[client] stream started before the response line");
                    let mut stream = self.into_stream();
                    stream.push_prefetched(datagram);
                    return Ok(stream);
                }

                match Response::parse(&datagram) {
                    Some(Response::Ok) => {
                        log::info!("[client] ← 200 OK");
                        return Ok(self.into_stream());
                    }
                    Some(Response::NotFound) => return Err(ClientError::NotFound(name.to_owned())),
                    Some(other) => return Err(ClientError::Rejected(other.status_line())),
                    None => log::debug!("[client] ignoring {} unrecognised bytes", datagram.len()),
                }
            }
        }
        Err(ClientError::NoResponse { attempts })
    }

    fn into_stream(self) -> StreamReceiver<C> {
        StreamReceiver::new(self.channel, &self.config, self.metrics)
    }
}
