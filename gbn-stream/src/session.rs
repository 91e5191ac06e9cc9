//! The `PLAY` application layer.
//!
//! One [`Session`] serves exactly one request on one channel:
//!
//! ```text
//!  Idle ──PLAY name──▶ Lookup ──found──▶ Streaming ──EOF ACKed / error──▶ Closed
//!    │                   │
//!    │ malformed         └──missing / unreadable──▶ Closed
//!    └──────────────────────────────────────────────▶ Closed
//! ```
//!
//! Exactly one response line is written before any DATA packet:
//! `200 OK`, `404 Not Found`, `400 Bad Request` or
//! `500 Internal Server Error`.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::timeout;

use crate::channel::Channel;
use crate::config::{ConfigError, TransportConfig};
use crate::connection::{spawn_sender, ConnError, SenderReport};
use crate::metrics::MetricsSink;
use crate::source::{ByteSource, ChunkStream, SourceError};

pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Lookup,
    Streaming,
    Closed,
}

// ---------------------------------------------------------------------------
// Wire grammar
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Play(String),
}

impl Request {
    pub fn to_wire(&self) -> Vec<u8> {
        match self {
            Request::Play(name) => format!("PLAY {name}\n").into_bytes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("request is not valid UTF-8")]
    NotUtf8,
    #[error("empty request")]
    Empty,
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("PLAY takes exactly one name")]
    BadArguments,
}

/// Parse one request line.  A single trailing `\n` or `\r\n` is allowed.
pub fn parse_request(bytes: &[u8]) -> Result<Request, RequestError> {
    let text = std::str::from_utf8(bytes).map_err(|_| RequestError::NotUtf8)?;
    let line = text.strip_suffix('\n').unwrap_or(text);
    let line = line.strip_suffix('\r').unwrap_or(line);

    let mut words = line.split_ascii_whitespace();
    match words.next() {
        None => Err(RequestError::Empty),
        Some("PLAY") => match (words.next(), words.next()) {
            (Some(name), None) => Ok(Request::Play(name.to_owned())),
            _ => Err(RequestError::BadArguments),
        },
        Some(other) => Err(RequestError::UnknownCommand(other.to_owned())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Ok,
    NotFound,
    BadRequest,
    InternalError,
}

impl Response {
    pub fn status_line(self) -> &'static str {
        match self {
            Response::Ok => "200 OK",
            Response::NotFound => "404 Not Found",
            Response::BadRequest => "400 Bad Request",
            Response::InternalError => "500 Internal Server Error",
        }
    }

    pub fn to_wire(self) -> Vec<u8> {
        format!("{}\n", self.status_line()).into_bytes()
    }

    /// Recognise a response line; `None` for anything else.
    pub fn parse(bytes: &[u8]) -> Option<Response> {
        let line = std::str::from_utf8(bytes).ok()?.trim_end_matches(['\r', '\n']);
        [
            Response::Ok,
            Response::NotFound,
            Response::BadRequest,
            Response::InternalError,
        ]
        .into_iter()
        .find(|r| r.status_line() == line)
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no request within {0:?}")]
    RequestTimeout(Duration),
    #[error(transparent)]
    Conn(#[from] ConnError),
    #[error("source failed mid-stream: {0}")]
    Source(#[from] SourceError),
    #[error("session not started: {0}")]
    Config(#[from] ConfigError),
}

/// How a session ended, when it ended without a transport failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub id: SessionId,
    pub name: Option<String>,
    pub response: Response,
    /// Present only for streamed requests.
    pub sender: Option<SenderReport>,
}

pub struct Session<C, S> {
    id: SessionId,
    channel: Arc<C>,
    source: S,
    config: TransportConfig,
    metrics: Arc<dyn MetricsSink>,
    state: SessionState,
}

impl<C, S> Session<C, S>
where
    C: Channel + 'static,
    S: ByteSource,
{
    pub fn new(
        id: SessionId,
        channel: C,
        source: S,
        config: TransportConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            id,
            channel: Arc::new(channel),
            source,
            config,
            metrics,
            state: SessionState::Idle,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    async fn respond(&self, response: Response) -> Result<(), SessionError> {
        log::info!("[session {}] → {}", self.id, response.status_line());
        self.channel
            .send(&response.to_wire())
            .await
            .map_err(ConnError::from)?;
        Ok(())
    }

    fn closed(&mut self, name: Option<String>, response: Response) -> SessionReport {
        self.state = SessionState::Closed;
        SessionReport {
            id: self.id,
            name,
            response,
            sender: None,
        }
    }

    /// Serve one request to completion.
    ///
    /// An invalid config fails with [`SessionError::Config`] before the
    /// request is read.
    pub async fn run(&mut self) -> Result<SessionReport, SessionError> {
        let result = self.serve().await;
        self.state = SessionState::Closed;
        result
    }

    async fn serve(&mut self) -> Result<SessionReport, SessionError> {
        self.config.validate()?;
        let wait = self.config.request_timeout;
        let datagram = match timeout(wait, self.channel.recv()).await {
            Ok(datagram) => datagram.map_err(ConnError::from)?,
            Err(_) => {
                log::debug!("[session {}] no request within {:?}", self.id, wait);
                return Err(SessionError::RequestTimeout(wait));
            }
        };

        let name = match parse_request(&datagram) {
            Ok(Request::Play(name)) => name,
            Err(e) => {
                log::info!("[session {}] malformed request: {e}", self.id);
                self.respond(Response::BadRequest).await?;
                return Ok(self.closed(None, Response::BadRequest));
            }
        };

        self.state = SessionState::Lookup;
        log::info!("[session {}] PLAY {name}", self.id);
        let mut stream = match self.source.open(&name).await {
            Ok(stream) => stream,
            Err(SourceError::NotFound(_)) => {
                self.respond(Response::NotFound).await?;
                return Ok(self.closed(Some(name), Response::NotFound));
            }
            Err(e) => {
                log::warn!("[session {}] cannot open {name}: {e}", self.id);
                self.respond(Response::InternalError).await?;
                return Ok(self.closed(Some(name), Response::InternalError));
            }
        };

        self.respond(Response::Ok).await?;
        self.state = SessionState::Streaming;

        let mut sender = spawn_sender(
            Arc::clone(&self.channel),
            &self.config,
            Arc::clone(&self.metrics),
        )?;
        // A read error drops `sender`, which aborts the transfer.
        while let Some(chunk) = stream.next_chunk(self.config.chunk_size).await? {
            sender.submit(vec![chunk]).await?;
        }
        let report = sender.finish().await?;

        log::info!(
            "[session {}] {name} done: {} packets, {} retransmitted, eof_acked={}",
            self.id,
            report.stats.packets_sent,
            report.stats.retransmissions,
            report.eof_acked
        );
        self.state = SessionState::Closed;
        Ok(SessionReport {
            id: self.id,
            name: Some(name),
            response: Response::Ok,
            sender: Some(report),
        })
    }
}
