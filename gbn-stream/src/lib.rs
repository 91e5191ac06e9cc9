//! `gbn-stream`: reliable video streaming over UDP using Go-Back-N ARQ.
//!
//! # Architecture
//!
//! ```text
//!        client                                         server
//!  ┌──────────────┐     PLAY name / 200 OK     ┌────────────────────┐
//!  │    Client    │◀──────────────────────────▶│  Server (demux)    │
//!  └──────┬───────┘                            └─────────┬──────────┘
//!         │                                              │ one task per peer
//!  ┌──────▼───────┐        DATA / EOF          ┌─────────▼──────────┐
//!  │StreamReceiver│◀───────────────────────────│ Session            │
//!  │ (GbnReceiver)│────────────────────────────▶│  └─ sender task    │
//!  └──────┬───────┘       cumulative ACKs      │     (GbnSender +   │
//!         │                                    │      RetransmitTimer)
//!         │ Channel (UDP / in-memory / lossy)  └─────────┬──────────┘
//!         └──────────────────────────────────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`seq`]: 16-bit modular sequence arithmetic
//! - [`packet`]: wire format and RFC 1071 checksum
//! - [`sender`]: Go-Back-N send window (pure state machine)
//! - [`receiver`]: in-order delivery and cumulative ACKs
//! - [`timer`]: RTO estimation and back-off
//! - [`connection`]: async drivers: sender task and stream receiver
//! - [`channel`]: datagram channels (UDP, per-peer, in-memory)
//! - [`simulator`]: seeded loss / burst / reorder / duplicate / corrupt layer
//! - [`metrics`]: transport events and counters
//! - [`config`]: tunables and their validation
//! - [`session`]: `PLAY` request/response state machine
//! - [`source`]: named byte streams (directory or memory)
//! - [`server`]: UDP accept loop routing peers to sessions
//! - [`client`]: `PLAY` requester

pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod metrics;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod seq;
pub mod server;
pub mod session;
pub mod simulator;
pub mod source;
pub mod timer;
