//! Go-Back-N send-side state machine.
//!
//! [`GbnSender`] maintains a sliding window of up to `N` in-flight packets,
//! numbered one sequence number per packet in the 16-bit space of
//! [`crate::seq`].
//!
//! # Protocol contract
//!
//! - At most `window_size` packets may be in flight at once.
//! - ACKs are **cumulative**: `ACK(k)` means the receiver has accepted every
//!   packet up to and including `k`.  Only `k ∈ [base, next_seq)` moves the
//!   window; anything else is stale and changes nothing.
//! - On timeout every unacked packet from `base` onwards is retransmitted in
//!   ascending order (go back N).
//! - After [`GbnSender::finish`], once every chunk is acknowledged, a single
//!   EOF packet is sent and retransmitted like DATA until it is ACKed or
//!   `max_eof_retries` is spent.
//!
//! This module only manages state.  It never sleeps or touches a socket:
//! every call that affects the retransmit timer returns a [`TimerCommand`]
//! that the owning task applies.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::TransportConfig;
use crate::packet::{Packet, PacketError, PacketKind, MAX_PAYLOAD};
use crate::seq::{self, Seq};
use crate::timer::TimerCommand;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A single in-flight packet occupying one slot in the window.
#[derive(Debug, Clone)]
pub struct GbnEntry {
    pub seq: Seq,
    pub kind: PacketKind,
    /// The encoded datagram, reused verbatim on retransmission.
    pub wire: Vec<u8>,
    /// Payload length (for byte accounting).
    pub len: usize,
    /// Total number of times this packet has been transmitted.
    pub tx_count: u32,
    /// Time of the most recent transmission (for RTT sampling).
    pub sent_at: Instant,
}

/// A packet the caller must put on the wire now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub seq: Seq,
    pub kind: PacketKind,
    pub wire: Vec<u8>,
    pub timer: TimerCommand,
}

/// Result of feeding an inbound datagram or ACK to the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// `base` moved forward.
    Advanced {
        seq: Seq,
        newly_acked: usize,
        eof_acked: bool,
        /// Only present when the newest acked packet was sent exactly once
        /// (Karn's rule).
        rtt_sample: Option<Duration>,
        timer: TimerCommand,
    },
    /// Duplicate, old, or not-yet-sent sequence number.
    Stale { seq: Seq },
    /// The datagram failed to decode.
    Corrupt,
    /// A valid packet that is not an ACK.
    Unexpected(PacketKind),
}

/// Result of a retransmit-timer expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutOutcome {
    /// Nothing is in flight; the expiry was spurious.
    Idle,
    /// Resend these, oldest first, then restart the timer.
    Retransmit {
        packets: Vec<(Seq, Vec<u8>)>,
        timer: TimerCommand,
    },
    /// The EOF went unacknowledged `max_eof_retries` times; the stream is
    /// considered delivered (every DATA packet was ACKed) and the sender stops.
    EofAbandoned,
}

/// Coarse state of the send side.
///
/// ```text
///  Idle ──data──▶ Sending ──window full / all sent──▶ Waiting
///                   ▲                                   │
///                   └──────────── ACK ──────────────────┤
///                                                       ▼
///                             Closed ◀──── Done ◀── EOF ACKed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Idle,
    Sending,
    Waiting,
    Done,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EofState {
    NotSent,
    InFlight,
    Acked,
    Abandoned,
}

/// Running totals for one sender.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderStats {
    /// DATA packets transmitted for the first time.
    pub packets_sent: u64,
    pub bytes_sent: u64,
    /// Packets (DATA or EOF) re-sent after a timeout.
    pub retransmissions: u64,
    /// ACKs that advanced the window over DATA packets.
    pub acks_received: u64,
    pub stale_acks: u64,
    pub timeouts: u64,
    pub bytes_acked: u64,
}

#[derive(Debug, Error)]
pub enum SenderError {
    #[error("no progress after {attempts} retransmissions of base {base}")]
    RetriesExhausted { attempts: u32, base: Seq },
    #[error("sender already finished; no more data accepted")]
    Finished,
    #[error("sender is closed")]
    Closed,
    #[error(transparent)]
    Packet(#[from] PacketError),
}

// ---------------------------------------------------------------------------
// GbnSender
// ---------------------------------------------------------------------------

/// Go-Back-N send-side state for one connection.
///
/// # Sequence-number layout
///
/// ```text
///     base             next_seq         base + N
///      │                  │                │
///  ────┼──────────────────┼────────────────┼──────▶ seq space (mod 2^16)
///      │ <── in flight ──▶│ <── usable ──▶ │
/// ```
#[derive(Debug)]
pub struct GbnSender {
    /// Oldest unacknowledged sequence number (left window edge).
    base: Seq,
    /// Sequence number for the next new packet.
    next_seq: Seq,
    window_size: u16,
    /// In-flight packets `[base, next_seq)`, front = oldest.
    window: VecDeque<GbnEntry>,
    /// Submitted chunks not yet assigned a sequence number.
    pending: VecDeque<Vec<u8>>,
    finishing: bool,
    eof: EofState,
    closed: bool,
    max_retries: u32,
    max_eof_retries: u32,
    consecutive_timeouts: u32,
    eof_retries: u32,
    stats: SenderStats,
}

impl GbnSender {
    /// Create a sender starting at sequence number 0.
    ///
    /// # Panics
    ///
    /// Panics if `window_size` is 0 or exceeds [`seq::MAX_WINDOW`]; use
    /// [`TransportConfig::validate`] to check user input first.
    pub fn new(window_size: u16) -> Self {
        assert!(
            (1..=seq::MAX_WINDOW).contains(&window_size),
            "window_size must be in 1..={}",
            seq::MAX_WINDOW
        );
        let defaults = TransportConfig::default();
        Self {
            base: 0,
            next_seq: 0,
            window_size,
            window: VecDeque::with_capacity(window_size as usize),
            pending: VecDeque::new(),
            finishing: false,
            eof: EofState::NotSent,
            closed: false,
            max_retries: defaults.max_retries,
            max_eof_retries: defaults.max_eof_retries,
            consecutive_timeouts: 0,
            eof_retries: 0,
            stats: SenderStats::default(),
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(config.window_size).with_retry_limits(config.max_retries, config.max_eof_retries)
    }

    pub fn with_retry_limits(mut self, max_retries: u32, max_eof_retries: u32) -> Self {
        self.max_retries = max_retries;
        self.max_eof_retries = max_eof_retries;
        self
    }

    /// Start numbering at `seq` instead of 0.  Both peers must agree.
    pub fn with_initial_seq(mut self, seq: Seq) -> Self {
        debug_assert!(self.window.is_empty());
        self.base = seq;
        self.next_seq = seq;
        self
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn base(&self) -> Seq {
        self.base
    }

    pub fn next_seq(&self) -> Seq {
        self.next_seq
    }

    pub fn window_size(&self) -> u16 {
        self.window_size
    }

    /// Number of packets currently awaiting acknowledgement.
    pub fn in_flight(&self) -> usize {
        self.window.len()
    }

    pub fn has_unacked(&self) -> bool {
        !self.window.is_empty()
    }

    /// Chunks submitted but not yet sent.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> SenderStats {
        self.stats
    }

    /// `true` when the EOF has been acknowledged or abandoned.
    pub fn is_done(&self) -> bool {
        matches!(self.eof, EofState::Acked | EofState::Abandoned)
    }

    /// `true` when the peer acknowledged the EOF.
    pub fn eof_acked(&self) -> bool {
        self.eof == EofState::Acked
    }

    /// Iterate over all in-flight packets from oldest to newest.
    pub fn window_entries(&self) -> impl Iterator<Item = &GbnEntry> {
        self.window.iter()
    }

    pub fn state(&self) -> SenderState {
        if self.closed {
            SenderState::Closed
        } else if self.is_done() {
            SenderState::Done
        } else if self.can_send_new() {
            SenderState::Sending
        } else if self.has_unacked() {
            SenderState::Waiting
        } else {
            SenderState::Idle
        }
    }

    fn has_room(&self) -> bool {
        self.window.len() < self.window_size as usize
    }

    fn eof_ready(&self) -> bool {
        self.finishing
            && self.eof == EofState::NotSent
            && self.pending.is_empty()
            && self.window.is_empty()
    }

    /// `true` when [`poll_transmit`](Self::poll_transmit) would produce a
    /// packet right now.
    pub fn can_send_new(&self) -> bool {
        !self.closed
            && self.eof == EofState::NotSent
            && self.has_room()
            && (!self.pending.is_empty() || self.eof_ready())
    }

    // -----------------------------------------------------------------------
    // Application side
    // -----------------------------------------------------------------------

    /// Queue ordered chunks for transmission.  Never blocks.
    pub fn submit<I>(&mut self, chunks: I) -> Result<(), SenderError>
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        if self.closed {
            return Err(SenderError::Closed);
        }
        if self.finishing {
            return Err(SenderError::Finished);
        }
        for chunk in chunks {
            if chunk.len() > MAX_PAYLOAD {
                return Err(PacketError::PayloadTooLarge(chunk.len()).into());
            }
            self.pending.push_back(chunk);
        }
        Ok(())
    }

    /// No more chunks will be submitted; EOF follows the last one.
    pub fn finish(&mut self) {
        self.finishing = true;
    }

    /// Assign the next sequence number to the next pending chunk (or the EOF)
    /// if the window allows, and hand back the datagram to send.
    ///
    /// Call repeatedly until it returns `None`.
    pub fn poll_transmit(&mut self, now: Instant) -> Result<Option<Transmit>, SenderError> {
        if !self.can_send_new() {
            return Ok(None);
        }

        let was_empty = self.window.is_empty();
        let packet = match self.pending.pop_front() {
            Some(chunk) => Packet::data(self.next_seq, chunk),
            None => Packet::eof(self.next_seq),
        };
        let wire = packet.encode()?;
        let len = packet.payload.len();

        match packet.kind {
            PacketKind::Eof => self.eof = EofState::InFlight,
            _ => {
                self.stats.packets_sent += 1;
                self.stats.bytes_sent += len as u64;
            }
        }

        self.window.push_back(GbnEntry {
            seq: packet.seq,
            kind: packet.kind,
            wire: wire.clone(),
            len,
            tx_count: 1,
            sent_at: now,
        });
        self.next_seq = seq::next(self.next_seq);

        Ok(Some(Transmit {
            seq: packet.seq,
            kind: packet.kind,
            wire,
            timer: if was_empty {
                TimerCommand::Arm
            } else {
                TimerCommand::Keep
            },
        }))
    }

    // -----------------------------------------------------------------------
    // Network side
    // -----------------------------------------------------------------------

    /// Decode an inbound datagram and process it as an ACK.
    ///
    /// Corrupt datagrams and non-ACK packets leave the state untouched.
    pub fn on_datagram(&mut self, bytes: &[u8], now: Instant) -> AckOutcome {
        match Packet::decode(bytes) {
            Ok(pkt) if pkt.kind == PacketKind::Ack => self.on_ack(pkt.seq, now),
            Ok(pkt) => AckOutcome::Unexpected(pkt.kind),
            Err(_) => AckOutcome::Corrupt,
        }
    }

    /// Process a cumulative ACK for `ack`.
    pub fn on_ack(&mut self, ack: Seq, now: Instant) -> AckOutcome {
        // The window never exceeds MAX_WINDOW entries, so its length fits.
        let in_flight = self.window.len() as u16;
        if self.closed || !seq::in_range(ack, self.base, in_flight) {
            self.stats.stale_acks += 1;
            return AckOutcome::Stale { seq: ack };
        }

        let newly_acked = usize::from(seq::distance(self.base, ack)) + 1;
        let mut newest = None;
        for entry in self.window.drain(..newly_acked) {
            if entry.kind == PacketKind::Data {
                self.stats.bytes_acked += entry.len as u64;
            }
            newest = Some(entry);
        }
        self.base = seq::next(ack);
        self.consecutive_timeouts = 0;

        let (eof_acked, rtt_sample) = match newest {
            Some(entry) => (
                entry.kind == PacketKind::Eof,
                (entry.tx_count == 1).then(|| now.saturating_duration_since(entry.sent_at)),
            ),
            None => (false, None),
        };
        if eof_acked {
            self.eof = EofState::Acked;
        } else {
            self.stats.acks_received += 1;
        }

        AckOutcome::Advanced {
            seq: ack,
            newly_acked,
            eof_acked,
            rtt_sample,
            timer: if self.window.is_empty() {
                TimerCommand::Disarm
            } else {
                TimerCommand::Restart
            },
        }
    }

    /// The retransmit timer fired: go back to `base` and resend everything.
    pub fn on_timeout(&mut self, now: Instant) -> Result<TimeoutOutcome, SenderError> {
        if self.closed || self.window.is_empty() {
            return Ok(TimeoutOutcome::Idle);
        }
        self.stats.timeouts += 1;

        let only_eof = self.window.len() == 1 && self.eof == EofState::InFlight;
        if only_eof {
            if self.eof_retries >= self.max_eof_retries {
                self.window.clear();
                self.eof = EofState::Abandoned;
                return Ok(TimeoutOutcome::EofAbandoned);
            }
            self.eof_retries += 1;
        } else {
            if self.consecutive_timeouts >= self.max_retries {
                return Err(SenderError::RetriesExhausted {
                    attempts: self.consecutive_timeouts,
                    base: self.base,
                });
            }
            self.consecutive_timeouts += 1;
        }

        let mut packets = Vec::with_capacity(self.window.len());
        for entry in self.window.iter_mut() {
            entry.tx_count += 1;
            entry.sent_at = now;
            packets.push((entry.seq, entry.wire.clone()));
        }
        self.stats.retransmissions += packets.len() as u64;

        Ok(TimeoutOutcome::Retransmit {
            packets,
            timer: TimerCommand::Restart,
        })
    }

    /// Mark a finished sender closed.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Connection lost or aborted: drop every buffered chunk and unacked
    /// packet.  Nothing is retransmitted after this.
    pub fn cancel(&mut self) -> TimerCommand {
        self.pending.clear();
        self.window.clear();
        self.closed = true;
        TimerCommand::Disarm
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
