//! Go-Back-N receive-side state machine.
//!
//! [`GbnReceiver`] implements the receiver side of Go-Back-N:
//!
//! - Only **in-order** packets are accepted (`seq == expected_seq`).
//! - Out-of-order and duplicate packets are discarded, never buffered, and
//!   answered with the cumulative ACK of the last in-order packet
//!   (`expected_seq − 1`).
//! - Corrupt datagrams get no reply at all; the sender's timeout recovers.
//! - An in-order EOF ends the stream.  Afterwards DATA is ignored without an
//!   ACK, while a repeated EOF is re-ACKed so a sender that lost the first
//!   EOF ACK can still close cleanly.
//!
//! This module only manages state; all socket I/O is the caller's
//! responsibility (see [`crate::connection::StreamReceiver`]).

use crate::packet::{Packet, PacketKind};
use crate::seq::{self, Seq};

/// What happened to one inbound datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvEvent {
    /// In-order payload for the application.  Produced exactly once per
    /// sequence number.
    Delivered(Vec<u8>),
    /// The in-order EOF arrived.
    EndOfStream,
    /// Duplicate or out-of-order packet; payload dropped.
    Discarded { seq: Seq },
    /// Failed to decode; dropped without reply.
    Corrupt,
    /// Valid but meaningless here (an ACK, or DATA after EOF).
    Ignored,
}

/// Outcome of [`GbnReceiver::on_datagram`]: the event plus the ACK to send,
/// if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reception {
    pub event: RecvEvent,
    pub ack: Option<Packet>,
}

impl Reception {
    fn silent(event: RecvEvent) -> Self {
        Self { event, ack: None }
    }
}

/// Running totals for one receiver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiverStats {
    pub delivered_packets: u64,
    pub delivered_bytes: u64,
    pub duplicates_discarded: u64,
    pub corrupt_discarded: u64,
    pub acks_sent: u64,
}

/// Go-Back-N receive-side state for one connection.
#[derive(Debug)]
pub struct GbnReceiver {
    /// Next sequence number required for in-order delivery.
    expected_seq: Seq,
    /// Sequence number of the accepted EOF, once seen.
    eof_seq: Option<Seq>,
    stats: ReceiverStats,
}

impl Default for GbnReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl GbnReceiver {
    pub fn new() -> Self {
        Self {
            expected_seq: 0,
            eof_seq: None,
            stats: ReceiverStats::default(),
        }
    }

    /// Expect the first packet at `seq` instead of 0.  Both peers must agree.
    pub fn with_initial_seq(mut self, seq: Seq) -> Self {
        self.expected_seq = seq;
        self
    }

    pub fn expected_seq(&self) -> Seq {
        self.expected_seq
    }

    /// `true` once the in-order EOF has been accepted.
    pub fn is_finished(&self) -> bool {
        self.eof_seq.is_some()
    }

    pub fn stats(&self) -> ReceiverStats {
        self.stats
    }

    /// Cumulative ACK of the last in-order packet.
    fn cumulative_ack(&mut self) -> Option<Packet> {
        self.stats.acks_sent += 1;
        Some(Packet::ack(seq::prev(self.expected_seq)))
    }

    /// Decode and process one raw datagram.
    pub fn on_datagram(&mut self, bytes: &[u8]) -> Reception {
        match Packet::decode(bytes) {
            Ok(packet) => self.on_packet(packet),
            Err(_) => {
                self.stats.corrupt_discarded += 1;
                Reception::silent(RecvEvent::Corrupt)
            }
        }
    }

    /// Process one validated packet.
    pub fn on_packet(&mut self, packet: Packet) -> Reception {
        if let Some(eof_seq) = self.eof_seq {
            return match packet.kind {
                PacketKind::Eof if packet.seq == eof_seq => {
                    self.stats.acks_sent += 1;
                    Reception {
                        event: RecvEvent::Ignored,
                        ack: Some(Packet::ack(eof_seq)),
                    }
                }
                _ => Reception::silent(RecvEvent::Ignored),
            };
        }

        match packet.kind {
            PacketKind::Ack => Reception::silent(RecvEvent::Ignored),
            _ if packet.seq != self.expected_seq => {
                self.stats.duplicates_discarded += 1;
                Reception {
                    event: RecvEvent::Discarded { seq: packet.seq },
                    ack: self.cumulative_ack(),
                }
            }
            PacketKind::Data => {
                self.expected_seq = seq::next(self.expected_seq);
                self.stats.delivered_packets += 1;
                self.stats.delivered_bytes += packet.payload.len() as u64;
                Reception {
                    event: RecvEvent::Delivered(packet.payload),
                    ack: self.cumulative_ack(),
                }
            }
            PacketKind::Eof => {
                self.eof_seq = Some(packet.seq);
                self.expected_seq = seq::next(self.expected_seq);
                Reception {
                    event: RecvEvent::EndOfStream,
                    ack: self.cumulative_ack(),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn data(seq: Seq, payload: &[u8]) -> Vec<u8> {
        Packet::data(seq, payload.to_vec()).encode().unwrap()
    }

    #[test]
    fn initial_state() {
        let r = GbnReceiver::new();
        assert_eq!(r.expected_seq(), 0);
        assert!(!r.is_finished());
    }

    #[test]
    fn in_order_packet_delivered_and_acked() {
        let mut r = GbnReceiver::new();
        let rx = r.on_datagram(&data(0, b"hello"));
        assert_eq!(rx.event, RecvEvent::Delivered(b"hello".to_vec()));
        assert_eq!(rx.ack, Some(Packet::ack(0)));
        assert_eq!(r.expected_seq(), 1);
    }

    #[test]
    fn out_of_order_packet_discarded_with_cumulative_ack() {
        let mut r = GbnReceiver::new();
        r.on_datagram(&data(0, b"a"));
        r.on_datagram(&data(1, b"b"));

        let rx = r.on_datagram(&data(3, b"d"));
        assert_eq!(rx.event, RecvEvent::Discarded { seq: 3 });
        assert_eq!(rx.ack, Some(Packet::ack(1)));
        assert_eq!(r.expected_seq(), 2);
    }

    #[test]
    fn duplicate_delivered_at_most_once() {
        let mut r = GbnReceiver::new();
        let mut delivered = 0;
        for _ in 0..5 {
            if let RecvEvent::Delivered(_) = r.on_datagram(&data(0, b"once")).event {
                delivered += 1;
            }
        }
        assert_eq!(delivered, 1);
        assert_eq!(r.stats().duplicates_discarded, 4);
    }

    #[test]
    fn premature_packet_at_start_acks_before_zero() {
        let mut r = GbnReceiver::new();
        let rx = r.on_datagram(&data(2, b"early"));
        assert_eq!(rx.ack, Some(Packet::ack(u16::MAX)));
    }

    #[test]
    fn corrupt_packet_gets_no_ack() {
        let mut r = GbnReceiver::new();
        let mut bytes = data(0, b"payload");
        let last = bytes.len() - 1;
        bytes[last] ^= 0x80;
        let rx = r.on_datagram(&bytes);
        assert_eq!(rx, Reception::silent(RecvEvent::Corrupt));
        assert_eq!(r.expected_seq(), 0);
        assert_eq!(r.stats().corrupt_discarded, 1);
    }

    #[test]
    fn ack_at_receiver_ignored() {
        let mut r = GbnReceiver::new();
        let rx = r.on_packet(Packet::ack(0));
        assert_eq!(rx, Reception::silent(RecvEvent::Ignored));
    }

    #[test]
    fn eof_in_order_ends_stream() {
        let mut r = GbnReceiver::new();
        r.on_datagram(&data(0, b"last"));
        let rx = r.on_packet(Packet::eof(1));
        assert_eq!(rx.event, RecvEvent::EndOfStream);
        assert_eq!(rx.ack, Some(Packet::ack(1)));
        assert!(r.is_finished());
    }

    #[test]
    fn eof_out_of_order_treated_as_mismatch() {
        let mut r = GbnReceiver::new();
        let rx = r.on_packet(Packet::eof(4));
        assert_eq!(rx.event, RecvEvent::Discarded { seq: 4 });
        assert!(!r.is_finished());
    }

    #[test]
    fn after_eof_data_unacked_but_eof_reacked() {
        let mut r = GbnReceiver::new();
        r.on_packet(Packet::eof(0));

        let rx = r.on_datagram(&data(0, b"late"));
        assert_eq!(rx, Reception::silent(RecvEvent::Ignored));

        let rx = r.on_packet(Packet::eof(0));
        assert_eq!(rx.event, RecvEvent::Ignored);
        assert_eq!(rx.ack, Some(Packet::ack(0)));
    }

    #[test]
    fn seq_wrap_around() {
        let mut r = GbnReceiver::new().with_initial_seq(u16::MAX);
        assert!(matches!(
            r.on_datagram(&data(u16::MAX, b"x")).event,
            RecvEvent::Delivered(_)
        ));
        assert_eq!(r.expected_seq(), 0);
        let rx = r.on_datagram(&data(0, b"y"));
        assert_eq!(rx.ack, Some(Packet::ack(0)));
        // Retransmitted pre-wrap packet is a duplicate.
        let rx = r.on_datagram(&data(u16::MAX, b"x"));
        assert_eq!(rx.ack, Some(Packet::ack(0)));
        assert_eq!(r.stats().delivered_packets, 2);
    }
}
