//! Integration tests for the Go-Back-N state machines.
//!
//! A small synchronous harness moves datagrams between a [`GbnSender`] and a
//! [`GbnReceiver`] in rounds.  Each round the sender fills its window, every
//! datagram in flight reaches the receiver (unless a loss rule eats it), and
//! every ACK comes back.  When the network has gone quiet with packets still
//! unacknowledged, the clock jumps one RTO and the retransmit timer fires.
//! No sockets, no tokio, no wall-clock time: every run is reproducible.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use gbn_stream::packet::{Packet, PacketKind};
use gbn_stream::receiver::{GbnReceiver, RecvEvent};
use gbn_stream::sender::{AckOutcome, GbnSender, SenderError, TimeoutOutcome};
use gbn_stream::seq::{self, Seq};

const RTO: Duration = Duration::from_millis(500);

/// Decides whether a datagram is lost.  `attempt` counts transmissions of
/// the same sequence number, starting at 1.
type LossRule<'a> = Box<dyn FnMut(Seq, PacketKind, u32) -> bool + 'a>;

fn no_loss<'a>() -> LossRule<'a> {
    Box::new(|_, _, _| false)
}

#[derive(Debug, Default)]
struct Trace {
    delivered: Vec<Vec<u8>>,
    timeouts: u32,
    /// Retransmitted packets between consecutive window advances.
    retransmit_episodes: Vec<u64>,
}

struct Harness<'a> {
    sender: GbnSender,
    receiver: GbnReceiver,
    lose_data: LossRule<'a>,
    lose_ack: LossRule<'a>,
    duplicate: bool,
    reverse: bool,
    attempts: std::collections::HashMap<Seq, u32>,
}

impl<'a> Harness<'a> {
    fn new(sender: GbnSender, receiver: GbnReceiver) -> Self {
        Self {
            sender,
            receiver,
            lose_data: no_loss(),
            lose_ack: no_loss(),
            duplicate: false,
            reverse: false,
            attempts: Default::default(),
        }
    }

    fn to_receiver(&mut self, wire: Vec<u8>, link: &mut VecDeque<Vec<u8>>) {
        let packet = Packet::decode(&wire).unwrap();
        let attempt = self.attempts.entry(packet.seq).or_insert(0);
        *attempt += 1;
        if (self.lose_data)(packet.seq, packet.kind, *attempt) {
            return;
        }
        if self.duplicate {
            link.push_back(wire.clone());
        }
        link.push_back(wire);
    }

    fn run(&mut self, chunks: Vec<Vec<u8>>) -> Result<Trace, SenderError> {
        self.sender.submit(chunks)?;
        self.sender.finish();

        let mut now = Instant::now();
        let mut trace = Trace::default();
        let mut episode = 0u64;
        let mut acked_total = 0usize;
        // Datagrams on their way to the receiver this round.
        let mut link = VecDeque::new();

        while !self.sender.is_done() {
            while let Some(tx) = self.sender.poll_transmit(now)? {
                self.to_receiver(tx.wire, &mut link);
            }
            if self.reverse {
                link.make_contiguous().reverse();
            }

            let mut acks = Vec::new();
            for datagram in link.drain(..) {
                let reception = self.receiver.on_datagram(&datagram);
                if let RecvEvent::Delivered(payload) = reception.event {
                    trace.delivered.push(payload);
                }
                if let Some(ack) = reception.ack {
                    if !(self.lose_ack)(ack.seq, PacketKind::Ack, 0) {
                        acks.push(ack.encode().unwrap());
                    }
                }
            }

            for ack in acks {
                let base = self.sender.base();
                if let AckOutcome::Advanced { newly_acked, .. } = self.sender.on_datagram(&ack, now) {
                    acked_total += newly_acked;
                    trace.retransmit_episodes.push(episode);
                    episode = 0;
                }
                // The left window edge only ever moves forward.
                assert!(seq::distance(base, self.sender.base()) <= self.sender.window_size());
            }

            if self.sender.can_send_new() || !self.sender.has_unacked() {
                continue;
            }
            now += RTO;
            trace.timeouts += 1;
            match self.sender.on_timeout(now)? {
                TimeoutOutcome::Retransmit { packets, .. } => {
                    episode += packets.len() as u64;
                    for (_, wire) in packets {
                        self.to_receiver(wire, &mut link);
                    }
                }
                TimeoutOutcome::EofAbandoned => break,
                TimeoutOutcome::Idle => unreachable!("timeout with packets in flight"),
            }
        }
        assert!(acked_total as u64 >= self.sender.stats().packets_sent);
        Ok(trace)
    }
}

fn chunks(n: usize) -> Vec<Vec<u8>> {
    (0..n).map(|i| format!("chunk-{i:04}").into_bytes()).collect()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn clean_network_sends_each_packet_once() {
    let mut h = Harness::new(GbnSender::new(4), GbnReceiver::new());
    let trace = h.run(chunks(10)).unwrap();

    let stats = h.sender.stats();
    assert_eq!(stats.packets_sent, 10);
    assert_eq!(stats.acks_received, 10);
    assert_eq!(stats.retransmissions, 0);
    assert_eq!(stats.timeouts, 0);
    assert_eq!(trace.delivered, chunks(10));
    assert!(h.sender.eof_acked());
    assert!(h.receiver.is_finished());
}

#[test]
fn single_loss_goes_back_n() {
    let mut h = Harness::new(GbnSender::new(4), GbnReceiver::new());
    h.lose_data = Box::new(|seq, kind, attempt| kind == PacketKind::Data && seq == 3 && attempt == 1);
    let trace = h.run(chunks(10)).unwrap();

    // 0..=2 are acked, 3 is lost, 4..=6 fill the window behind it and are
    // discarded.  One timeout resends everything from base = 3 to next_seq = 7.
    assert_eq!(trace.timeouts, 1);
    assert_eq!(h.sender.stats().retransmissions, 7 - 3);
    assert_eq!(trace.delivered, chunks(10));
    assert_eq!(h.receiver.stats().duplicates_discarded, 3);
}

#[test]
fn lost_acks_are_covered_by_later_cumulative_acks() {
    let mut h = Harness::new(GbnSender::new(4), GbnReceiver::new());
    // Every other ACK is lost; the next one covers it.
    h.lose_ack = Box::new(|seq, _, _| seq % 2 == 0 && seq < 8);
    let trace = h.run(chunks(9)).unwrap();

    assert_eq!(trace.delivered, chunks(9));
    assert_eq!(trace.timeouts, 0);
    assert_eq!(h.sender.stats().packets_sent, 9);
    assert_eq!(h.sender.stats().retransmissions, 0);
}

#[test]
fn duplicated_datagrams_are_delivered_once() {
    let mut h = Harness::new(GbnSender::new(4), GbnReceiver::new());
    h.duplicate = true;
    let trace = h.run(chunks(12)).unwrap();

    assert_eq!(trace.delivered, chunks(12));
    assert!(h.receiver.stats().duplicates_discarded >= 12);
    assert_eq!(h.receiver.stats().delivered_packets, 12);
}

#[test]
fn reordered_window_still_delivers_in_order() {
    let mut h = Harness::new(GbnSender::new(4), GbnReceiver::new());
    h.reverse = true;
    let trace = h.run(chunks(8)).unwrap();

    assert_eq!(trace.delivered, chunks(8));
    assert!(h.sender.stats().retransmissions > 0);
}

#[test]
fn heavy_random_loss_delivers_everything_in_order() {
    const WINDOW: u16 = 4;
    const MAX_RETRIES: u32 = 64;

    let mut data_rng = StdRng::seed_from_u64(0x5eed);
    let mut ack_rng = StdRng::seed_from_u64(0xacc);
    let mut h = Harness::new(
        GbnSender::new(WINDOW).with_retry_limits(MAX_RETRIES, MAX_RETRIES),
        GbnReceiver::new(),
    );
    h.lose_data = Box::new(move |_, _, _| data_rng.random_bool(0.5));
    h.lose_ack = Box::new(move |_, _, _| ack_rng.random_bool(0.5));

    let trace = h.run(chunks(100)).unwrap();

    assert_eq!(trace.delivered, chunks(100));
    assert_eq!(h.sender.stats().packets_sent, 100);
    assert!(h.sender.stats().retransmissions > 0);
    let bound = u64::from(MAX_RETRIES) * u64::from(WINDOW);
    assert!(trace.retransmit_episodes.iter().all(|&n| n <= bound));
}

#[test]
fn black_hole_exhausts_retries() {
    let mut h = Harness::new(GbnSender::new(4).with_retry_limits(5, 5), GbnReceiver::new());
    h.lose_data = Box::new(|_, _, _| true);

    let err = h.run(chunks(3)).unwrap_err();
    assert!(matches!(
        err,
        SenderError::RetriesExhausted { attempts: 5, base: 0 }
    ));
    assert_eq!(h.sender.stats().retransmissions, 5 * 3);
}

#[test]
fn unacknowledged_eof_is_abandoned() {
    let mut h = Harness::new(GbnSender::new(4).with_retry_limits(10, 3), GbnReceiver::new());
    h.lose_ack = Box::new(|seq, _, _| seq == 5);
    let trace = h.run(chunks(5)).unwrap();

    assert_eq!(trace.delivered, chunks(5));
    assert!(h.sender.is_done());
    assert!(!h.sender.eof_acked());
    assert!(h.receiver.is_finished());
}

#[test]
fn transfer_across_sequence_wrap() {
    let start = u16::MAX - 5;
    let mut rng = StdRng::seed_from_u64(7);
    let mut h = Harness::new(
        GbnSender::new(8).with_initial_seq(start).with_retry_limits(32, 32),
        GbnReceiver::new().with_initial_seq(start),
    );
    h.lose_data = Box::new(move |_, _, _| rng.random_bool(0.2));

    let trace = h.run(chunks(40)).unwrap();
    assert_eq!(trace.delivered, chunks(40));
    assert_eq!(h.sender.base(), start.wrapping_add(41));
}
