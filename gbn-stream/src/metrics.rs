//! Transport events and counters.
//!
//! The transport only *emits* [`TransportEvent`]s; a [`MetricsSink`] decides
//! what to do with them.  [`Counters`] is the stock sink: lock-free counters
//! that any task can update and any other task can snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::seq::Seq;

/// Something observable happened inside a sender or receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    /// First transmission of a DATA packet.
    DataSent { seq: Seq, len: usize },
    /// A packet went out again after a timeout.
    Retransmitted { seq: Seq },
    /// A cumulative ACK moved the window.
    AckReceived { seq: Seq, newly_acked: usize },
    /// An ACK outside `[base, next_seq)`.
    StaleAck { seq: Seq },
    EofSent { seq: Seq },
    Timeout { in_flight: usize },
    /// Receiver dropped a duplicate or out-of-order packet.
    DuplicateDiscarded { seq: Seq },
    /// A datagram failed to decode.
    CorruptDiscarded,
    /// Payload handed to the application.
    Delivered { len: usize },
}

pub trait MetricsSink: Send + Sync {
    fn record(&self, event: &TransportEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMetrics;

impl MetricsSink for NoMetrics {
    fn record(&self, _event: &TransportEvent) {}
}

/// Aggregating sink backed by atomics.
#[derive(Debug)]
pub struct Counters {
    started: Instant,
    packets_sent: AtomicU64,
    retransmissions: AtomicU64,
    acks_received: AtomicU64,
    stale_acks: AtomicU64,
    timeouts: AtomicU64,
    duplicates_discarded: AtomicU64,
    corrupt_discarded: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_delivered: AtomicU64,
}

/// Point-in-time copy of [`Counters`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    pub packets_sent: u64,
    pub retransmissions: u64,
    pub acks_received: u64,
    pub stale_acks: u64,
    pub timeouts: u64,
    pub duplicates_discarded: u64,
    pub corrupt_discarded: u64,
    pub bytes_sent: u64,
    pub bytes_delivered: u64,
    pub elapsed: Duration,
    /// Delivered bytes if anything was delivered, otherwise sent bytes, per
    /// second of elapsed time.
    pub throughput_bytes_per_sec: f64,
}

impl Default for Counters {
    fn default() -> Self {
        Self::new()
    }
}

impl Counters {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            packets_sent: AtomicU64::new(0),
            retransmissions: AtomicU64::new(0),
            acks_received: AtomicU64::new(0),
            stale_acks: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            duplicates_discarded: AtomicU64::new(0),
            corrupt_discarded: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_delivered: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let elapsed = self.started.elapsed();
        let bytes_sent = load(&self.bytes_sent);
        let bytes_delivered = load(&self.bytes_delivered);
        let useful = if bytes_delivered > 0 {
            bytes_delivered
        } else {
            bytes_sent
        };
        let secs = elapsed.as_secs_f64();
        MetricsSnapshot {
            packets_sent: load(&self.packets_sent),
            retransmissions: load(&self.retransmissions),
            acks_received: load(&self.acks_received),
            stale_acks: load(&self.stale_acks),
            timeouts: load(&self.timeouts),
            duplicates_discarded: load(&self.duplicates_discarded),
            corrupt_discarded: load(&self.corrupt_discarded),
            bytes_sent,
            bytes_delivered,
            elapsed,
            throughput_bytes_per_sec: if secs > 0.0 { useful as f64 / secs } else { 0.0 },
        }
    }
}

impl MetricsSink for Counters {
    fn record(&self, event: &TransportEvent) {
        let bump = |c: &AtomicU64, n: u64| {
            c.fetch_add(n, Ordering::Relaxed);
        };
        match *event {
            TransportEvent::DataSent { len, .. } => {
                bump(&self.packets_sent, 1);
                bump(&self.bytes_sent, len as u64);
            }
            TransportEvent::Retransmitted { .. } => bump(&self.retransmissions, 1),
            TransportEvent::AckReceived { .. } => bump(&self.acks_received, 1),
            TransportEvent::StaleAck { .. } => bump(&self.stale_acks, 1),
            TransportEvent::Timeout { .. } => bump(&self.timeouts, 1),
            TransportEvent::DuplicateDiscarded { .. } => bump(&self.duplicates_discarded, 1),
            TransportEvent::CorruptDiscarded => bump(&self.corrupt_discarded, 1),
            TransportEvent::Delivered { len } => bump(&self.bytes_delivered, len as u64),
            TransportEvent::EofSent { .. } => {}
        }
    }
}
