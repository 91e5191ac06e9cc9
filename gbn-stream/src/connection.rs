//! Connection drivers: the async side of the Go-Back-N state machines.
//!
//! # Architecture
//!
//! ```text
//!  Application (session)                 sender task (one per connection)
//!      │                                ┌─────────────────────────────┐
//!      │  SenderHandle::submit ───────▶ │ commands  (mpsc)            │
//!      │  SenderHandle::finish ───────▶ │ channel.recv()  (ACKs)      │
//!      │                                │ retransmit timer (Sleep)    │
//!      │                                │ pacing timer     (Sleep)    │
//!      │                                └──────────┬──────────────────┘
//!      │                                           │ owns
//!      │                                   GbnSender + RetransmitTimer
//!      ▼
//!  StreamReceiver (driven by the caller, one datagram at a time)
//!      └── GbnReceiver
//! ```
//!
//! The sender task is the only code that touches window or timer state.
//! ACK arrival, timer expiry and application commands are multiplexed with
//! `tokio::select!`, and each branch runs to completion before the next event
//! is taken.
//!
//! Dropping a [`SenderHandle`] (or calling [`SenderHandle::cancel`]) aborts
//! the task: the armed timer is dropped with it and nothing is retransmitted
//! afterwards.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep, timeout, timeout_at, Sleep};

use crate::channel::Channel;
use crate::config::{ConfigError, TransportConfig};
use crate::metrics::{MetricsSink, TransportEvent};
use crate::packet::{PacketError, PacketKind, HEADER_LEN};
use crate::receiver::{GbnReceiver, ReceiverStats, RecvEvent};
use crate::sender::{AckOutcome, GbnSender, SenderError, SenderStats, TimeoutOutcome};
use crate::timer::{RetransmitTimer, TimerCommand};

/// A disarmed timer is parked this far in the future; the `timer_armed`
/// guard in `select!` keeps it from ever being polled to completion.
const FAR_FUTURE: Duration = Duration::from_secs(365 * 24 * 3600);

const COMMAND_QUEUE: usize = 64;

#[derive(Debug, Error)]
pub enum ConnError {
    #[error("connection lost: {0}")]
    ConnectionLost(#[from] io::Error),
    #[error(transparent)]
    Sender(#[from] SenderError),
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("no datagram from peer for {0:?}")]
    IdleTimeout(Duration),
    #[error("connection cancelled")]
    Cancelled,
    #[error("connection task failed: {0}")]
    Task(#[from] JoinError),
}

/// Wall-clock instant that follows the tokio clock, so RTT samples stay
/// consistent with the timers when time is paused in tests.
fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

// ---------------------------------------------------------------------------
// Sender task
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Command {
    Submit(Vec<Vec<u8>>),
    Finish,
}

/// Final account of a sender that ran to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderReport {
    pub stats: SenderStats,
    /// `false` when the EOF was abandoned after `max_eof_retries`.
    pub eof_acked: bool,
    pub elapsed: Duration,
}

/// Handle to a running sender task.
#[derive(Debug)]
pub struct SenderHandle {
    commands: Option<mpsc::Sender<Command>>,
    task: Option<JoinHandle<Result<SenderReport, ConnError>>>,
}

impl SenderHandle {
    /// Queue chunks behind everything submitted so far.
    ///
    /// If the task already stopped, its error is returned instead.
    pub async fn submit(&mut self, chunks: Vec<Vec<u8>>) -> Result<(), ConnError> {
        let Some(commands) = &self.commands else {
            return Err(ConnError::Cancelled);
        };
        if commands.send(Command::Submit(chunks)).await.is_ok() {
            return Ok(());
        }
        self.commands = None;
        match self.task.take() {
            Some(task) => Err(task.await?.err().unwrap_or(ConnError::Cancelled)),
            None => Err(ConnError::Cancelled),
        }
    }

    /// Mark the end of the stream and wait until the EOF is acknowledged
    /// (or abandoned).
    pub async fn finish(mut self) -> Result<SenderReport, ConnError> {
        if let Some(commands) = self.commands.take() {
            // A closed queue means the task already stopped; its result
            // says why.
            let _ = commands.send(Command::Finish).await;
        }
        match self.task.take() {
            Some(task) => task.await?,
            None => Err(ConnError::Cancelled),
        }
    }

    /// Stop immediately, discarding everything unsent or unacknowledged.
    pub fn cancel(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        self.commands = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for SenderHandle {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Start a Go-Back-N sender on `channel`.
///
/// Nothing is spawned when `config` is invalid.
pub fn spawn_sender<C>(
    channel: C,
    config: &TransportConfig,
    metrics: Arc<dyn MetricsSink>,
) -> Result<SenderHandle, ConnError>
where
    C: Channel + 'static,
{
    config.validate()?;
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
    let task = tokio::spawn(event_loop(channel, config.clone(), metrics, rx));
    Ok(SenderHandle {
        commands: Some(tx),
        task: Some(task),
    })
}

/// Apply a [`TimerCommand`] to the single retransmit timer.
fn apply_timer(cmd: TimerCommand, timer: Pin<&mut Sleep>, armed: &mut bool, rto: Duration) {
    match cmd {
        TimerCommand::Keep => {}
        TimerCommand::Arm => {
            if !*armed {
                timer.reset(tokio::time::Instant::now() + rto);
                *armed = true;
            }
        }
        TimerCommand::Restart => {
            timer.reset(tokio::time::Instant::now() + rto);
            *armed = true;
        }
        TimerCommand::Disarm => {
            timer.reset(tokio::time::Instant::now() + FAR_FUTURE);
            *armed = false;
        }
    }
}

async fn event_loop<C: Channel>(
    channel: C,
    config: TransportConfig,
    metrics: Arc<dyn MetricsSink>,
    mut commands: mpsc::Receiver<Command>,
) -> Result<SenderReport, ConnError> {
    let started = tokio::time::Instant::now();
    let mut sender = GbnSender::from_config(&config);
    let mut rto = RetransmitTimer::new(config.timer);

    let timer = sleep(FAR_FUTURE);
    tokio::pin!(timer);
    let mut timer_armed = false;

    let pace = sleep(Duration::ZERO);
    tokio::pin!(pace);
    let mut pacing = false;

    let backlog = usize::from(config.window_size);
    let mut commands_open = true;
    let mut finishing = false;

    loop {
        // Fill the window (one packet at a time when pacing).
        while !pacing {
            let Some(tx) = sender.poll_transmit(now())? else {
                break;
            };
            channel.send(&tx.wire).await?;
            match tx.kind {
                PacketKind::Eof => {
                    metrics.record(&TransportEvent::EofSent { seq: tx.seq });
                    log::debug!("[gbn:tx] → EOF seq={}", tx.seq);
                }
                _ => {
                    let len = tx.wire.len() - HEADER_LEN;
                    metrics.record(&TransportEvent::DataSent { seq: tx.seq, len });
                    log::debug!(
                        "[gbn:tx] → DATA seq={} len={} in_flight={}",
                        tx.seq,
                        len,
                        sender.in_flight()
                    );
                    if let Some(gap) = config.pacing {
                        pace.as_mut().reset(tokio::time::Instant::now() + gap);
                        pacing = true;
                    }
                }
            }
            apply_timer(tx.timer, timer.as_mut(), &mut timer_armed, rto.rto());
        }

        if sender.is_done() {
            break;
        }

        tokio::select! {
            // ── Application commands ─────────────────────────────────────
            // Leave commands queued while the backlog is full.
            cmd = commands.recv(), if commands_open && sender.pending() < backlog => match cmd {
                Some(Command::Submit(chunks)) => sender.submit(chunks)?,
                Some(Command::Finish) => {
                    finishing = true;
                    sender.finish();
                }
                None => {
                    commands_open = false;
                    if !finishing {
                        sender.cancel();
                        log::debug!("[gbn:tx] handle dropped; cancelling");
                        return Err(ConnError::Cancelled);
                    }
                }
            },

            // ── Inbound datagram (expected: ACK) ─────────────────────────
            datagram = channel.recv() => {
                let datagram = datagram?;
                match sender.on_datagram(&datagram, now()) {
                    AckOutcome::Advanced { seq, newly_acked, rtt_sample, timer: cmd, .. } => {
                        match rtt_sample {
                            Some(sample) => rto.record_rtt_sample(sample),
                            None => rto.reset(),
                        }
                        metrics.record(&TransportEvent::AckReceived { seq, newly_acked });
                        log::debug!(
                            "[gbn:tx] ← ACK {} slid={} base={} rto={:?}",
                            seq,
                            newly_acked,
                            sender.base(),
                            rto.rto()
                        );
                        apply_timer(cmd, timer.as_mut(), &mut timer_armed, rto.rto());
                    }
                    AckOutcome::Stale { seq } => {
                        metrics.record(&TransportEvent::StaleAck { seq });
                        log::debug!("[gbn:tx] ← stale ACK {} (base={})", seq, sender.base());
                    }
                    AckOutcome::Corrupt => {
                        metrics.record(&TransportEvent::CorruptDiscarded);
                        log::debug!("[gbn:tx] ← corrupt datagram ({} bytes)", datagram.len());
                    }
                    AckOutcome::Unexpected(kind) => {
                        log::debug!("[gbn:tx] ← unexpected {kind:?}; ignored");
                    }
                }
            }

            // ── Retransmit timeout ───────────────────────────────────────
            _ = &mut timer, if timer_armed => {
                let in_flight = sender.in_flight();
                let outcome = match sender.on_timeout(now()) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        log::warn!("[gbn:tx] giving up: {e}");
                        return Err(e.into());
                    }
                };
                match outcome {
                    TimeoutOutcome::Idle => {
                        apply_timer(TimerCommand::Disarm, timer.as_mut(), &mut timer_armed, rto.rto());
                    }
                    TimeoutOutcome::Retransmit { packets, timer: cmd } => {
                        metrics.record(&TransportEvent::Timeout { in_flight });
                        rto.back_off();
                        log::debug!(
                            "[gbn:tx] timeout; going back to {} ({} pkt(s)), rto={:?}",
                            sender.base(),
                            packets.len(),
                            rto.rto()
                        );
                        for (seq, wire) in packets {
                            channel.send(&wire).await?;
                            metrics.record(&TransportEvent::Retransmitted { seq });
                        }
                        apply_timer(cmd, timer.as_mut(), &mut timer_armed, rto.rto());
                    }
                    TimeoutOutcome::EofAbandoned => {
                        log::warn!("[gbn:tx] EOF never acknowledged; closing anyway");
                        break;
                    }
                }
            }

            // ── Pacing gap elapsed ───────────────────────────────────────
            _ = &mut pace, if pacing => {
                pacing = false;
            }
        }
    }

    sender.close();
    let report = SenderReport {
        stats: sender.stats(),
        eof_acked: sender.eof_acked(),
        elapsed: started.elapsed(),
    };
    log::debug!("[gbn:tx] done: {:?}", report.stats);
    Ok(report)
}

// ---------------------------------------------------------------------------
// Receiver driver
// ---------------------------------------------------------------------------

/// Sequential receive side of one connection.
///
/// Each call to [`recv`](Self::recv) pulls datagrams off the channel, feeds
/// them to the [`GbnReceiver`] and sends whatever ACK it asks for, until a
/// payload can be handed to the caller or the stream ends.
pub struct StreamReceiver<C> {
    channel: C,
    receiver: GbnReceiver,
    metrics: Arc<dyn MetricsSink>,
    idle_timeout: Duration,
    /// Datagrams read by someone else (e.g. while waiting for a response
    /// line) that still belong to the stream.
    prefetched: VecDeque<Vec<u8>>,
}

impl<C: Channel> StreamReceiver<C> {
    pub fn new(channel: C, config: &TransportConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            channel,
            receiver: GbnReceiver::new(),
            metrics,
            idle_timeout: config.idle_timeout,
            prefetched: VecDeque::new(),
        }
    }

    /// Process `datagram` before anything still on the channel.
    pub fn push_prefetched(&mut self, datagram: Vec<u8>) {
        self.prefetched.push_back(datagram);
    }

    pub fn stats(&self) -> ReceiverStats {
        self.receiver.stats()
    }

    pub fn is_finished(&self) -> bool {
        self.receiver.is_finished()
    }

    async fn next_datagram(&mut self) -> Result<Vec<u8>, ConnError> {
        if let Some(datagram) = self.prefetched.pop_front() {
            return Ok(datagram);
        }
        match timeout(self.idle_timeout, self.channel.recv()).await {
            Ok(datagram) => Ok(datagram?),
            Err(_) => Err(ConnError::IdleTimeout(self.idle_timeout)),
        }
    }

    /// Next in-order payload, or `None` once the EOF has arrived.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>, ConnError> {
        if self.receiver.is_finished() {
            return Ok(None);
        }
        loop {
            let datagram = self.next_datagram().await?;
            let reception = self.receiver.on_datagram(&datagram);
            if let Some(ack) = &reception.ack {
                self.channel.send(&ack.encode()?).await?;
            }
            match reception.event {
                RecvEvent::Delivered(payload) => {
                    self.metrics
                        .record(&TransportEvent::Delivered { len: payload.len() });
                    log::debug!(
                        "[gbn:rx] ← DATA len={}; → ACK {}",
                        payload.len(),
                        self.receiver.expected_seq().wrapping_sub(1)
                    );
                    return Ok(Some(payload));
                }
                RecvEvent::EndOfStream => {
                    log::debug!("[gbn:rx] ← EOF; stream complete");
                    return Ok(None);
                }
                RecvEvent::Discarded { seq } => {
                    self.metrics
                        .record(&TransportEvent::DuplicateDiscarded { seq });
                    log::debug!(
                        "[gbn:rx] ← seq={} out of order (expected {})",
                        seq,
                        self.receiver.expected_seq()
                    );
                }
                RecvEvent::Corrupt => {
                    self.metrics.record(&TransportEvent::CorruptDiscarded);
                    log::debug!("[gbn:rx] ← corrupt datagram dropped");
                }
                RecvEvent::Ignored => {}
            }
        }
    }

    /// Receive the whole stream into memory.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, ConnError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.recv().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Keep answering retransmitted EOFs for `duration` so a peer whose EOF
    /// ACK was lost can still close cleanly.
    pub async fn linger(&mut self, duration: Duration) -> Result<(), ConnError> {
        let deadline = tokio::time::Instant::now() + duration;
        loop {
            let datagram = match timeout_at(deadline, self.channel.recv()).await {
                Ok(datagram) => datagram?,
                Err(_) => return Ok(()),
            };
            if let Some(ack) = self.receiver.on_datagram(&datagram).ack {
                self.channel.send(&ack.encode()?).await?;
                log::debug!("[gbn:rx] re-ACK {} while lingering", ack.seq);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use crate::metrics::{Counters, NoMetrics};
    use crate::packet::Packet;
    use crate::simulator::{LossyChannel, SimulatorConfig};

    fn chunks(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| format!("frame {i:03}").into_bytes()).collect()
    }

    fn config(window: u16) -> TransportConfig {
        TransportConfig {
            window_size: window,
            ..TransportConfig::default()
        }
    }

    #[tokio::test]
    async fn invalid_config_spawns_nothing() {
        let (a, b) = MemoryChannel::pair();
        let result = spawn_sender(a, &config(0), Arc::new(NoMetrics));
        assert!(matches!(
            result,
            Err(ConnError::Config(ConfigError::WindowSize(0)))
        ));
        // The channel went down with the rejected call.
        assert!(b.recv().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn clean_transfer_end_to_end() {
        let (a, b) = MemoryChannel::pair();
        let cfg = config(4);
        let counters = Arc::new(Counters::new());
        let mut tx = spawn_sender(a, &cfg, counters.clone()).unwrap();
        let mut rx = StreamReceiver::new(b, &cfg, Arc::new(NoMetrics));

        tx.submit(chunks(10)).await.unwrap();
        let (report, body) = tokio::join!(tx.finish(), rx.read_to_end());
        let report = report.unwrap();
        let body = body.unwrap();

        assert_eq!(body, chunks(10).concat());
        assert!(report.eof_acked);
        assert_eq!(report.stats.packets_sent, 10);
        assert_eq!(report.stats.acks_received, 10);
        assert_eq!(report.stats.retransmissions, 0);
        assert_eq!(counters.snapshot().packets_sent, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_stream_is_just_eof() {
        let (a, b) = MemoryChannel::pair();
        let cfg = config(4);
        let tx = spawn_sender(a, &cfg, Arc::new(NoMetrics)).unwrap();
        let mut rx = StreamReceiver::new(b, &cfg, Arc::new(NoMetrics));

        let (report, body) = tokio::join!(tx.finish(), rx.read_to_end());
        assert!(body.unwrap().is_empty());
        assert_eq!(report.unwrap().stats.packets_sent, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn lossy_both_ways_still_delivers_in_order() {
        let (a, b) = MemoryChannel::pair();
        let cfg = TransportConfig {
            window_size: 8,
            max_retries: 40,
            max_eof_retries: 20,
            idle_timeout: Duration::from_secs(60),
            ..TransportConfig::default()
        };
        let a = LossyChannel::new(a, SimulatorConfig::lossy(0.2, 1));
        let b = LossyChannel::new(b, SimulatorConfig::lossy(0.2, 2));
        let mut tx = spawn_sender(a, &cfg, Arc::new(NoMetrics)).unwrap();
        let mut rx = StreamReceiver::new(b, &cfg, Arc::new(NoMetrics));

        tx.submit(chunks(60)).await.unwrap();
        let (report, body) = tokio::join!(tx.finish(), async {
            let body = rx.read_to_end().await;
            // Ends with an error once the sender task drops its channel.
            let _ = rx.linger(Duration::from_secs(30)).await;
            body
        });

        assert_eq!(body.unwrap(), chunks(60).concat());
        let report = report.unwrap();
        assert!(report.stats.retransmissions > 0);
        assert_eq!(report.stats.packets_sent, 60);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_peer_exhausts_retries() {
        let (a, b) = MemoryChannel::pair();
        let cfg = TransportConfig {
            max_retries: 3,
            ..config(4)
        };
        let mut tx = spawn_sender(a, &cfg, Arc::new(NoMetrics)).unwrap();
        tx.submit(chunks(2)).await.unwrap();

        let err = tx.finish().await.unwrap_err();
        assert!(matches!(
            err,
            ConnError::Sender(SenderError::RetriesExhausted { attempts: 3, .. })
        ));
        // Original transmissions plus three go-back-N rounds.
        let mut seen = 0;
        while b.try_recv().is_some() {
            seen += 1;
        }
        assert_eq!(seen, 2 * 4);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_sender_stops_retransmitting() {
        let (a, b) = MemoryChannel::pair();
        let mut tx = spawn_sender(a, &config(4), Arc::new(NoMetrics)).unwrap();
        tx.submit(chunks(4)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        while b.try_recv().is_some() {}

        tx.cancel();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(b.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_spaces_new_packets() {
        let (a, b) = MemoryChannel::pair();
        let cfg = TransportConfig {
            pacing: Some(Duration::from_millis(100)),
            ..config(8)
        };
        let mut tx = spawn_sender(a, &cfg, Arc::new(NoMetrics)).unwrap();
        tx.submit(chunks(3)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut seen = 0;
        while b.try_recv().is_some() {
            seen += 1;
        }
        assert_eq!(seen, 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(b.try_recv().is_some());
        tx.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn receiver_idle_timeout() {
        let (_a, b) = MemoryChannel::pair();
        let cfg = TransportConfig {
            idle_timeout: Duration::from_secs(1),
            ..TransportConfig::default()
        };
        let mut rx = StreamReceiver::new(b, &cfg, Arc::new(NoMetrics));
        assert!(matches!(rx.recv().await, Err(ConnError::IdleTimeout(_))));
    }

    #[tokio::test]
    async fn receiver_consumes_prefetched_first() {
        let (a, b) = MemoryChannel::pair();
        let mut rx = StreamReceiver::new(b, &TransportConfig::default(), Arc::new(NoMetrics));
        rx.push_prefetched(Packet::data(0, b"early".to_vec()).encode().unwrap());
        a.send(&Packet::data(1, b"late".to_vec()).encode().unwrap())
            .await
            .unwrap();
        a.send(&Packet::eof(2).encode().unwrap()).await.unwrap();

        assert_eq!(rx.read_to_end().await.unwrap(), b"earlylate");
        let acks: Vec<Packet> = std::iter::from_fn(|| a.try_recv())
            .map(|d| Packet::decode(&d).unwrap())
            .collect();
        assert_eq!(acks, vec![Packet::ack(0), Packet::ack(1), Packet::ack(2)]);
    }
}
