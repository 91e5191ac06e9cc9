//! Network fault simulator for testing.
//!
//! Real networks drop, reorder, duplicate and corrupt packets.  To exercise
//! the reliability mechanisms without depending on actual network
//! conditions, [`LossyChannel`] wraps any [`Channel`] and applies a
//! configurable fault model to everything it *sends*:
//!
//! | Fault            | Description                                              |
//! |------------------|----------------------------------------------------------|
//! | Random loss      | Drop a datagram with probability `loss_rate`.            |
//! | Burst loss       | Within the first `duration` of every `interval`, drop    |
//! |                  | with probability `burst.rate` (checked before random).   |
//! | Reordering       | Hold a datagram back and release it after the next one.  |
//! | Duplication      | Deliver a datagram twice.                                |
//! | Corruption       | Flip one random bit.                                     |
//!
//! Every decision comes from one `StdRng`; with `seed` set, a run is
//! reproducible.  Burst windows are measured on the tokio clock so they also
//! behave under `tokio::time::pause`.

use std::io;
use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::channel::Channel;

/// Periodic high-loss window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BurstLoss {
    /// Drop probability inside the burst window.
    pub rate: f64,
    /// Length of the burst window.
    pub duration: Duration,
    /// Period between burst window starts.
    pub interval: Duration,
}

/// Configuration for the fault-injection model.
///
/// All probabilities are in the range `[0.0, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatorConfig {
    pub loss_rate: f64,
    pub burst: Option<BurstLoss>,
    pub reorder_rate: f64,
    pub duplicate_rate: f64,
    pub corrupt_rate: f64,
    /// `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // No faults: a transparent pass-through.
        Self {
            loss_rate: 0.0,
            burst: None,
            reorder_rate: 0.0,
            duplicate_rate: 0.0,
            corrupt_rate: 0.0,
            seed: None,
        }
    }
}

impl SimulatorConfig {
    /// Uniform random loss with a fixed seed.
    pub fn lossy(loss_rate: f64, seed: u64) -> Self {
        Self {
            loss_rate,
            seed: Some(seed),
            ..Self::default()
        }
    }
}

/// What the simulator has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulatorStats {
    pub offered: u64,
    pub dropped: u64,
    pub reordered: u64,
    pub duplicated: u64,
    pub corrupted: u64,
}

struct FaultState {
    rng: StdRng,
    /// Datagram held back for reordering.
    held: Option<Vec<u8>>,
    stats: SimulatorStats,
}

/// A fault-injecting wrapper around another channel.
pub struct LossyChannel<C> {
    inner: C,
    config: SimulatorConfig,
    started: tokio::time::Instant,
    state: Mutex<FaultState>,
}

impl<C: Channel> LossyChannel<C> {
    pub fn new(inner: C, config: SimulatorConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            inner,
            config,
            started: tokio::time::Instant::now(),
            state: Mutex::new(FaultState {
                rng,
                held: None,
                stats: SimulatorStats::default(),
            }),
        }
    }

    pub fn stats(&self) -> SimulatorStats {
        self.lock().stats
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FaultState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn in_burst(&self) -> bool {
        match self.config.burst {
            Some(burst) if !burst.interval.is_zero() => {
                let elapsed = self.started.elapsed().as_nanos();
                elapsed % burst.interval.as_nanos() < burst.duration.as_nanos()
            }
            _ => false,
        }
    }

    /// Decide the fate of one outbound datagram; returns what actually goes
    /// out, in order.
    fn plan(&self, datagram: &[u8]) -> Vec<Vec<u8>> {
        let in_burst = self.in_burst();
        let mut st = self.lock();
        let st = &mut *st;
        st.stats.offered += 1;

        let burst_drop = in_burst
            && self
                .config
                .burst
                .is_some_and(|b| st.rng.random::<f64>() < b.rate);
        if burst_drop || st.rng.random::<f64>() < self.config.loss_rate {
            st.stats.dropped += 1;
            return st.held.take().into_iter().collect();
        }

        let mut datagram = datagram.to_vec();
        if !datagram.is_empty() && st.rng.random::<f64>() < self.config.corrupt_rate {
            let bit = st.rng.random_range(0..datagram.len() * 8);
            datagram[bit / 8] ^= 1 << (bit % 8);
            st.stats.corrupted += 1;
        }

        if st.held.is_none() && st.rng.random::<f64>() < self.config.reorder_rate {
            st.stats.reordered += 1;
            st.held = Some(datagram);
            return Vec::new();
        }

        let mut out = vec![datagram.clone()];
        if st.rng.random::<f64>() < self.config.duplicate_rate {
            st.stats.duplicated += 1;
            out.push(datagram);
        }
        out.extend(st.held.take());
        out
    }
}

impl<C: Channel> Channel for LossyChannel<C> {
    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        for d in self.plan(datagram) {
            self.inner.send(&d).await?;
        }
        Ok(())
    }

    async fn recv(&self) -> io::Result<Vec<u8>> {
        self.inner.recv().await
    }
}
