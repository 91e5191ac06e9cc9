//! Retransmission timeout management.
//!
//! Go-Back-N keeps **one** timer per connection, always bound to the oldest
//! unacknowledged packet (`base`).  The sender state machine decides *when*
//! the timer must change and reports it as a [`TimerCommand`]; the connection
//! task applies the command to a real `tokio::time::Sleep`.  This module
//! decides *how long* the timer runs:
//!
//! RTO is computed using Jacobson's algorithm (RFC 6298):
//!   `RTO = SRTT + 4 × RTTVAR`
//! and doubles on each consecutive timeout (exponential back-off) up to a
//! configurable maximum.

use std::time::Duration;

/// What the owner of the single retransmit timer must do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerCommand {
    /// Leave the timer as it is.
    Keep,
    /// The window was empty and now holds a packet: start the timer.
    Arm,
    /// `base` moved (or the window was retransmitted): start a fresh deadline.
    Restart,
    /// Every packet is acknowledged: stop the timer.
    Disarm,
}

/// Adjustable timeout parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerConfig {
    /// RTO before any RTT sample is available.
    pub initial_rto: Duration,
    /// Floor for the computed RTO.
    pub min_rto: Duration,
    /// Ceiling for the RTO after repeated back-off.
    pub max_rto: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            initial_rto: Duration::from_millis(500),
            min_rto: Duration::from_millis(50),
            max_rto: Duration::from_secs(8),
        }
    }
}

/// RTO estimator for one connection.
#[derive(Debug, Clone)]
pub struct RetransmitTimer {
    pub config: TimerConfig,
    /// Current RTO, updated after each RTT sample or back-off.
    current_rto: Duration,
    /// Smoothed RTT estimate (SRTT).
    srtt: Option<Duration>,
    /// RTT variance estimate (RTTVAR).
    rttvar: Option<Duration>,
}

impl Default for RetransmitTimer {
    fn default() -> Self {
        Self::new(TimerConfig::default())
    }
}

impl RetransmitTimer {
    pub fn new(config: TimerConfig) -> Self {
        Self {
            config,
            current_rto: config.initial_rto,
            srtt: None,
            rttvar: None,
        }
    }

    /// The timeout to use for the next arm or restart.
    pub fn rto(&self) -> Duration {
        self.current_rto
    }

    /// Smoothed RTT, once at least one sample has been taken.
    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// Record a new RTT sample and update SRTT / RTTVAR / RTO (RFC 6298 §2).
    ///
    /// On the first sample:  SRTT = R,  RTTVAR = R/2,  RTO = SRTT + 4·RTTVAR.
    /// Subsequent samples:   RTTVAR = 3/4·RTTVAR + 1/4·|SRTT − R|
    ///                       SRTT   = 7/8·SRTT   + 1/8·R
    pub fn record_rtt_sample(&mut self, sample: Duration) {
        match (self.srtt, self.rttvar) {
            (Some(srtt), Some(rttvar)) => {
                let diff = sample.abs_diff(srtt);
                self.rttvar = Some(rttvar * 3 / 4 + diff / 4);
                self.srtt = Some(srtt * 7 / 8 + sample / 8);
            }
            _ => {
                self.srtt = Some(sample);
                self.rttvar = Some(sample / 2);
            }
        }
        self.reset();
    }

    /// Double the RTO on retransmit timeout (RFC 6298 §5.5), capped at
    /// `config.max_rto`.
    pub fn back_off(&mut self) {
        self.current_rto = (self.current_rto * 2).min(self.config.max_rto);
    }

    /// Restore `current_rto` from the current SRTT / RTTVAR estimates,
    /// clearing any back-off.
    ///
    /// Falls back to `initial_rto` before the first RTT sample is available.
    pub fn reset(&mut self) {
        self.current_rto = match (self.srtt, self.rttvar) {
            (Some(srtt), Some(rttvar)) => {
                (srtt + rttvar * 4).clamp(self.config.min_rto, self.config.max_rto)
            }
            _ => self.config.initial_rto,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn starts_at_initial_rto() {
        let t = RetransmitTimer::default();
        assert_eq!(t.rto(), ms(500));
        assert!(t.srtt().is_none());
    }

    #[test]
    fn first_sample_sets_srtt_and_rto() {
        let mut t = RetransmitTimer::default();
        t.record_rtt_sample(ms(100));
        assert_eq!(t.srtt(), Some(ms(100)));
        // 100 + 4 × 50
        assert_eq!(t.rto(), ms(300));
    }

    #[test]
    fn second_sample_smooths() {
        let mut t = RetransmitTimer::default();
        t.record_rtt_sample(ms(100));
        t.record_rtt_sample(ms(180));
        // RTTVAR = 37.5 + 20 = 57.5, SRTT = 87.5 + 22.5 = 110
        assert_eq!(t.srtt(), Some(ms(110)));
        assert_eq!(t.rto(), ms(340));
    }

    #[test]
    fn back_off_doubles_and_caps() {
        let mut t = RetransmitTimer::default();
        t.back_off();
        assert_eq!(t.rto(), ms(1000));
        for _ in 0..10 {
            t.back_off();
        }
        assert_eq!(t.rto(), Duration::from_secs(8));
    }

    #[test]
    fn reset_clears_back_off() {
        let mut t = RetransmitTimer::default();
        t.back_off();
        t.back_off();
        t.reset();
        assert_eq!(t.rto(), ms(500));
    }

    #[test]
    fn tiny_samples_respect_min_rto() {
        let mut t = RetransmitTimer::default();
        t.record_rtt_sample(Duration::from_micros(40));
        assert_eq!(t.rto(), ms(50));
    }
}
