//! Transport and session tunables.
//!
//! The default 1392-byte chunk keeps every DATA datagram (payload plus the
//! 7-byte header) under a 1400-byte budget.  The retransmission timeout
//! starts at 500 ms and the window is small and fixed.

use std::time::Duration;

use thiserror::Error;

use crate::packet::MAX_PAYLOAD;
use crate::seq::MAX_WINDOW;
use crate::timer::TimerConfig;

/// Everything a connection needs to know before it starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Go-Back-N window size N (packets in flight).
    pub window_size: u16,
    /// Payload bytes per DATA packet.
    pub chunk_size: usize,
    pub timer: TimerConfig,
    /// Consecutive timeouts without progress before the connection is
    /// declared lost.
    pub max_retries: u32,
    /// EOF retransmissions before the sender stops waiting for its ACK.
    pub max_eof_retries: u32,
    /// Minimum spacing between *new* DATA packets (`None` = send as fast as
    /// the window allows).  Retransmissions are never paced.
    pub pacing: Option<Duration>,
    /// Receiver gives up when no datagram arrives for this long.
    pub idle_timeout: Duration,
    /// How long a client waits for the response line before re-sending PLAY.
    pub request_timeout: Duration,
    /// PLAY re-sends before the client gives up.
    pub request_retries: u32,
    /// How long a client keeps re-ACKing a duplicate EOF after end-of-stream.
    pub eof_linger: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            window_size: 8,
            chunk_size: 1392,
            timer: TimerConfig::default(),
            max_retries: 10,
            max_eof_retries: 5,
            pacing: None,
            idle_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_millis(500),
            request_retries: 5,
            eof_linger: Duration::from_secs(2),
        }
    }
}

impl TransportConfig {
    /// Reject values the protocol cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size == 0 || self.window_size > MAX_WINDOW {
            return Err(ConfigError::WindowSize(self.window_size));
        }
        if self.chunk_size == 0 || self.chunk_size > MAX_PAYLOAD {
            return Err(ConfigError::ChunkSize(self.chunk_size));
        }
        if self.timer.min_rto > self.timer.max_rto
            || self.timer.initial_rto.is_zero()
            || self.timer.initial_rto > self.timer.max_rto
        {
            return Err(ConfigError::Timer(self.timer));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("window size {0} must be between 1 and {MAX_WINDOW}")]
    WindowSize(u16),
    #[error("chunk size {0} must be between 1 and {MAX_PAYLOAD}")]
    ChunkSize(usize),
    #[error("inconsistent timer bounds: {0:?}")]
    Timer(TimerConfig),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        TransportConfig::default().validate().unwrap();
    }

    #[test]
    fn default_chunk_fits_datagram_budget() {
        let cfg = TransportConfig::default();
        assert!(cfg.chunk_size + crate::packet::HEADER_LEN <= 1400);
    }

    #[test]
    fn window_bounds() {
        let mut cfg = TransportConfig::default();
        cfg.window_size = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::WindowSize(0))));
        cfg.window_size = MAX_WINDOW;
        assert!(cfg.validate().is_ok());
        cfg.window_size = MAX_WINDOW + 1;
        assert!(matches!(cfg.validate(), Err(ConfigError::WindowSize(_))));
    }

    #[test]
    fn chunk_bounds() {
        let mut cfg = TransportConfig::default();
        cfg.chunk_size = MAX_PAYLOAD + 1;
        assert!(matches!(cfg.validate(), Err(ConfigError::ChunkSize(_))));
    }

    #[test]
    fn timer_bounds() {
        let mut cfg = TransportConfig::default();
        cfg.timer.min_rto = Duration::from_secs(60);
        assert!(matches!(cfg.validate(), Err(ConfigError::Timer(_))));
    }
}
