//! Tunables for a [`crate::connection::SenderSocket`].

use std::time::Duration;

use crate::timer::TimerConfig;

/// Sender configuration.  [`Default`] gives the standard protocol values.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub timer: TimerConfig,
    /// SYN transmissions before `open` gives up.
    pub max_syn_attempts: u32,
    /// FIN transmissions before `close` gives up.
    pub max_fin_attempts: u32,
    /// Transmissions of a single data packet before the connection aborts.
    pub max_attempts: u32,
    /// Duplicate ACKs that trigger a fast retransmit.
    pub fast_retransmit_threshold: u32,
    /// How often the telemetry reporter logs a status line.
    pub stats_interval: Duration,
    /// Initial and maximum delay between drain checks in `close`.
    pub close_poll_min: Duration,
    pub close_poll_max: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            timer: TimerConfig::default(),
            max_syn_attempts: 3,
            max_fin_attempts: 5,
            max_attempts: 50,
            fast_retransmit_threshold: 3,
            stats_interval: Duration::from_secs(2),
            close_poll_min: Duration::from_millis(5),
            close_poll_max: Duration::from_millis(200),
        }
    }
}
