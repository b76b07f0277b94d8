//! Round-trip-time estimation and retransmission timeout (RTO) computation.
//!
//! [`RttEstimator`] follows the Jacobson/Karels scheme:
//!
//! ```text
//!   est ← (1 − α)·est + α·S          α = 1/8
//!   dev ← (1 − β)·dev + β·|S − est|  β = 1/4
//!   RTO = est + 4·max(dev, min_deviation)
//! ```
//!
//! Three phases feed it:
//! 1. Before the handshake the RTO is a conservative `max(default_timeout, 2 × hint)`.
//! 2. The SYN round trip gives a single sample with no deviation yet, so the
//!    RTO becomes `handshake_rto_factor × sample`.
//! 3. Data samples (only from packets sent exactly once, per Karn's rule)
//!    drive the smoothed estimate; the first one seeds `est = S`, `dev = S/2`.
//!
//! The estimator is owned by the transmit/receive loop; other tasks only see
//! the values it publishes through [`crate::stats::Stats`].

use std::time::Duration;

const ALPHA: f64 = 0.125;
const BETA: f64 = 0.25;

/// Adjustable timeout parameters.
#[derive(Debug, Clone)]
pub struct TimerConfig {
    /// Floor for the handshake timeout before any RTT sample is available.
    pub default_timeout: Duration,
    /// Lower clamp on any computed RTO.
    pub min_rto: Duration,
    /// Upper clamp on any computed RTO.
    pub max_rto: Duration,
    /// Deviation floor used in the RTO formula.
    pub min_deviation: Duration,
    /// Multiplier applied to the handshake sample.
    pub handshake_rto_factor: u32,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(1),
            min_rto: Duration::from_millis(10),
            max_rto: Duration::from_secs(60),
            min_deviation: Duration::from_millis(10),
            handshake_rto_factor: 3,
        }
    }
}

/// Smoothed RTT / deviation tracker for one connection.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    config: TimerConfig,
    /// Smoothed RTT in seconds.
    estimated: Option<f64>,
    /// RTT deviation in seconds; `None` until the first data sample.
    deviation: Option<f64>,
    rto: Duration,
}

impl RttEstimator {
    /// Create an estimator seeded from the caller's RTT hint.
    pub fn new(config: TimerConfig, rtt_hint: Duration) -> Self {
        let rto = config
            .default_timeout
            .max(rtt_hint.saturating_mul(2))
            .min(config.max_rto);
        Self {
            config,
            estimated: None,
            deviation: None,
            rto,
        }
    }

    /// Fold in the SYN / SYN-ACK round trip.
    pub fn on_handshake_sample(&mut self, sample: Duration) {
        self.estimated = Some(sample.as_secs_f64());
        self.rto = self.clamp(sample.saturating_mul(self.config.handshake_rto_factor));
    }

    /// Fold in a clean data-path sample and recompute the RTO.
    pub fn on_sample(&mut self, sample: Duration) {
        let s = sample.as_secs_f64();
        let (est, dev) = match self.deviation {
            None => (s, s / 2.0),
            Some(dev) => {
                let est = (1.0 - ALPHA) * self.estimated.unwrap_or(s) + ALPHA * s;
                let dev = (1.0 - BETA) * dev + BETA * (s - est).abs();
                (est, dev)
            }
        };
        self.estimated = Some(est);
        self.deviation = Some(dev);

        let floor = self.config.min_deviation.as_secs_f64();
        self.rto = self.clamp(Duration::from_secs_f64(est + 4.0 * dev.max(floor)));
    }

    /// Current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.rto
    }

    pub fn estimated_rtt(&self) -> Option<Duration> {
        self.estimated.map(Duration::from_secs_f64)
    }

    pub fn deviation(&self) -> Option<Duration> {
        self.deviation.map(Duration::from_secs_f64)
    }

    fn clamp(&self, rto: Duration) -> Duration {
        rto.clamp(self.config.min_rto, self.config.max_rto)
    }
}
