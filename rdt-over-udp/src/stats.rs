//! Transfer counters and the periodic telemetry reporter.
//!
//! [`Stats`] is a bag of atomics written by the transmit/receive loop.  The
//! reporter task and the public accessors on
//! [`crate::connection::SenderSocket`] only ever read it, through a
//! [`StatsSnapshot`].

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Live counters shared between the loop and its observers.
#[derive(Debug, Default)]
pub struct Stats {
    bytes_sent: AtomicU64,
    bytes_acked: AtomicU64,
    next_to_send: AtomicU32,
    timeouts: AtomicU64,
    fast_retransmits: AtomicU64,
    effective_window: AtomicU32,
    /// Microseconds; zero until the handshake completes.
    estimated_rtt_us: AtomicU64,
    rto_us: AtomicU64,
}

impl Stats {
    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_acked(&self, bytes: u64) {
        self.bytes_acked.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fast_retransmit(&self) {
        self.fast_retransmits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_next_to_send(&self, seq: u32) {
        self.next_to_send.store(seq, Ordering::Relaxed);
    }

    pub fn set_effective_window(&self, window: u32) {
        self.effective_window.store(window, Ordering::Relaxed);
    }

    /// Publish the estimator's current output.
    pub fn set_timing(&self, estimated_rtt: Option<Duration>, rto: Duration) {
        let rtt_us = estimated_rtt.map_or(0, |d| d.as_micros() as u64);
        self.estimated_rtt_us.store(rtt_us, Ordering::Relaxed);
        self.rto_us.store(rto.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn estimated_rtt(&self) -> Option<Duration> {
        match self.estimated_rtt_us.load(Ordering::Relaxed) {
            0 => None,
            us => Some(Duration::from_micros(us)),
        }
    }

    pub fn rto(&self) -> Duration {
        Duration::from_micros(self.rto_us.load(Ordering::Relaxed))
    }

    /// Point-in-time copy; `sender_base` comes from the send queue.
    pub fn snapshot(&self, sender_base: u32) -> StatsSnapshot {
        StatsSnapshot {
            sender_base,
            next_to_send: self.next_to_send.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_acked: self.bytes_acked.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            fast_retransmits: self.fast_retransmits.load(Ordering::Relaxed),
            effective_window: self.effective_window.load(Ordering::Relaxed),
            estimated_rtt: self.estimated_rtt(),
            rto: self.rto(),
        }
    }
}

/// Read-only copy of [`Stats`] at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub sender_base: u32,
    pub next_to_send: u32,
    /// Payload bytes put on the wire, retransmissions included.
    pub bytes_sent: u64,
    /// Payload bytes cumulatively acknowledged.
    pub bytes_acked: u64,
    pub timeouts: u64,
    pub fast_retransmits: u64,
    pub effective_window: u32,
    pub estimated_rtt: Option<Duration>,
    pub rto: Duration,
}

impl StatsSnapshot {
    /// One status line: elapsed, base, MB acked, next, timeouts, fast
    /// retransmits, window, goodput and RTT.
    pub fn status_line(&self, elapsed: Duration, goodput_mbps: f64) -> String {
        format!(
            "[{:3}] B {:6} ({:6.1} MB) N {:6} T {} F {} W {} S {:.3} Mbps RTT {:.3}",
            elapsed.as_secs(),
            self.sender_base,
            self.bytes_acked as f64 / 1e6,
            self.next_to_send,
            self.timeouts,
            self.fast_retransmits,
            self.effective_window,
            goodput_mbps,
            self.estimated_rtt.unwrap_or_default().as_secs_f64(),
        )
    }
}

/// Log a status line every `interval` until `shutdown` flips or its sender drops.
///
/// Reads only; nothing here can fail the transfer.
pub async fn run_reporter<F>(snapshot: F, interval: Duration, mut shutdown: watch::Receiver<bool>)
where
    F: Fn() -> StatsSnapshot,
{
    let started = Instant::now();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_acked = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snap = snapshot();
                let delta = snap.bytes_acked.saturating_sub(last_acked);
                last_acked = snap.bytes_acked;
                let goodput = delta as f64 * 8.0 / interval.as_secs_f64() / 1e6;
                log::info!("[stats] {}", snap.status_line(started.elapsed(), goodput));
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    log::debug!("[stats] reporter stopped");
}
