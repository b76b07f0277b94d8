//! The transmit/receive loop that drives an established connection.
//!
//! One [`Worker`] task owns socket reads, the retransmission timer and the
//! RTT estimator.  It multiplexes four wake-ups with `tokio::select!`:
//!
//! ```text
//!            ┌──────────────── shutdown (watch) ───────────────┐
//!            │                                                 ▼
//!  send() ──▶ full_slots ──▶ transmit slot next_to_send ──▶ socket ──▶ peer
//!                                                              │
//!  send() ◀── empty_slots ◀── advance base / release ◀── ACK ◀─┘
//!                                  │
//!                          timer = oldest slot's transmit_time + RTO
//! ```
//!
//! Loss is repaired on two paths, both of which resend the oldest
//! unacknowledged slot in place:
//!
//! - **fast retransmit** after `fast_retransmit_threshold` duplicate ACKs;
//! - **timeout retransmit** when the deadline passes.
//!
//! A slot that would exceed `max_attempts` transmissions aborts the
//! connection with [`SenderError::RetransmitLimitExceeded`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::config::SenderConfig;
use crate::connection::Shared;
use crate::error::SenderError;
use crate::packet::ReceiverHeader;
use crate::socket::{Socket, SocketError};
use crate::timer::RttEstimator;

/// How far away a disarmed timer sleeps.
const FAR_FUTURE: Duration = Duration::from_secs(365 * 24 * 3600);

/// Send-window slots granted for an advertised receive window.
///
/// Never zero: a closed receiver window would otherwise stall the sender
/// with nothing in flight to elicit a window update.
pub(crate) fn effective_window(window: usize, advertised: u32) -> u32 {
    (advertised as usize).clamp(1, window) as u32
}

pub(crate) struct Worker {
    socket: Arc<Socket>,
    shared: Arc<Shared>,
    config: SenderConfig,
    estimator: RttEstimator,
    next_to_send: u32,
    /// One past the highest sequence the producer has been allowed to fill.
    last_released: u32,
    dup_acks: u32,
    deadline: Option<Instant>,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    /// `granted` is the number of slots already released after the SYN-ACK.
    pub(crate) fn new(
        socket: Arc<Socket>,
        shared: Arc<Shared>,
        config: SenderConfig,
        estimator: RttEstimator,
        granted: u32,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let base = shared.queue.sender_base();
        Self {
            socket,
            shared,
            config,
            estimator,
            next_to_send: base,
            last_released: base.wrapping_add(granted),
            dup_acks: 0,
            deadline: None,
            shutdown,
        }
    }

    /// Run until shutdown or a fatal transport error.
    ///
    /// On error the connection is aborted (queue closed, blocked callers
    /// woken) before the error is returned.
    pub(crate) async fn run(mut self) -> Result<(), SenderError> {
        let outcome = self.drive().await;
        if let Err(e) = &outcome {
            log::error!("[loop] transport aborted: {e}");
            self.shared.abort();
        }
        outcome
    }

    async fn drive(&mut self) -> Result<(), SenderError> {
        loop {
            let deadline = self.deadline;
            let wake_at = deadline
                .map(tokio::time::Instant::from_std)
                .unwrap_or_else(|| tokio::time::Instant::now() + FAR_FUTURE);
            let timer = tokio::time::sleep_until(wake_at);

            tokio::select! {
                biased;

                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        log::debug!("[loop] shutdown at base={}", self.shared.queue.sender_base());
                        return Ok(());
                    }
                }

                received = self.socket.recv_header() => match received {
                    Ok(header) => self.on_header(header).await?,
                    Err(SocketError::Io(e)) => return Err(SenderError::RecvFailed(e)),
                    Err(e) => log::debug!("[loop] ignoring datagram: {e}"),
                },

                _ = timer, if deadline.is_some() => self.on_timeout().await?,

                queued = self.shared.queue.wait_queued() => {
                    if queued.is_err() {
                        return Ok(());
                    }
                    self.transmit_next().await?;
                }
            }
        }
    }

    /// First transmission of the slot at `next_to_send`.
    async fn transmit_next(&mut self) -> Result<(), SenderError> {
        let seq = self.next_to_send;
        let now = Instant::now();
        let (datagram, len) = self.shared.queue.with_slot(seq, |slot| {
            slot.record_transmit(now);
            (slot.encode(), slot.payload.len())
        });
        self.socket.send(&datagram).await.map_err(SenderError::SendFailed)?;

        self.shared.stats.record_sent(len);
        self.next_to_send = seq.wrapping_add(1);
        self.shared.stats.set_next_to_send(self.next_to_send);
        if self.deadline.is_none() {
            self.deadline = Some(now + self.estimator.rto());
        }
        log::trace!("[loop] → DATA seq={seq} len={len}");
        Ok(())
    }

    /// Resend the slot holding `seq` and restart the timer from now.
    async fn retransmit(&mut self, seq: u32) -> Result<(), SenderError> {
        let now = Instant::now();
        let max_attempts = self.config.max_attempts;
        let (datagram, len) = self.shared.queue.with_slot(seq, |slot| {
            if slot.transmit_count >= max_attempts {
                return Err(SenderError::RetransmitLimitExceeded {
                    seq,
                    attempts: slot.transmit_count,
                });
            }
            slot.record_transmit(now);
            Ok((slot.encode(), slot.payload.len()))
        })?;
        self.socket.send(&datagram).await.map_err(SenderError::SendFailed)?;

        self.shared.stats.record_sent(len);
        self.deadline = Some(now + self.estimator.rto());
        Ok(())
    }

    async fn on_timeout(&mut self) -> Result<(), SenderError> {
        let base = self.shared.queue.sender_base();
        if base == self.next_to_send {
            self.deadline = None;
            return Ok(());
        }
        self.shared.stats.record_timeout();
        log::debug!(
            "[loop] timeout, retransmitting seq={base} rto={:?}",
            self.estimator.rto()
        );
        self.retransmit(base).await
    }

    async fn on_header(&mut self, header: ReceiverHeader) -> Result<(), SenderError> {
        if !header.flags.ack || header.flags.syn || header.flags.fin {
            log::debug!("[loop] ignoring non-ACK {header:?}");
            return Ok(());
        }

        let base = self.shared.queue.sender_base();
        let ack = header.ack_seq;
        let advance = ack.wrapping_sub(base);
        let in_flight = self.next_to_send.wrapping_sub(base);
        if advance > in_flight {
            // Stale (behind base) or naming data we never sent.
            log::debug!(
                "[loop] ignoring ack={ack} outside [{base}, {}]",
                self.next_to_send
            );
            return Ok(());
        }

        if advance == 0 {
            self.release(ack, header.receive_window);
            return self.on_duplicate_ack(ack).await;
        }

        self.on_new_ack(base, header, Instant::now());
        Ok(())
    }

    fn on_new_ack(&mut self, base: u32, header: ReceiverHeader, now: Instant) {
        let ack = header.ack_seq;
        let queue = &self.shared.queue;

        // Karn's rule: sample only when neither the acknowledged packet nor
        // the new base packet has been retransmitted.  Read before releasing
        // slots, after which the producer may overwrite them.
        let (acked_count, acked_time) =
            queue.with_slot(ack.wrapping_sub(1), |s| (s.transmit_count, s.transmit_time));
        let base_clean = ack == self.next_to_send || queue.with_slot(ack, |s| s.transmit_count <= 1);
        let sample = (acked_count == 1 && base_clean)
            .then(|| now.saturating_duration_since(acked_time));

        let mut bytes = 0u64;
        let mut seq = base;
        while seq != ack {
            bytes += queue.with_slot(seq, |s| s.payload.len() as u64);
            seq = seq.wrapping_add(1);
        }

        queue.advance_base(ack);
        self.shared.stats.record_acked(bytes);
        self.dup_acks = 0;

        if let Some(sample) = sample {
            self.estimator.on_sample(sample);
            self.shared
                .stats
                .set_timing(self.estimator.estimated_rtt(), self.estimator.rto());
        }

        self.release(ack, header.receive_window);

        self.deadline = if ack == self.next_to_send {
            None
        } else {
            let sent = self.shared.queue.with_slot(ack, |s| s.transmit_time);
            Some(sent + self.estimator.rto())
        };

        log::trace!(
            "[loop] ← ACK ack={ack} acked={} rto={:?}",
            ack.wrapping_sub(base),
            self.estimator.rto()
        );
    }

    async fn on_duplicate_ack(&mut self, ack: u32) -> Result<(), SenderError> {
        if ack == self.next_to_send {
            // Nothing outstanding; a repeated ACK carries no loss signal.
            return Ok(());
        }
        self.dup_acks += 1;
        if self.dup_acks == self.config.fast_retransmit_threshold {
            self.shared.stats.record_fast_retransmit();
            log::debug!(
                "[loop] fast retransmit seq={ack} after {} duplicate ACKs",
                self.dup_acks
            );
            self.retransmit(ack).await?;
        }
        Ok(())
    }

    /// Top up the producer's permits so it may fill up to `base + window`.
    fn release(&mut self, base: u32, advertised: u32) {
        let window = effective_window(self.shared.queue.window(), advertised);
        let target = base.wrapping_add(window);
        let fresh = target.wrapping_sub(self.last_released) as i32;
        if fresh > 0 {
            self.shared.queue.grant(fresh as usize);
            self.last_released = target;
        }
        self.shared.stats.set_effective_window(window);
    }
}
