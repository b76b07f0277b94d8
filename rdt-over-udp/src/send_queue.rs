//! Fixed-capacity ring of in-flight packet slots.
//!
//! [`SendQueue`] holds one [`QueueSlot`] per window position; a packet with
//! sequence `s` lives in slot `s mod window`.  Slots are allocated once when
//! the connection opens and reused in place for its whole lifetime.
//!
//! # Protocol contract
//!
//! Two counted permits coordinate the caller and the transmit loop:
//!
//! - `empty_slots`: acquired by [`SendQueue::push`] before a slot is written,
//!   released by ACK processing through [`SendQueue::grant`].  It starts at
//!   zero; the SYN-ACK grants the initial window.
//! - `full_slots`: released by `push`, acquired by the transmit loop through
//!   [`SendQueue::wait_queued`] before it reads a new slot.
//!
//! Because capacity is only ever granted up to `sender_base + window`, a
//! slot is never overwritten while its previous occupant is unacknowledged.
//!
//! ```text
//!  sender_base      next_to_send      current_seq     last_released
//!      │                  │                 │                │
//!  ────┼──────────────────┼─────────────────┼────────────────┼───▶ seq
//!      │ <── in flight ──▶│ <── queued ───▶ │ <── granted ──▶│
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use thiserror::Error;
use tokio::sync::Semaphore;

use crate::packet::{Flags, SenderHeader, SENDER_HEADER_LEN};

/// What a slot carries on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Data,
    Syn,
    Fin,
}

/// One packet awaiting (re)transmission or acknowledgement.
#[derive(Debug, Clone)]
pub struct QueueSlot {
    pub sequence: u32,
    pub kind: SlotKind,
    /// Time of the most recent transmission.
    pub transmit_time: Instant,
    /// Transmissions so far (0 = queued but never sent).
    pub transmit_count: u32,
    pub payload: Vec<u8>,
}

impl QueueSlot {
    /// A standalone control packet (SYN or FIN) that never enters the ring.
    pub fn control(kind: SlotKind, sequence: u32, payload: Vec<u8>) -> Self {
        Self {
            sequence,
            kind,
            transmit_time: Instant::now(),
            transmit_count: 0,
            payload,
        }
    }

    fn vacant(capacity: usize) -> Self {
        Self::control(SlotKind::Data, 0, Vec::with_capacity(capacity))
    }

    /// Stamp a (re)transmission.
    pub fn record_transmit(&mut self, now: Instant) {
        self.transmit_time = now;
        self.transmit_count += 1;
    }

    /// Serialise header + payload into a fresh datagram.
    pub fn encode(&self) -> Vec<u8> {
        let flags = match self.kind {
            SlotKind::Data => Flags::default(),
            SlotKind::Syn => Flags::SYN,
            SlotKind::Fin => Flags::FIN,
        };
        let mut buf = Vec::with_capacity(SENDER_HEADER_LEN + self.payload.len());
        SenderHeader { flags, seq: self.sequence }.encode_into(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// The queue was closed because the connection aborted or shut down.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("send queue closed")]
pub struct QueueClosed;

/// Ring of `window` slots plus the permits and counters that guard it.
#[derive(Debug)]
pub struct SendQueue {
    slots: Box<[Mutex<QueueSlot>]>,
    empty_slots: Semaphore,
    full_slots: Semaphore,
    /// Next sequence number to assign (written by the producer only).
    current_seq: AtomicU32,
    /// Oldest unacknowledged sequence number (written by the ACK handler only).
    sender_base: AtomicU32,
}

impl SendQueue {
    /// Allocate `window` slots; the first data packet gets `first_seq`.
    pub fn new(window: usize, first_seq: u32, payload_capacity: usize) -> Self {
        assert!(window >= 1, "window must be at least 1");
        let slots: Box<[Mutex<QueueSlot>]> = (0..window)
            .map(|_| Mutex::new(QueueSlot::vacant(payload_capacity)))
            .collect();
        Self {
            slots,
            empty_slots: Semaphore::new(0),
            full_slots: Semaphore::new(0),
            current_seq: AtomicU32::new(first_seq),
            sender_base: AtomicU32::new(first_seq),
        }
    }

    pub fn window(&self) -> usize {
        self.slots.len()
    }

    /// Copy `payload` into the next slot, waiting for a free one first.
    ///
    /// Returns the sequence number assigned to the packet.  Only one task may
    /// push at a time.
    pub async fn push(&self, payload: &[u8]) -> Result<u32, QueueClosed> {
        self.empty_slots
            .acquire()
            .await
            .map_err(|_| QueueClosed)?
            .forget();

        let seq = self.current_seq.load(Ordering::Acquire);
        {
            let mut slot = self.lock(seq);
            slot.sequence = seq;
            slot.kind = SlotKind::Data;
            slot.transmit_count = 0;
            slot.payload.clear();
            slot.payload.extend_from_slice(payload);
        }
        self.current_seq.store(seq.wrapping_add(1), Ordering::Release);
        self.full_slots.add_permits(1);
        Ok(seq)
    }

    /// Wait until at least one pushed slot has not yet been handed to the
    /// transmit loop, and claim it.
    ///
    /// Cancel-safe: dropping the future before it resolves claims nothing.
    pub async fn wait_queued(&self) -> Result<(), QueueClosed> {
        self.full_slots
            .acquire()
            .await
            .map_err(|_| QueueClosed)?
            .forget();
        Ok(())
    }

    /// Release `n` more slots to the producer.
    pub fn grant(&self, n: usize) {
        if n > 0 {
            self.empty_slots.add_permits(n);
        }
    }

    /// Run `f` with exclusive access to the slot holding `seq`.
    ///
    /// Never hold the result across an `.await`; copy out what you need.
    pub fn with_slot<R>(&self, seq: u32, f: impl FnOnce(&mut QueueSlot) -> R) -> R {
        f(&mut self.lock(seq))
    }

    /// Move the window base forward after a cumulative ACK.
    pub fn advance_base(&self, new_base: u32) {
        let old = self.sender_base.swap(new_base, Ordering::AcqRel);
        debug_assert!(new_base.wrapping_sub(old) as usize <= self.window());
    }

    pub fn current_seq(&self) -> u32 {
        self.current_seq.load(Ordering::Acquire)
    }

    pub fn sender_base(&self) -> u32 {
        self.sender_base.load(Ordering::Acquire)
    }

    /// Packets queued or in flight but not yet acknowledged.
    pub fn outstanding(&self) -> u32 {
        self.current_seq().wrapping_sub(self.sender_base())
    }

    /// `true` once everything pushed has been acknowledged.
    pub fn is_drained(&self) -> bool {
        self.outstanding() == 0
    }

    /// Slots the producer could fill right now without blocking.
    pub fn available_slots(&self) -> usize {
        self.empty_slots.available_permits()
    }

    /// Wake every waiter with [`QueueClosed`]; further pushes fail immediately.
    pub fn close(&self) {
        self.empty_slots.close();
        self.full_slots.close();
    }

    pub fn is_closed(&self) -> bool {
        self.empty_slots.is_closed()
    }

    fn lock(&self, seq: u32) -> MutexGuard<'_, QueueSlot> {
        let idx = seq as usize % self.slots.len();
        self.slots[idx].lock().unwrap_or_else(PoisonError::into_inner)
    }
}
