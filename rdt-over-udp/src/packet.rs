//! Wire-format definitions for sender and receiver datagrams.
//!
//! The protocol is asymmetric: the sender only ever transmits a
//! [`SenderHeader`] (optionally followed by a payload), and the receiver only
//! ever answers with a [`ReceiverHeader`].  The connection-setup packet
//! additionally carries [`LinkProperties`] describing the link the peer should
//! emulate.
//!
//! No I/O happens here; this is pure data transformation.
//!
//! # Wire format
//!
//! All multi-byte fields are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                 Magic (0x8311AA)              |F|A|S| Rsvd(0) |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |            Sequence Number (sender) / Receive Window          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                  Ack Sequence (receiver only)                 |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Sender header: [`SENDER_HEADER_LEN`] = 8 bytes.
//! Receiver header: [`RECEIVER_HEADER_LEN`] = 12 bytes.

use thiserror::Error;

/// Sentinel carried in the upper 24 bits of every flags word.
pub const MAGIC: u32 = 0x8311AA;

/// Largest datagram the sender emits (Ethernet MTU minus IPv4 + UDP headers).
pub const MAX_PACKET: usize = 1500 - 28;

/// Byte length of the sender header on the wire.
pub const SENDER_HEADER_LEN: usize = 8;

/// Byte length of the receiver header on the wire.
pub const RECEIVER_HEADER_LEN: usize = 12;

/// Largest application payload that fits in one data packet.
pub const MAX_PAYLOAD: usize = MAX_PACKET - SENDER_HEADER_LEN;

/// Byte length of the serialised [`LinkProperties`].
pub const LINK_PROPERTIES_LEN: usize = 20;

const BIT_SYN: u32 = 1 << 5;
const BIT_ACK: u32 = 1 << 6;
const BIT_FIN: u32 = 1 << 7;
const RESERVED_MASK: u32 = 0x1f;

/// Control bits shared by both header kinds.
///
/// The magic value is implied: it is always written on encode and always
/// checked on decode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
}

impl Flags {
    pub const SYN: Flags = Flags { syn: true, ack: false, fin: false };
    pub const FIN: Flags = Flags { syn: false, ack: false, fin: true };
    pub const ACK: Flags = Flags { syn: false, ack: true, fin: false };
    pub const SYN_ACK: Flags = Flags { syn: true, ack: true, fin: false };
    pub const FIN_ACK: Flags = Flags { syn: false, ack: true, fin: true };

    /// Pack into the 32-bit flags word (magic in the upper 24 bits).
    pub fn to_word(self) -> u32 {
        let mut word = MAGIC << 8;
        if self.syn {
            word |= BIT_SYN;
        }
        if self.ack {
            word |= BIT_ACK;
        }
        if self.fin {
            word |= BIT_FIN;
        }
        word
    }

    /// Unpack a flags word, rejecting foreign traffic.
    pub fn from_word(word: u32) -> Result<Self, PacketError> {
        let magic = word >> 8;
        if magic != MAGIC {
            return Err(PacketError::BadMagic(magic));
        }
        if word & RESERVED_MASK != 0 {
            return Err(PacketError::ReservedBitsSet);
        }
        Ok(Flags {
            syn: word & BIT_SYN != 0,
            ack: word & BIT_ACK != 0,
            fin: word & BIT_FIN != 0,
        })
    }
}

/// Prefix of every datagram sent by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderHeader {
    pub flags: Flags,
    /// Packet-granularity sequence number.
    pub seq: u32,
}

impl SenderHeader {
    /// Append the serialised header to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.flags.to_word().to_be_bytes());
        buf.extend_from_slice(&self.seq.to_be_bytes());
    }

    /// Parse a header from the front of `buf`, returning it and the remaining payload.
    pub fn decode(buf: &[u8]) -> Result<(Self, &[u8]), PacketError> {
        if buf.len() < SENDER_HEADER_LEN {
            return Err(PacketError::BufferTooShort {
                needed: SENDER_HEADER_LEN,
                got: buf.len(),
            });
        }
        let flags = Flags::from_word(read_u32(buf, 0))?;
        let seq = read_u32(buf, 4);
        Ok((SenderHeader { flags, seq }, &buf[SENDER_HEADER_LEN..]))
    }
}

/// The only datagram a receiver ever sends back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverHeader {
    pub flags: Flags,
    /// Number of packets the receiver is willing to buffer.
    ///
    /// On a FIN-ACK this field instead carries the CRC-32 of all delivered bytes.
    pub receive_window: u32,
    /// Next sequence number the receiver expects (cumulative ACK).
    pub ack_seq: u32,
}

impl ReceiverHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RECEIVER_HEADER_LEN);
        buf.extend_from_slice(&self.flags.to_word().to_be_bytes());
        buf.extend_from_slice(&self.receive_window.to_be_bytes());
        buf.extend_from_slice(&self.ack_seq.to_be_bytes());
        buf
    }

    /// Parse a receiver datagram.
    ///
    /// Trailing bytes beyond the fixed header are tolerated and ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < RECEIVER_HEADER_LEN {
            return Err(PacketError::BufferTooShort {
                needed: RECEIVER_HEADER_LEN,
                got: buf.len(),
            });
        }
        Ok(ReceiverHeader {
            flags: Flags::from_word(read_u32(buf, 0))?,
            receive_window: read_u32(buf, 4),
            ack_seq: read_u32(buf, 8),
        })
    }
}

/// Properties of the link the receiver should emulate; sent once in the SYN.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkProperties {
    /// Round-trip time in seconds.
    pub rtt: f32,
    /// Bottleneck bandwidth in bits per second.
    pub speed: f32,
    /// Loss probability, indexed by [`FORWARD`] and [`RETURN`].
    pub loss: [f32; 2],
    /// Router buffer size in packets.
    pub buffer_size: u32,
}

/// Index of the forward-path loss probability in [`LinkProperties::loss`].
pub const FORWARD: usize = 0;
/// Index of the return-path loss probability in [`LinkProperties::loss`].
pub const RETURN: usize = 1;

impl LinkProperties {
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.rtt.to_be_bytes());
        buf.extend_from_slice(&self.speed.to_be_bytes());
        buf.extend_from_slice(&self.loss[FORWARD].to_be_bytes());
        buf.extend_from_slice(&self.loss[RETURN].to_be_bytes());
        buf.extend_from_slice(&self.buffer_size.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < LINK_PROPERTIES_LEN {
            return Err(PacketError::BufferTooShort {
                needed: LINK_PROPERTIES_LEN,
                got: buf.len(),
            });
        }
        Ok(LinkProperties {
            rtt: f32::from_bits(read_u32(buf, 0)),
            speed: f32::from_bits(read_u32(buf, 4)),
            loss: [
                f32::from_bits(read_u32(buf, 8)),
                f32::from_bits(read_u32(buf, 12)),
            ],
            buffer_size: read_u32(buf, 16),
        })
    }
}

/// Errors that can arise when parsing a raw datagram.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("buffer too short: needed {needed} bytes, got {got}")]
    BufferTooShort { needed: usize, got: usize },
    #[error("bad magic 0x{0:06x}")]
    BadMagic(u32),
    #[error("reserved flag bits must be zero")]
    ReservedBitsSet,
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_be_bytes(word)
}
