//! `rdt-over-udp`: a reliable, flow-controlled packet sender over UDP.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────┐  send()   ┌───────────┐  full_slots   ┌──────────┐
//!  │ SenderSocket │──────────▶│ SendQueue │──────────────▶│  Worker  │
//!  │ open / close │◀──────────│ (ring)    │◀──────────────│  (loop)  │
//!  └──────┬───────┘ NotConn.  └───────────┘  empty_slots  └────┬─────┘
//!         │ SYN / FIN                                          │ DATA ↓  ↑ ACK
//!  ┌──────▼───────────────────────────────────────────────────▼─────┐
//!  │                    Socket (tokio UdpSocket)                    │
//!  └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]       wire format (serialise / deserialise)
//! - [`connection`]   handshake, send, drain and FIN; the public handle
//! - [`worker`]       transmit/receive loop with fast and timeout retransmit
//! - [`send_queue`]   fixed ring of slots plus the two flow-control permits
//! - [`timer`]        RTT estimation and RTO computation
//! - [`stats`]        atomic counters and the periodic status reporter
//! - [`state`]        connection lifecycle states
//! - [`socket`]       async UDP socket bound to one peer
//! - [`config`]       tunables
//! - [`error`]        error type
//! - [`checksum`]     CRC-32 used for end-to-end verification
//! - [`simulator`]    link-emulating receiver peer for tests and the CLI

pub mod checksum;
pub mod config;
pub mod connection;
pub mod error;
pub mod packet;
pub mod send_queue;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod stats;
pub mod timer;
mod worker;

pub use config::SenderConfig;
pub use connection::SenderSocket;
pub use error::{Result, SenderError};
pub use state::ConnectionState;
pub use timer::TimerConfig;
