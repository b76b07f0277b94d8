//! Connection finite-state machine (FSM) types.
//!
//! ```text
//!  Disconnected ──open()──▶ Connecting ──SYN-ACK──▶ Connected
//!        ▲                      │                      │
//!        └──── SYN timeout ─────┘              close() │
//!                                                      ▼
//!                         Closed ◀──FIN-ACK / abort── Closing
//! ```
//!
//! A transport abort (socket failure, retransmit ceiling) moves a
//! `Connected` or `Closing` connection straight to `Closed`.  Transitions
//! live in [`crate::connection`]; this module only names the states.

/// All possible states of a sender connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Fresh socket, `open` not yet called (or the handshake failed).
    #[default]
    Disconnected,
    /// SYN sent; waiting for SYN-ACK.
    Connecting,
    /// Handshake complete; `send` accepted.
    Connected,
    /// `close` in progress: draining the queue, then the FIN exchange.
    Closing,
    /// Terminal.  The connection must not be reused.
    Closed,
}

impl ConnectionState {
    /// `true` when the caller may still queue data.
    pub fn accepts_data(self) -> bool {
        self == Self::Connected
    }
}
