//! Error type surfaced by [`crate::connection::SenderSocket`].

use std::io;

use thiserror::Error;

/// Everything that can go wrong while opening, feeding or closing a sender.
#[derive(Debug, Error)]
pub enum SenderError {
    #[error("socket already connected")]
    AlreadyConnected,

    #[error("cannot perform I/O on a disconnected socket")]
    NotConnected,

    #[error("destination host {host:?} is invalid: {reason}")]
    InvalidHost { host: String, reason: String },

    #[error("send() failed: {0}")]
    SendFailed(#[source] io::Error),

    #[error("recvfrom() failed: {0}")]
    RecvFailed(#[source] io::Error),

    #[error("timeout after {attempts} {phase} attempts")]
    Timeout { phase: &'static str, attempts: u32 },

    #[error("packet {seq} exceeded {attempts} transmission attempts")]
    RetransmitLimitExceeded { seq: u32, attempts: u32 },

    #[error("payload of {len} bytes exceeds the {max}-byte limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("window must be between 1 and {max} packets, got {window}")]
    InvalidWindow { window: usize, max: usize },

    #[error("{context} failed: {source}")]
    SystemError {
        context: &'static str,
        #[source]
        source: io::Error,
    },
}

impl SenderError {
    /// Raw OS error code behind an I/O failure, when there is one.
    pub fn os_error_code(&self) -> Option<i32> {
        match self {
            Self::SendFailed(e) | Self::RecvFailed(e) => e.raw_os_error(),
            Self::SystemError { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SenderError>;
