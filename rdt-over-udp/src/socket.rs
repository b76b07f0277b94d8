//! Async UDP socket bound to a single receiver peer.
//!
//! [`Socket`] is a thin wrapper around `tokio::net::UdpSocket` that sends raw
//! sender datagrams and decodes everything it receives as a
//! [`ReceiverHeader`].  All protocol logic lives elsewhere; this module owns
//! only byte I/O and peer filtering.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::Instant;

use crate::packet::{PacketError, ReceiverHeader};

/// Receive buffer size; receiver datagrams are tiny but strays may not be.
const MAX_DATAGRAM: usize = 2048;

/// Errors that can arise from a single receive.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Underlying I/O error from the OS.
    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),
    /// The datagram could not be decoded as a receiver header.
    #[error("packet decode error: {0}")]
    Packet(#[from] PacketError),
    /// The datagram came from somebody other than our peer.
    #[error("datagram from unexpected address {0}")]
    Foreign(SocketAddr),
}

/// A UDP socket talking to exactly one receiver.
///
/// All methods take `&self` so the socket can be shared across tasks.
#[derive(Debug)]
pub struct Socket {
    /// Address this socket is bound to (after the OS assigns a port).
    pub local_addr: SocketAddr,
    peer: SocketAddr,
    inner: UdpSocket,
}

impl Socket {
    /// Bind an ephemeral IPv4 port for talking to `peer`.
    pub async fn bind(peer: SocketAddr) -> io::Result<Self> {
        let inner = UdpSocket::bind("0.0.0.0:0").await?;
        let local_addr = inner.local_addr()?;
        Ok(Self { local_addr, peer, inner })
    }

    /// Send one already-encoded datagram to the peer.
    pub async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        self.inner.send_to(datagram, self.peer).await?;
        Ok(())
    }

    /// Receive the next datagram and decode it as a [`ReceiverHeader`].
    ///
    /// Cancel-safe.  Datagrams from other addresses or that fail to decode
    /// come back as ignorable `Err`s; the caller decides whether to retry.
    pub async fn recv_header(&self) -> Result<ReceiverHeader, SocketError> {
        let mut buf = [0u8; MAX_DATAGRAM];
        let (n, addr) = self.inner.recv_from(&mut buf).await?;
        if addr != self.peer {
            return Err(SocketError::Foreign(addr));
        }
        Ok(ReceiverHeader::decode(&buf[..n])?)
    }

    /// Wait until `deadline` for a header satisfying `accept`.
    ///
    /// Returns `Ok(None)` on timeout.  Non-matching and undecodable datagrams
    /// are skipped; only a real I/O failure is an error.
    pub async fn recv_matching(
        &self,
        deadline: Instant,
        accept: impl Fn(&ReceiverHeader) -> bool,
    ) -> io::Result<Option<ReceiverHeader>> {
        loop {
            match tokio::time::timeout_at(deadline, self.recv_header()).await {
                Err(_elapsed) => return Ok(None),
                Ok(Ok(header)) if accept(&header) => return Ok(Some(header)),
                Ok(Ok(header)) => log::debug!("[socket] skipping unexpected {header:?}"),
                Ok(Err(SocketError::Io(e))) => return Err(e),
                Ok(Err(e)) => log::debug!("[socket] ignoring datagram: {e}"),
            }
        }
    }
}
