//! Receiver peer that emulates the link described in the sender's SYN.
//!
//! [`Simulator`] binds a UDP socket, accepts one connection and plays the
//! receiving end of the protocol:
//!
//! | Event            | Reaction                                               |
//! |------------------|--------------------------------------------------------|
//! | SYN              | SYN-ACK advertising `receive_window` (repeated SYNs too) |
//! | DATA, in order   | deliver, fold into the checksum, ACK `seq + 1`         |
//! | DATA, otherwise  | discard, re-ACK the next expected sequence (Go-Back-N) |
//! | FIN              | FIN-ACK carrying the CRC-32 of delivered data          |
//!
//! Data packets and their ACKs are dropped with the forward and return loss
//! probabilities from the SYN's [`LinkProperties`]; control packets are never
//! dropped.  Replies can be held back by the advertised RTT.  After the first
//! FIN the peer lingers, answering duplicate FINs, until `linger` passes in
//! silence, then returns a [`TransferReport`].

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::time::timeout;

use crate::checksum::Checksum;
use crate::packet::{
    Flags, LinkProperties, ReceiverHeader, SenderHeader, FORWARD, MAX_PACKET, RETURN,
};

/// Configuration for the emulated receiver.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Window advertised in every SYN-ACK and ACK, in packets.
    pub receive_window: u32,
    /// Hold each reply back by the RTT announced in the SYN.
    pub delay_replies: bool,
    /// RNG seed for reproducible loss; `None` seeds from the OS.
    pub seed: Option<u64>,
    /// Quiet period after a FIN before the session ends.
    pub linger: Duration,
    /// Give up if the sender goes silent for this long before its FIN.
    pub idle_timeout: Duration,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            receive_window: 1 << 20,
            delay_replies: true,
            seed: None,
            linger: Duration::from_millis(500),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error)]
pub enum SimulatorError {
    #[error("simulator socket error: {0}")]
    Io(#[from] io::Error),
    #[error("no packet from the sender for {0:?}")]
    Idle(Duration),
}

/// What one served connection looked like from the receiving end.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferReport {
    pub peer: SocketAddr,
    pub link: LinkProperties,
    /// Data packets that reached the simulator, before forward loss.
    pub packets_received: u64,
    pub packets_delivered: u64,
    pub bytes_delivered: u64,
    pub forward_dropped: u64,
    pub return_dropped: u64,
    /// CRC-32 of the delivered byte stream.
    pub checksum: u32,
}

/// One-connection receiver with link emulation.
pub struct Simulator {
    socket: Arc<UdpSocket>,
    config: SimulatorConfig,
    rng: StdRng,
}

impl Simulator {
    pub async fn bind(addr: impl ToSocketAddrs, config: SimulatorConfig) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Ok(Self { socket, config, rng })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve a single connection from SYN to the end of the FIN linger.
    ///
    /// Waits indefinitely for the SYN; may be called again for the next
    /// connection.
    pub async fn serve(&mut self) -> Result<TransferReport, SimulatorError> {
        let mut buf = vec![0u8; MAX_PACKET + 64];
        let (peer, syn_seq, link) = self.await_syn(&mut buf).await?;
        log::info!("[sim] ← SYN from {peer} {link:?}");

        let delay = if self.config.delay_replies {
            Duration::try_from_secs_f32(link.rtt).unwrap_or_default()
        } else {
            Duration::ZERO
        };
        let syn_ack = ReceiverHeader {
            flags: Flags::SYN_ACK,
            receive_window: self.config.receive_window,
            ack_seq: syn_seq.wrapping_add(1),
        };
        self.reply(peer, syn_ack, delay).await?;

        let mut report = TransferReport {
            peer,
            link,
            packets_received: 0,
            packets_delivered: 0,
            bytes_delivered: 0,
            forward_dropped: 0,
            return_dropped: 0,
            checksum: 0,
        };
        let mut digest = Checksum::new();
        let mut expected = syn_seq.wrapping_add(1);
        let mut fin_checksum: Option<u32> = None;

        loop {
            let wait = if fin_checksum.is_some() {
                self.config.linger
            } else {
                self.config.idle_timeout
            };
            let (n, addr) = match timeout(wait, self.socket.recv_from(&mut buf)).await {
                Ok(received) => received?,
                Err(_) if fin_checksum.is_some() => break,
                Err(_) => return Err(SimulatorError::Idle(wait)),
            };
            if addr != peer {
                log::debug!("[sim] ignoring datagram from {addr}");
                continue;
            }
            let (header, payload) = match SenderHeader::decode(&buf[..n]) {
                Ok(decoded) => decoded,
                Err(e) => {
                    log::debug!("[sim] ignoring malformed datagram: {e}");
                    continue;
                }
            };

            if header.flags.syn {
                self.reply(peer, syn_ack, delay).await?;
                continue;
            }

            if header.flags.fin {
                let checksum =
                    *fin_checksum.get_or_insert_with(|| std::mem::take(&mut digest).finalize());
                log::info!(
                    "[sim] ← FIN seq={} delivered={} checksum={checksum:#010x}",
                    header.seq,
                    report.packets_delivered
                );
                let fin_ack = ReceiverHeader {
                    flags: Flags::FIN_ACK,
                    receive_window: checksum,
                    ack_seq: header.seq.wrapping_add(1),
                };
                self.reply(peer, fin_ack, delay).await?;
                continue;
            }

            if fin_checksum.is_some() {
                continue;
            }

            report.packets_received += 1;
            if self.roll(link.loss[FORWARD]) {
                report.forward_dropped += 1;
                log::trace!("[sim] dropped DATA seq={}", header.seq);
                continue;
            }

            if header.seq == expected {
                digest.update(payload);
                report.packets_delivered += 1;
                report.bytes_delivered += payload.len() as u64;
                expected = expected.wrapping_add(1);
            } else {
                log::trace!("[sim] out of order seq={} expected={expected}", header.seq);
            }

            if self.roll(link.loss[RETURN]) {
                report.return_dropped += 1;
                continue;
            }
            let ack = ReceiverHeader {
                flags: Flags::ACK,
                receive_window: self.config.receive_window,
                ack_seq: expected,
            };
            self.reply(peer, ack, delay).await?;
        }

        report.checksum = fin_checksum.unwrap_or_default();
        log::info!(
            "[sim] session done: {} delivered, {} fwd / {} ret dropped",
            report.packets_delivered,
            report.forward_dropped,
            report.return_dropped
        );
        Ok(report)
    }

    async fn await_syn(
        &self,
        buf: &mut [u8],
    ) -> io::Result<(SocketAddr, u32, LinkProperties)> {
        loop {
            let (n, addr) = self.socket.recv_from(buf).await?;
            let syn = SenderHeader::decode(&buf[..n])
                .ok()
                .filter(|(header, _)| header.flags.syn)
                .and_then(|(header, payload)| {
                    LinkProperties::decode(payload).ok().map(|link| (header.seq, link))
                });
            match syn {
                Some((seq, link)) => return Ok((addr, seq, link)),
                None => log::debug!("[sim] waiting for SYN, ignoring datagram from {addr}"),
            }
        }
    }

    async fn reply(
        &self,
        peer: SocketAddr,
        header: ReceiverHeader,
        delay: Duration,
    ) -> io::Result<()> {
        let datagram = header.encode();
        if delay.is_zero() {
            self.socket.send_to(&datagram, peer).await?;
            return Ok(());
        }
        let socket = Arc::clone(&self.socket);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = socket.send_to(&datagram, peer).await {
                log::debug!("[sim] delayed reply failed: {e}");
            }
        });
        Ok(())
    }

    fn roll(&mut self, probability: f32) -> bool {
        probability > 0.0 && self.rng.random::<f32>() < probability
    }
}
