//! Scripted receiver used by the integration tests.
//!
//! A [`FakePeer`] is a bare loopback `UdpSocket` that speaks the receiver side
//! of the wire format by hand, so each test can decide exactly which ACKs go
//! back and when.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use rdt_over_udp::packet::{Flags, ReceiverHeader, SenderHeader};
use rdt_over_udp::{SenderConfig, SenderSocket};
use tokio::net::UdpSocket;

/// Upper bound on every wait in the tests.
pub const WAIT: Duration = Duration::from_secs(5);

pub struct FakePeer {
    pub socket: UdpSocket,
    /// The sender's address, learned from its SYN.
    pub client: SocketAddr,
}

impl FakePeer {
    /// Next datagram from the sender, decoded.  Panics after [`WAIT`].
    pub async fn recv(&self) -> (SenderHeader, Vec<u8>) {
        self.try_recv(WAIT).await.expect("sender went silent")
    }

    /// Next datagram from the sender within `within`, if any.
    pub async fn try_recv(&self, within: Duration) -> Option<(SenderHeader, Vec<u8>)> {
        let mut buf = [0u8; 2048];
        loop {
            let (n, from) = tokio::time::timeout(within, self.socket.recv_from(&mut buf))
                .await
                .ok()?
                .expect("peer recv");
            if from == self.client {
                let (header, payload) = SenderHeader::decode(&buf[..n]).expect("decode");
                return Some((header, payload.to_vec()));
            }
        }
    }

    pub async fn reply(&self, flags: Flags, receive_window: u32, ack_seq: u32) {
        let header = ReceiverHeader { flags, receive_window, ack_seq };
        self.socket
            .send_to(&header.encode(), self.client)
            .await
            .expect("peer send");
    }

    pub async fn ack(&self, ack_seq: u32, receive_window: u32) {
        self.reply(Flags::ACK, receive_window, ack_seq).await;
    }

    /// Wait for the FIN and answer it with `checksum`.
    pub async fn finish(&self, checksum: u32) -> SenderHeader {
        loop {
            let (header, _) = self.recv().await;
            if header.flags.fin {
                self.reply(Flags::FIN_ACK, checksum, header.seq.wrapping_add(1)).await;
                return header;
            }
        }
    }
}

pub async fn bind_peer() -> (UdpSocket, u16) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind peer");
    let port = socket.local_addr().unwrap().port();
    (socket, port)
}

/// Receive one SYN on `socket` and answer it with a SYN-ACK.
pub async fn accept(socket: UdpSocket, receive_window: u32) -> (FakePeer, SenderHeader, Vec<u8>) {
    let mut buf = [0u8; 2048];
    let (n, client) = tokio::time::timeout(WAIT, socket.recv_from(&mut buf))
        .await
        .expect("no SYN")
        .unwrap();
    let (header, payload) = SenderHeader::decode(&buf[..n]).unwrap();
    assert_eq!(header.flags, Flags::SYN);
    let payload = payload.to_vec();
    let peer = FakePeer { socket, client };
    peer.reply(Flags::SYN_ACK, receive_window, header.seq.wrapping_add(1)).await;
    (peer, header, payload)
}

/// Open `sock` against a fresh [`FakePeer`].
pub async fn connect(
    config: SenderConfig,
    window: usize,
    receive_window: u32,
) -> (SenderSocket, FakePeer) {
    let (socket, port) = bind_peer().await;
    let server = tokio::spawn(accept(socket, receive_window));

    let mut sock = SenderSocket::with_config(config);
    tokio::time::timeout(WAIT, sock.open("127.0.0.1", port, window, 0.01, 1e6, [0.0, 0.0]))
        .await
        .expect("open timed out")
        .expect("open failed");
    let (peer, _, _) = server.await.unwrap();
    (sock, peer)
}

/// Config whose RTO never drops below `min_rto`.
pub fn config_with_min_rto(min_rto: Duration) -> SenderConfig {
    let mut config = SenderConfig::default();
    config.timer.min_rto = min_rto;
    config.timer.max_rto = config.timer.max_rto.max(min_rto);
    config
}

/// Poll `cond` until it holds, panicking after [`WAIT`].
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}
