//! Integration tests for the data path: windowing, ACK processing, both
//! retransmission paths, aborts and `close`.
//!
//! A scripted receiver decides exactly which ACKs the sender sees.

mod common;

use std::time::Duration;

use common::{config_with_min_rto, connect, eventually, WAIT};
use rdt_over_udp::packet::{Flags, ReceiverHeader};
use rdt_over_udp::{ConnectionState, SenderConfig, SenderError};
use tokio::net::UdpSocket;

// ---------------------------------------------------------------------------
// Windowing
// ---------------------------------------------------------------------------

/// Four packets through a window of four, one cumulative ACK, then FIN.
#[tokio::test]
async fn window_of_four_round_trip() {
    let (mut sock, peer) = connect(config_with_min_rto(Duration::from_secs(1)), 4, 4).await;

    let script = tokio::spawn(async move {
        let mut seen = Vec::new();
        for _ in 0..4 {
            let (header, payload) = peer.recv().await;
            assert_eq!(header.flags, Flags::default());
            seen.push((header.seq, payload));
        }
        peer.ack(5, 4).await;
        let fin = peer.finish(0xDEAD_BEEF).await;
        (seen, fin)
    });

    for payload in [b"p1", b"p2", b"p3", b"p4"] {
        sock.send(payload).await.unwrap();
    }
    assert_eq!(sock.current_seq(), 5);
    tokio::time::timeout(WAIT, sock.close())
        .await
        .expect("close timed out")
        .expect("close failed");

    let (seen, fin) = script.await.unwrap();
    let expected: Vec<(u32, Vec<u8>)> = (1..=4u32)
        .map(|seq| (seq, format!("p{seq}").into_bytes()))
        .collect();
    assert_eq!(seen, expected);
    assert_eq!(fin.seq, 5);

    assert_eq!(sock.state(), ConnectionState::Closed);
    assert_eq!(sock.peer_checksum(), Some(0xDEAD_BEEF));
    assert_eq!(sock.sender_base(), 5);
    let stats = sock.stats().unwrap();
    assert_eq!(stats.bytes_acked, 8);
    assert_eq!(stats.timeouts, 0);
    assert!(sock.data_ack_time().is_some());
}

/// `send` blocks once the window is full and resumes when an ACK frees a slot.
#[tokio::test]
async fn full_window_blocks_until_acked() {
    let (sock, peer) = connect(config_with_min_rto(Duration::from_secs(5)), 4, 4).await;

    for payload in [b"p1", b"p2", b"p3", b"p4"] {
        sock.send(payload).await.unwrap();
    }
    assert_eq!(sock.available_slots(), 0);
    let blocked = tokio::time::timeout(Duration::from_millis(100), sock.send(b"p5")).await;
    assert!(blocked.is_err(), "fifth send must wait for window space");

    for seq in 1..=4 {
        assert_eq!(peer.recv().await.0.seq, seq);
    }
    peer.ack(2, 4).await;

    tokio::time::timeout(WAIT, sock.send(b"p5"))
        .await
        .expect("ACK should free a slot")
        .unwrap();
    let (header, payload) = peer.recv().await;
    assert_eq!(header.seq, 5);
    assert_eq!(payload, b"p5");
    assert_eq!(sock.sender_base(), 2);
    assert!(sock.current_seq() - sock.sender_base() <= 4);
}

/// A smaller advertised window in an ACK caps how far the producer may run.
#[tokio::test]
async fn ack_window_limits_release() {
    let (sock, peer) = connect(config_with_min_rto(Duration::from_secs(5)), 8, 8).await;

    for i in 0..8u8 {
        sock.send(&[i]).await.unwrap();
    }
    for _ in 0..8 {
        peer.recv().await;
    }
    // Base moves to 5 but the receiver only allows 2 outstanding: release up
    // to 7, which was already granted, so nothing new opens.
    peer.ack(5, 2).await;
    eventually(|| sock.sender_base() == 5).await;
    assert_eq!(sock.available_slots(), 0);

    // Full window again: the limit moves from 9 to 9 + 8.
    peer.ack(9, 8).await;
    eventually(|| sock.available_slots() == 8).await;
}

// ---------------------------------------------------------------------------
// Retransmission
// ---------------------------------------------------------------------------

/// Three duplicate ACKs resend the base packet exactly once.
#[tokio::test]
async fn three_duplicate_acks_trigger_one_fast_retransmit() {
    let (sock, peer) = connect(config_with_min_rto(Duration::from_secs(5)), 8, 8).await;

    for i in 1..=5u8 {
        sock.send(&[i]).await.unwrap();
    }
    for seq in 1..=5 {
        assert_eq!(peer.recv().await.0.seq, seq);
    }

    // Packet 2 is "lost": the receiver keeps asking for it.
    peer.ack(2, 8).await;
    for _ in 0..3 {
        peer.ack(2, 8).await;
    }
    let (header, payload) = peer.recv().await;
    assert_eq!(header.seq, 2);
    assert_eq!(payload, [2]);

    for _ in 0..2 {
        peer.ack(2, 8).await;
    }
    assert!(
        peer.try_recv(Duration::from_millis(300)).await.is_none(),
        "further duplicates must not retransmit again"
    );

    let stats = sock.stats().unwrap();
    assert_eq!(stats.fast_retransmits, 1);
    assert_eq!(stats.timeouts, 0);
    assert_eq!(sock.sender_base(), 2);
}

/// Two duplicates are not enough.
#[tokio::test]
async fn two_duplicate_acks_do_not_retransmit() {
    let (sock, peer) = connect(config_with_min_rto(Duration::from_secs(5)), 8, 8).await;

    for i in 1..=3u8 {
        sock.send(&[i]).await.unwrap();
    }
    for _ in 0..3 {
        peer.recv().await;
    }
    peer.ack(2, 8).await;
    peer.ack(2, 8).await;
    peer.ack(2, 8).await;
    assert!(peer.try_recv(Duration::from_millis(300)).await.is_none());
    assert_eq!(sock.stats().unwrap().fast_retransmits, 0);
}

/// An unacknowledged packet is resent when its timer expires.
#[tokio::test]
async fn timeout_retransmits_oldest_packet() {
    let (mut sock, peer) = connect(config_with_min_rto(Duration::from_millis(200)), 4, 4).await;

    sock.send(b"one").await.unwrap();
    sock.send(b"two").await.unwrap();
    assert_eq!(peer.recv().await.0.seq, 1);
    assert_eq!(peer.recv().await.0.seq, 2);

    let (header, payload) = peer.recv().await;
    assert_eq!(header.seq, 1, "the base packet is retransmitted first");
    assert_eq!(payload, b"one");
    assert!(sock.stats().unwrap().timeouts >= 1);

    peer.ack(3, 4).await;
    let script = tokio::spawn(async move { peer.finish(7).await });
    tokio::time::timeout(WAIT, sock.close())
        .await
        .expect("close timed out")
        .expect("close failed");
    assert_eq!(script.await.unwrap().seq, 3);
    assert_eq!(sock.peer_checksum(), Some(7));
}

/// An ACK for a retransmitted packet yields no RTT sample.
#[tokio::test]
async fn ack_after_retransmit_leaves_estimate_alone() {
    let (sock, peer) = connect(config_with_min_rto(Duration::from_millis(200)), 4, 4).await;

    sock.send(b"one").await.unwrap();
    assert_eq!(peer.recv().await.0.seq, 1);
    let (header, _) = peer.recv().await;
    assert_eq!(header.seq, 1);
    eventually(|| sock.stats().unwrap().timeouts >= 1).await;

    let before = sock.stats().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    peer.ack(2, 4).await;
    eventually(|| sock.sender_base() == 2).await;

    let after = sock.stats().unwrap();
    assert_eq!(after.estimated_rtt, before.estimated_rtt);
    assert_eq!(after.rto, before.rto);
    assert_eq!(sock.estimated_rtt(), before.estimated_rtt);
}

/// A packet that reaches the attempt ceiling aborts the connection; a blocked
/// `send` wakes with `NotConnected` and `close` reports the cause.
#[tokio::test]
async fn retransmit_ceiling_aborts_connection() {
    let mut config = config_with_min_rto(Duration::from_millis(10));
    config.timer.max_rto = Duration::from_millis(10);
    config.max_attempts = 5;
    let (mut sock, peer) = connect(config, 1, 1).await;

    sock.send(b"doomed").await.unwrap();
    let blocked = tokio::time::timeout(WAIT, sock.send(b"never"))
        .await
        .expect("abort must wake the blocked send");
    assert!(matches!(blocked, Err(SenderError::NotConnected)), "got {blocked:?}");
    assert_eq!(sock.state(), ConnectionState::Closed);

    let mut copies = 0;
    while let Some((header, _)) = peer.try_recv(Duration::from_millis(200)).await {
        assert_eq!(header.seq, 1);
        copies += 1;
    }
    assert_eq!(copies, 5);

    let err = tokio::time::timeout(WAIT, sock.close())
        .await
        .expect("close timed out")
        .unwrap_err();
    assert!(
        matches!(err, SenderError::RetransmitLimitExceeded { seq: 1, attempts: 5 }),
        "got {err:?}"
    );
    assert!(matches!(sock.close().await, Err(SenderError::NotConnected)));
}

// ---------------------------------------------------------------------------
// Robustness
// ---------------------------------------------------------------------------

/// Foreign, malformed, non-ACK and out-of-range datagrams change nothing.
#[tokio::test]
async fn junk_datagrams_are_ignored() {
    let (sock, peer) = connect(config_with_min_rto(Duration::from_secs(5)), 4, 4).await;
    sock.send(b"x").await.unwrap();
    assert_eq!(peer.recv().await.0.seq, 1);

    let valid_ack = ReceiverHeader { flags: Flags::ACK, receive_window: 4, ack_seq: 2 }.encode();
    let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    stranger.send_to(&valid_ack, peer.client).await.unwrap();

    peer.socket.send_to(&[0x83, 0x11], peer.client).await.unwrap();
    let mut bad_magic = valid_ack.clone();
    bad_magic[0] = 0;
    peer.socket.send_to(&bad_magic, peer.client).await.unwrap();
    peer.reply(Flags::SYN_ACK, 4, 2).await;
    peer.reply(Flags::FIN_ACK, 4, 2).await;
    peer.ack(99, 4).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sock.sender_base(), 1);
    assert_eq!(sock.state(), ConnectionState::Connected);

    peer.ack(2, 4).await;
    eventually(|| sock.sender_base() == 2).await;
}

/// ACKs behind the base neither move it back nor count as duplicates.
#[tokio::test]
async fn stale_acks_do_not_move_base_back() {
    let (sock, peer) = connect(config_with_min_rto(Duration::from_secs(5)), 8, 8).await;

    for i in 1..=4u8 {
        sock.send(&[i]).await.unwrap();
    }
    for seq in 1..=4 {
        assert_eq!(peer.recv().await.0.seq, seq);
    }
    peer.ack(3, 8).await;
    eventually(|| sock.sender_base() == 3).await;

    peer.ack(1, 8).await;
    peer.ack(2, 8).await;
    for _ in 0..3 {
        peer.ack(2, 8).await;
    }
    assert!(
        peer.try_recv(Duration::from_millis(300)).await.is_none(),
        "stale ACKs must not trigger a retransmit"
    );
    assert_eq!(sock.sender_base(), 3);
    assert_eq!(sock.stats().unwrap().fast_retransmits, 0);

    peer.ack(5, 8).await;
    eventually(|| sock.sender_base() == 5).await;
}

#[tokio::test]
async fn close_twice_is_rejected() {
    let (mut sock, peer) = connect(SenderConfig::default(), 2, 2).await;
    let script = tokio::spawn(async move { peer.finish(0).await });

    tokio::time::timeout(WAIT, sock.close())
        .await
        .expect("close timed out")
        .expect("close failed");
    assert_eq!(script.await.unwrap().seq, 1);

    assert!(matches!(sock.close().await, Err(SenderError::NotConnected)));
    assert!(matches!(sock.send(b"late").await, Err(SenderError::NotConnected)));
    assert_eq!(sock.state(), ConnectionState::Closed);
}

/// No FIN-ACK within `max_fin_attempts` is a timeout.
#[tokio::test]
async fn unanswered_fin_times_out() {
    let (mut sock, peer) = connect(SenderConfig::default(), 2, 2).await;

    let err = tokio::time::timeout(WAIT, sock.close())
        .await
        .expect("close should give up on its own")
        .unwrap_err();
    assert!(
        matches!(err, SenderError::Timeout { phase: "FIN", attempts: 5 }),
        "got {err:?}"
    );
    assert_eq!(sock.state(), ConnectionState::Closed);

    let mut fins = 0;
    while let Some((header, _)) = peer.try_recv(Duration::from_millis(200)).await {
        assert!(header.flags.fin);
        fins += 1;
    }
    assert_eq!(fins, 5);
}
