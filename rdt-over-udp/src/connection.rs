//! The public sender handle: handshake, queued sends, drain and FIN.
//!
//! ```text
//!  caller                      SenderSocket                 spawned tasks
//!  ──────                      ────────────                 ─────────────
//!  open()  ── SYN / SYN-ACK ──▶ grant window ──── spawn ──▶ Worker (loop)
//!                                            └── spawn ──▶ stats reporter
//!  send()  ── push slot ─────▶ SendQueue ◀──── ACKs ─────── Worker
//!  close() ── wait drained ──▶ shutdown(watch) ──────────▶ both exit
//!          ── FIN / FIN-ACK (synchronously, on the same socket)
//! ```
//!
//! Only one caller drives a [`SenderSocket`]; the worker and the reporter
//! share its state through [`Shared`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::SenderConfig;
use crate::error::{Result, SenderError};
use crate::packet::{Flags, LinkProperties, ReceiverHeader, MAX_PAYLOAD};
use crate::send_queue::{QueueSlot, SendQueue, SlotKind};
use crate::socket::Socket;
use crate::state::ConnectionState;
use crate::stats::{run_reporter, Stats, StatsSnapshot};
use crate::timer::RttEstimator;
use crate::worker::{effective_window, Worker};

/// Largest send window `open` accepts, in packets.
pub const MAX_WINDOW: usize = 1 << 16;

/// Sequence number carried by the SYN.
const SYN_SEQ: u32 = 0;
/// Sequence number of the first data packet.
pub const FIRST_DATA_SEQ: u32 = SYN_SEQ + 1;

// ---------------------------------------------------------------------------
// State shared with the background tasks
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) queue: SendQueue,
    pub(crate) stats: Stats,
    aborted: AtomicBool,
}

impl Shared {
    fn new(window: usize) -> Self {
        Self {
            queue: SendQueue::new(window, FIRST_DATA_SEQ, MAX_PAYLOAD),
            stats: Stats::default(),
            aborted: AtomicBool::new(false),
        }
    }

    /// Fail the connection: wake every blocked producer and stop accepting data.
    pub(crate) fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        self.queue.close();
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
}

/// Handles that exist only between a successful `open` and `close`.
struct Running {
    socket: Arc<Socket>,
    shutdown: watch::Sender<bool>,
    worker: JoinHandle<Result<()>>,
    reporter: JoinHandle<()>,
}

// ---------------------------------------------------------------------------
// SenderSocket
// ---------------------------------------------------------------------------

/// Reliable, flow-controlled sender talking to one receiver over UDP.
///
/// ```ignore
/// let mut sock = SenderSocket::new();
/// sock.open("127.0.0.1", 22345, 64, 0.1, 1e9, [0.0, 0.0]).await?;
/// for chunk in data.chunks(MAX_PAYLOAD) {
///     sock.send(chunk).await?;
/// }
/// sock.close().await?;
/// ```
pub struct SenderSocket {
    config: SenderConfig,
    state: ConnectionState,
    shared: Option<Arc<Shared>>,
    running: Option<Running>,
    opened_at: Option<Instant>,
    connect_time: Option<Duration>,
    data_ack_time: Option<Duration>,
    peer_checksum: Option<u32>,
}

impl Default for SenderSocket {
    fn default() -> Self {
        Self::with_config(SenderConfig::default())
    }
}

impl SenderSocket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: SenderConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            shared: None,
            running: None,
            opened_at: None,
            connect_time: None,
            data_ack_time: None,
            peer_checksum: None,
        }
    }

    // -----------------------------------------------------------------------
    // open
    // -----------------------------------------------------------------------

    /// Connect to `host:port` with a send window of `window` packets.
    ///
    /// `rtt` (seconds), `speed` (bits/s) and `loss` (forward, return) are
    /// forwarded to the receiver in the SYN.  `rtt` also seeds the handshake
    /// timeout.
    pub async fn open(
        &mut self,
        host: &str,
        port: u16,
        window: usize,
        rtt: f32,
        speed: f32,
        loss: [f32; 2],
    ) -> Result<()> {
        if self.state != ConnectionState::Disconnected {
            return Err(SenderError::AlreadyConnected);
        }
        if window == 0 || window > MAX_WINDOW {
            return Err(SenderError::InvalidWindow { window, max: MAX_WINDOW });
        }

        let started = Instant::now();
        let peer = resolve_ipv4(host, port).await?;
        let socket = Socket::bind(peer)
            .await
            .map_err(|source| SenderError::SystemError { context: "bind", source })?;
        log::debug!("[sender] bound {} → {peer}", socket.local_addr);

        self.state = ConnectionState::Connecting;

        let hint = Duration::try_from_secs_f32(rtt).unwrap_or_default();
        let mut estimator = RttEstimator::new(self.config.timer.clone(), hint);
        let link = LinkProperties {
            rtt,
            speed,
            loss,
            buffer_size: (window as u32).saturating_add(self.config.max_attempts),
        };

        let (syn_ack, sample) = match self.handshake(&socket, &link, &estimator).await {
            Ok(v) => v,
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                return Err(e);
            }
        };

        estimator.on_handshake_sample(sample);
        let shared = Arc::new(Shared::new(window));
        shared.stats.set_timing(estimator.estimated_rtt(), estimator.rto());

        let granted = effective_window(window, syn_ack.receive_window);
        shared.queue.grant(granted as usize);
        shared.stats.set_effective_window(granted);
        shared.stats.set_next_to_send(FIRST_DATA_SEQ);
        log::info!(
            "[sender] connected to {peer} window={window} granted={granted} rto={:?}",
            estimator.rto()
        );

        let socket = Arc::new(socket);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = Worker::new(
            Arc::clone(&socket),
            Arc::clone(&shared),
            self.config.clone(),
            estimator,
            granted,
            shutdown_rx.clone(),
        );
        let worker = tokio::spawn(worker.run());

        let observed = Arc::clone(&shared);
        let reporter = tokio::spawn(run_reporter(
            move || observed.stats.snapshot(observed.queue.sender_base()),
            self.config.stats_interval,
            shutdown_rx,
        ));

        self.running = Some(Running { socket, shutdown, worker, reporter });
        self.shared = Some(shared);
        self.state = ConnectionState::Connected;
        self.opened_at = Some(Instant::now());
        self.connect_time = Some(started.elapsed());
        Ok(())
    }

    /// Send the SYN until a SYN-ACK arrives; return it with the RTT sample.
    async fn handshake(
        &self,
        socket: &Socket,
        link: &LinkProperties,
        estimator: &RttEstimator,
    ) -> Result<(ReceiverHeader, Duration)> {
        let mut payload = Vec::new();
        link.encode_into(&mut payload);
        let mut syn = QueueSlot::control(SlotKind::Syn, SYN_SEQ, payload);
        let datagram = syn.encode();
        let attempts = self.config.max_syn_attempts;

        for attempt in 1..=attempts {
            let sent_at = Instant::now();
            socket.send(&datagram).await.map_err(SenderError::SendFailed)?;
            syn.record_transmit(sent_at);
            log::debug!(
                "[sender] → SYN attempt {attempt}/{attempts} rto={:?}",
                estimator.rto()
            );

            let deadline = tokio::time::Instant::now() + estimator.rto();
            let reply = socket
                .recv_matching(deadline, |h| h.flags == Flags::SYN_ACK)
                .await
                .map_err(SenderError::RecvFailed)?;
            if let Some(header) = reply {
                let sample = sent_at.elapsed();
                log::debug!(
                    "[sender] ← SYN-ACK window={} rtt={sample:?}",
                    header.receive_window
                );
                return Ok((header, sample));
            }
        }

        log::warn!("[sender] no SYN-ACK after {attempts} attempts");
        Err(SenderError::Timeout { phase: "SYN", attempts })
    }

    // -----------------------------------------------------------------------
    // send
    // -----------------------------------------------------------------------

    /// Queue one packet's worth of data, waiting for window space first.
    ///
    /// Returns once the packet is queued, not once it is acknowledged.
    pub async fn send(&self, buf: &[u8]) -> Result<()> {
        if !self.state().accepts_data() {
            return Err(SenderError::NotConnected);
        }
        if buf.len() > MAX_PAYLOAD {
            return Err(SenderError::PayloadTooLarge {
                len: buf.len(),
                max: MAX_PAYLOAD,
            });
        }
        let shared = self.shared.as_ref().ok_or(SenderError::NotConnected)?;
        shared
            .queue
            .push(buf)
            .await
            .map_err(|_| SenderError::NotConnected)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // close
    // -----------------------------------------------------------------------

    /// Wait for every queued packet to be acknowledged, then exchange FINs.
    ///
    /// A fatal error hit by the background loop is returned here.
    pub async fn close(&mut self) -> Result<()> {
        if self.state != ConnectionState::Connected {
            return Err(SenderError::NotConnected);
        }
        let (Some(running), Some(shared)) = (self.running.take(), self.shared.clone()) else {
            return Err(SenderError::NotConnected);
        };
        self.state = ConnectionState::Closing;

        let mut delay = self.config.close_poll_min;
        while !shared.queue.is_drained() && !shared.is_aborted() {
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(self.config.close_poll_max);
        }
        self.data_ack_time = self.opened_at.map(|t| t.elapsed());

        let _ = running.shutdown.send(true);
        let outcome = join(running.worker, "worker task").await;
        let _ = running.reporter.await;
        if let Err(e) = outcome {
            self.state = ConnectionState::Closed;
            return Err(e);
        }

        let fin = self.finish(&running.socket, &shared).await;
        self.state = ConnectionState::Closed;
        self.peer_checksum = Some(fin?.receive_window);
        Ok(())
    }

    /// FIN / FIN-ACK exchange once the loop has released the socket.
    async fn finish(&self, socket: &Socket, shared: &Shared) -> Result<ReceiverHeader> {
        let seq = shared.queue.current_seq();
        let mut fin = QueueSlot::control(SlotKind::Fin, seq, Vec::new());
        let datagram = fin.encode();
        let rto = shared.stats.rto().max(self.config.timer.min_rto);
        let attempts = self.config.max_fin_attempts;

        for attempt in 1..=attempts {
            socket.send(&datagram).await.map_err(SenderError::SendFailed)?;
            fin.record_transmit(Instant::now());
            log::debug!("[sender] → FIN seq={seq} attempt {attempt}/{attempts}");

            let deadline = tokio::time::Instant::now() + rto;
            let reply = socket
                .recv_matching(deadline, |h| h.flags == Flags::FIN_ACK)
                .await
                .map_err(SenderError::RecvFailed)?;
            if let Some(header) = reply {
                log::debug!("[sender] ← FIN-ACK checksum={:#010x}", header.receive_window);
                return Ok(header);
            }
        }

        log::warn!("[sender] no FIN-ACK after {attempts} attempts");
        Err(SenderError::Timeout { phase: "FIN", attempts })
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Current lifecycle state; a connection whose loop failed reads as `Closed`.
    pub fn state(&self) -> ConnectionState {
        let aborted = self.shared.as_ref().is_some_and(|s| s.is_aborted());
        match self.state {
            ConnectionState::Connected | ConnectionState::Closing if aborted => {
                ConnectionState::Closed
            }
            state => state,
        }
    }

    /// Time `open` took, from resolution to SYN-ACK.
    pub fn connect_time(&self) -> Option<Duration> {
        self.connect_time
    }

    /// Time from the end of `open` until all data was acknowledged.
    pub fn data_ack_time(&self) -> Option<Duration> {
        self.data_ack_time
    }

    pub fn estimated_rtt(&self) -> Option<Duration> {
        self.shared.as_ref().and_then(|s| s.stats.estimated_rtt())
    }

    pub fn stats(&self) -> Option<StatsSnapshot> {
        self.shared
            .as_ref()
            .map(|s| s.stats.snapshot(s.queue.sender_base()))
    }

    /// Checksum the receiver reported in its FIN-ACK.
    pub fn peer_checksum(&self) -> Option<u32> {
        self.peer_checksum
    }

    pub fn sender_base(&self) -> u32 {
        self.shared.as_ref().map_or(0, |s| s.queue.sender_base())
    }

    pub fn current_seq(&self) -> u32 {
        self.shared.as_ref().map_or(0, |s| s.queue.current_seq())
    }

    /// Packets `send` could queue right now without waiting.
    pub fn available_slots(&self) -> usize {
        self.shared.as_ref().map_or(0, |s| s.queue.available_slots())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.socket.local_addr)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn resolve_ipv4(host: &str, port: u16) -> Result<SocketAddr> {
    let invalid = |reason: String| SenderError::InvalidHost {
        host: host.to_owned(),
        reason,
    };
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| invalid(e.to_string()))?;
    addrs
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| invalid("no IPv4 address".to_owned()))
}

async fn join(handle: JoinHandle<Result<()>>, context: &'static str) -> Result<()> {
    handle.await.map_err(|e| SenderError::SystemError {
        context,
        source: std::io::Error::other(e.to_string()),
    })?
}
