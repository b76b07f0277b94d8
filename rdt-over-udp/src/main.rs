//! Entry point for `rdt-over-udp`.
//!
//! Parses CLI arguments and dispatches into either **send** or **serve** mode.
//! All protocol work is delegated to the library; `main.rs` owns only process
//! setup (logging, argument parsing) and the summary printout.

use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};

use rdt_over_udp::checksum::crc32;
use rdt_over_udp::connection::MAX_WINDOW;
use rdt_over_udp::packet::{MAX_PACKET, MAX_PAYLOAD};
use rdt_over_udp::simulator::{Simulator, SimulatorConfig, SimulatorError};
use rdt_over_udp::SenderSocket;

/// Reliable, flow-controlled packet sender over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Transfer a generated buffer to a receiver and report the rate.
    Send(SendArgs),
    /// Run the link-emulating receiver.
    Serve {
        /// Local address to bind.
        #[arg(short, long, default_value = "0.0.0.0:22345")]
        bind: String,
        /// Receive window advertised to senders, in packets.
        #[arg(long, default_value_t = 1 << 20)]
        receive_window: u32,
        /// Answer immediately instead of after the sender's RTT.
        #[arg(long)]
        no_delay: bool,
        /// Seed for the loss RNG.
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[derive(Args)]
struct SendArgs {
    /// Receiver host name or IPv4 address.
    server: String,
    /// Buffer holds 2^power 32-bit counters.
    #[arg(value_parser = clap::value_parser!(u32).range(1..=36))]
    power: u32,
    /// Send window in packets.
    #[arg(value_parser = clap::value_parser!(u32).range(1..=MAX_WINDOW as i64))]
    window: u32,
    /// Round-trip time of the emulated link, in seconds.
    #[arg(value_parser = parse_rtt)]
    rtt: f32,
    /// Forward-path loss probability.
    #[arg(value_parser = parse_loss)]
    forward_loss: f32,
    /// Return-path loss probability.
    #[arg(value_parser = parse_loss)]
    return_loss: f32,
    /// Bottleneck speed in Mbps.
    #[arg(value_parser = parse_speed)]
    speed: f32,
    /// Receiver port.
    #[arg(short, long, default_value_t = 22345)]
    port: u16,
}

fn parse_bounded(s: &str, ok: impl Fn(f32) -> bool, range: &str) -> Result<f32, String> {
    let value: f32 = s.parse().map_err(|e| format!("{e}"))?;
    if ok(value) {
        Ok(value)
    } else {
        Err(format!("must be in {range}"))
    }
}

fn parse_rtt(s: &str) -> Result<f32, String> {
    parse_bounded(s, |v| v > 0.0 && v < 30.0, "(0, 30)")
}

fn parse_loss(s: &str) -> Result<f32, String> {
    parse_bounded(s, |v| (0.0..1.0).contains(&v), "[0, 1)")
}

fn parse_speed(s: &str) -> Result<f32, String> {
    parse_bounded(s, |v| v > 0.0 && v <= 100_000.0, "(0, 100000]")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG overrides the default `info` level.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Send(args) => send(args).await,
        Mode::Serve { bind, receive_window, no_delay, seed } => {
            let config = SimulatorConfig {
                receive_window,
                delay_replies: !no_delay,
                seed,
                ..SimulatorConfig::default()
            };
            serve(&bind, config).await
        }
    }
}

async fn send(args: SendArgs) -> anyhow::Result<()> {
    let counters = 1u64 << args.power;
    let started = Instant::now();
    let data: Vec<u8> = (0..counters).flat_map(|i| (i as u32).to_le_bytes()).collect();
    let local_checksum = crc32(&data);
    println!(
        "Main:\tsender W = {}, RTT {:.3} sec, loss {} / {}, link {} Mbps",
        args.window, args.rtt, args.forward_loss, args.return_loss, args.speed
    );
    println!(
        "Main:\tinitializing DWORD array with 2^{} elements... done in {} ms",
        args.power,
        started.elapsed().as_millis()
    );

    let mut sock = SenderSocket::new();
    sock.open(
        &args.server,
        args.port,
        args.window as usize,
        args.rtt,
        args.speed * 1e6,
        [args.forward_loss, args.return_loss],
    )
    .await
    .with_context(|| format!("connect to {}:{}", args.server, args.port))?;
    println!(
        "Main:\tconnected to {} in {:.3} sec, pkt size {} bytes",
        args.server,
        sock.connect_time().unwrap_or_default().as_secs_f64(),
        MAX_PACKET
    );

    for chunk in data.chunks(MAX_PAYLOAD) {
        sock.send(chunk).await.context("send")?;
    }
    sock.close().await.context("close")?;

    let elapsed = sock.data_ack_time().unwrap_or_default().as_secs_f64();
    let rate_kbps = if elapsed > 0.0 {
        data.len() as f64 * 8.0 / elapsed / 1e3
    } else {
        0.0
    };
    println!(
        "Main:\ttransfer finished in {elapsed:.3} sec, {rate_kbps:.2} Kbps, checksum {local_checksum:08X}"
    );

    if let Some(rtt) = sock.estimated_rtt().filter(|d| !d.is_zero()) {
        let ideal_kbps = args.window as f64 * MAX_PACKET as f64 * 8.0 / rtt.as_secs_f64() / 1e3;
        println!(
            "Main:\testRTT {:.3}, ideal rate {ideal_kbps:.2} Kbps",
            rtt.as_secs_f64()
        );
    }

    match sock.peer_checksum() {
        Some(peer) if peer == local_checksum => Ok(()),
        Some(peer) => bail!("checksum mismatch: local {local_checksum:08X}, peer {peer:08X}"),
        None => bail!("receiver did not report a checksum"),
    }
}

async fn serve(bind: &str, config: SimulatorConfig) -> anyhow::Result<()> {
    let mut sim = Simulator::bind(bind, config)
        .await
        .with_context(|| format!("bind {bind}"))?;
    log::info!("Starting receiver on {}", sim.local_addr()?);

    loop {
        match sim.serve().await {
            Ok(report) => println!(
                "Serve:\t{} delivered {} packets ({} bytes), dropped {} fwd / {} ret, checksum {:08X}",
                report.peer,
                report.packets_delivered,
                report.bytes_delivered,
                report.forward_dropped,
                report.return_dropped,
                report.checksum
            ),
            Err(SimulatorError::Idle(after)) => {
                log::warn!("sender went silent for {after:?}; waiting for the next SYN");
            }
            Err(e) => return Err(e.into()),
        }
    }
}
