//! Stream receiver
//!
//! Receives a stream over UDP or ICMP and drains the ring buffer at the
//! audio period the way a playback callback would, logging statistics.
//!
//! Usage: `receiver [udp|icmp] [loss-rate]`

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tripstream::{
    audio::RingBuffer,
    config::StreamConfig,
    constants::RING_BUFFER_SLOTS,
    network::{
        EventSink, IcmpTransport, IssueSimulation, PacketTransport, SocketBinder, Transport,
        TransportEvent, UdpTransport,
    },
    protocol::RunMode,
};

const STATS_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let kind = args.next().unwrap_or_else(|| "udp".to_string());
    let loss_rate: Option<f64> = args
        .next()
        .map(|s| s.parse().context("loss rate must be a number between 0 and 1"))
        .transpose()?;

    let config = match StreamConfig::default_path() {
        Some(path) => StreamConfig::load_or_default(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => StreamConfig::default(),
    };
    let format = config.audio;
    let port = config.network.bind_port;
    tracing::info!(?format, port, %kind, "Starting receiver");

    let bridge = Arc::new(RingBuffer::new(format.receive_payload_size(), RING_BUFFER_SLOTS));
    let binder = Arc::new(SocketBinder::new());
    let (events, event_rx) = EventSink::channel("receiver");

    let mut transport: Transport = match kind.as_str() {
        "udp" => UdpTransport::new(RunMode::Receiver, config, binder, bridge.clone(), events)?.into(),
        "icmp" => IcmpTransport::new(RunMode::Receiver, config, binder, bridge.clone(), events)?.into(),
        other => bail!("unknown transport '{}', expected udp or icmp", other),
    };
    if let Some(rate) = loss_rate {
        transport.set_issue_simulation(IssueSimulation::new(rate, 0.0, Duration::ZERO));
        tracing::warn!(rate, "Simulating packet loss");
    }
    transport.start()?;

    let mut slot = vec![0u8; format.receive_payload_size()];
    let mut playback = tokio::time::interval(format.period());
    let mut report = tokio::time::interval(STATS_INTERVAL);

    tracing::info!("Waiting for audio - press Ctrl+C to stop");
    loop {
        tokio::select! {
            _ = playback.tick() => {
                bridge.read_slot_non_blocking(&mut slot);

                while let Ok(event) = event_rx.try_recv() {
                    match event {
                        TransportEvent::CeaseTransmission(reason) => {
                            tracing::info!(%reason, "Sender stopped transmitting");
                        }
                        TransportEvent::Error { kind, message } => {
                            tracing::error!(?kind, %message, "Transport failed");
                        }
                        other => tracing::info!(event = ?other, "Transport event"),
                    }
                }
                if !transport.is_running() {
                    bail!("{} transport stopped unexpectedly", transport.kind());
                }
            }
            _ = report.tick() => {
                if let Some(stats) = transport.stats() {
                    tracing::info!(
                        "Receiver stats: {} packets, {} lost ({:.1}% loss), {} revived, {} out of order, buffer {:.0}% full, {} underruns",
                        stats.tot,
                        stats.lost,
                        stats.loss_rate() * 100.0,
                        stats.revived,
                        stats.out_of_order,
                        bridge.fill_level() * 100.0,
                        bridge.underrun_count()
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    transport.stop();
    tracing::info!("Receiver stopped");
    Ok(())
}
