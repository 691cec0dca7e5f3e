//! Test-tone sender
//!
//! Streams a sine tone to a receiver over UDP or ICMP.
//!
//! Usage: `sender <peer-host> [udp|icmp]`

use anyhow::{bail, Context, Result};
use std::f32::consts::TAU;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tripstream::{
    audio::RingBuffer,
    config::StreamConfig,
    constants::RING_BUFFER_SLOTS,
    network::{EventSink, IcmpTransport, PacketTransport, SocketBinder, Transport, UdpTransport},
    protocol::{AudioFormat, RunMode},
};

const TONE_HZ: f32 = 440.0;
const TONE_LEVEL: f32 = 0.25;

/// Interleaved sine generator producing one packet of audio per call
struct ToneGenerator {
    format: AudioFormat,
    phase: f32,
    step: f32,
}

impl ToneGenerator {
    fn new(format: AudioFormat) -> Self {
        Self {
            format,
            phase: 0.0,
            step: TAU * TONE_HZ / format.sampling_rate.hz() as f32,
        }
    }

    fn fill(&mut self, slot: &mut [u8]) {
        let bps = self.format.bytes_per_sample();
        let channels = self.format.input_channels as usize;
        for frame in slot.chunks_exact_mut(bps * channels) {
            let value = (self.phase.sin() * TONE_LEVEL * i32::MAX as f32) as i32;
            let bytes = value.to_le_bytes();
            for sample in frame.chunks_exact_mut(bps) {
                sample.copy_from_slice(&bytes[4 - bps..]);
            }
            self.phase = (self.phase + self.step) % TAU;
        }
    }
}

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
    let peer = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let kind = args.next().unwrap_or_else(|| "udp".to_string());

    let config = match StreamConfig::default_path() {
        Some(path) => StreamConfig::load_or_default(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => StreamConfig::default(),
    };
    let format = config.audio;
    tracing::info!(?format, %peer, %kind, "Starting tone sender");

    let bridge = Arc::new(RingBuffer::new(format.send_payload_size(), RING_BUFFER_SLOTS));
    let binder = Arc::new(SocketBinder::new());
    let (events, event_rx) = EventSink::channel("sender");

    let mut transport: Transport = match kind.as_str() {
        "udp" => UdpTransport::new(RunMode::Sender, config, binder, bridge.clone(), events)?.into(),
        "icmp" => IcmpTransport::new(RunMode::Sender, config, binder, bridge.clone(), events)?.into(),
        other => bail!("unknown transport '{}', expected udp or icmp", other),
    };
    transport.set_peer_address(&peer)?;
    transport.start()?;

    let mut tone = ToneGenerator::new(format);
    let mut slot = vec![0u8; format.send_payload_size()];
    let mut ticker = tokio::time::interval(format.period());

    tracing::info!("Streaming - press Ctrl+C to stop");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                tone.fill(&mut slot);
                bridge.insert_slot(&slot);

                while let Ok(event) = event_rx.try_recv() {
                    tracing::info!(?event, "Transport event");
                }
                if !transport.is_running() {
                    bail!("{} transport stopped unexpectedly", transport.kind());
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    transport.stop();
    tracing::info!(overflows = bridge.overflow_count(), "Sender stopped");
    Ok(())
}
