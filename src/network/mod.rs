//! Network subsystem
//!
//! Four bindings share one role contract, [`PacketTransport`]. UDP and
//! ICMP run their own socket loops; WebRTC and WebTransport are fed by
//! their library's callbacks. All of them build packets with
//! [`sender::PacketSender`] and deliver them through
//! [`receiver::PacketReceiver`].

pub mod address;
pub mod binder;
pub mod events;
pub mod icmp;
pub mod pool;
pub mod receiver;
pub mod redundancy;
pub mod sender;
pub mod simulation;
pub mod stats;
pub mod udp;
pub mod webrtc;
pub mod webtransport;
pub mod worker;

pub use address::resolve_peer;
pub use binder::SocketBinder;
pub use events::{EventSink, TransportEvent};
pub use icmp::{IcmpStatsSnapshot, IcmpTransport};
pub use pool::{BufferPool, PooledBuffer};
pub use receiver::{PacketReceiver, PushReceiver, ReceiveOutcome, SilenceMonitor};
pub use redundancy::{RecoveryMode, RedundancyWindow, ReorderDecision, ReorderEngine};
pub use sender::PacketSender;
pub use simulation::{IssueDecision, IssueSimulation, IssueSimulator};
pub use stats::{PacketStats, PacketStatsSnapshot};
pub use udp::UdpTransport;
pub use webrtc::{DataChannel, WebRtcHandle, WebRtcTransport};
pub use webtransport::{DatagramSession, WebTransportHandle, WebTransportTransport};

use crate::config::StreamConfig;
use crate::error::{Error, Result};
use crate::protocol::RunMode;

/// What every binding offers its owner
pub trait PacketTransport: Send {
    fn run_mode(&self) -> RunMode;

    /// Resolve and remember the peer. Bindings without addresses accept
    /// anything.
    fn set_peer_address(&mut self, host: &str) -> Result<()>;

    /// Bytes of audio per packet as seen by the owner's audio thread
    fn set_audio_packet_size(&mut self, bytes: usize);

    fn audio_packet_size(&self) -> usize;

    /// Bind if needed and launch the worker thread
    fn start(&mut self) -> Result<()>;

    /// Stop and join the worker. Idempotent.
    fn stop(&mut self);

    fn is_running(&self) -> bool;

    /// Receive statistics; `None` for senders and bindings without them
    fn stats(&self) -> Option<PacketStatsSnapshot>;

    /// Artificial loss and jitter for testing
    fn set_issue_simulation(&mut self, settings: IssueSimulation);
}

/// Reject an audio packet size that disagrees with the configured format
pub(crate) fn check_audio_packet_size(
    mode: RunMode,
    config: &StreamConfig,
    bytes: usize,
) -> Result<()> {
    let expected = match mode {
        RunMode::Sender => config.audio.send_payload_size(),
        RunMode::Receiver => config.audio.receive_payload_size(),
    };
    if bytes != expected {
        return Err(Error::Config(format!(
            "audio packet size {} does not match the {} bytes the format implies",
            bytes, expected
        )));
    }
    Ok(())
}

/// Any of the bindings, selected at runtime
pub enum Transport {
    Udp(UdpTransport),
    Icmp(IcmpTransport),
    WebRtc(WebRtcTransport),
    WebTransport(WebTransportTransport),
}

impl Transport {
    pub fn kind(&self) -> &'static str {
        match self {
            Transport::Udp(_) => "udp",
            Transport::Icmp(_) => "icmp",
            Transport::WebRtc(_) => "webrtc",
            Transport::WebTransport(_) => "webtransport",
        }
    }

    fn inner(&self) -> &dyn PacketTransport {
        match self {
            Transport::Udp(t) => t,
            Transport::Icmp(t) => t,
            Transport::WebRtc(t) => t,
            Transport::WebTransport(t) => t,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn PacketTransport {
        match self {
            Transport::Udp(t) => t,
            Transport::Icmp(t) => t,
            Transport::WebRtc(t) => t,
            Transport::WebTransport(t) => t,
        }
    }
}

impl PacketTransport for Transport {
    fn run_mode(&self) -> RunMode {
        self.inner().run_mode()
    }

    fn set_peer_address(&mut self, host: &str) -> Result<()> {
        self.inner_mut().set_peer_address(host)
    }

    fn set_audio_packet_size(&mut self, bytes: usize) {
        self.inner_mut().set_audio_packet_size(bytes)
    }

    fn audio_packet_size(&self) -> usize {
        self.inner().audio_packet_size()
    }

    fn start(&mut self) -> Result<()> {
        self.inner_mut().start()
    }

    fn stop(&mut self) {
        self.inner_mut().stop()
    }

    fn is_running(&self) -> bool {
        self.inner().is_running()
    }

    fn stats(&self) -> Option<PacketStatsSnapshot> {
        self.inner().stats()
    }

    fn set_issue_simulation(&mut self, settings: IssueSimulation) {
        self.inner_mut().set_issue_simulation(settings)
    }
}

impl From<UdpTransport> for Transport {
    fn from(t: UdpTransport) -> Self {
        Transport::Udp(t)
    }
}

impl From<IcmpTransport> for Transport {
    fn from(t: IcmpTransport) -> Self {
        Transport::Icmp(t)
    }
}

impl From<WebRtcTransport> for Transport {
    fn from(t: WebRtcTransport) -> Self {
        Transport::WebRtc(t)
    }
}

impl From<WebTransportTransport> for Transport {
    fn from(t: WebTransportTransport) -> Self {
        Transport::WebTransport(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::RingBuffer;
    use std::sync::Arc;

    #[test]
    fn test_packet_size_check() {
        let config = StreamConfig::default();
        let send = config.audio.send_payload_size();
        assert!(check_audio_packet_size(RunMode::Sender, &config, send).is_ok());
        assert!(matches!(
            check_audio_packet_size(RunMode::Sender, &config, send + 1),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_transport_delegates() {
        let mut config = StreamConfig::default();
        config.network.bind_port = 0;
        let bridge = Arc::new(RingBuffer::new(config.audio.receive_payload_size(), 8));
        let udp = UdpTransport::new(
            RunMode::Receiver,
            config.clone(),
            Arc::new(SocketBinder::new()),
            bridge,
            EventSink::detached("test"),
        )
        .unwrap();

        let mut transport: Transport = udp.into();
        assert_eq!(transport.kind(), "udp");
        assert_eq!(transport.run_mode(), RunMode::Receiver);
        assert_eq!(
            transport.audio_packet_size(),
            config.audio.receive_payload_size()
        );
        transport.start().unwrap();
        assert!(transport.is_running());
        transport.stop();
        assert!(!transport.is_running());
        assert_eq!(transport.stats().unwrap().tot, 0);
    }
}
