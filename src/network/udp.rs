//! UDP binding
//!
//! The canonical transport. The sender thread transmits the whole
//! redundancy window as one datagram with a vectored send; the receiver
//! thread polls the socket with a short timeout so it can notice both
//! stop requests and prolonged silence.

use socket2::{SockAddr, SockRef};
use std::io::{self, IoSlice};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::address::resolve_peer;
use super::binder::SocketBinder;
use super::events::EventSink;
use super::receiver::{PacketReceiver, SilenceMonitor};
use super::redundancy::RedundancyWindow;
use super::sender::PacketSender;
use super::simulation::IssueSimulation;
use super::stats::{PacketStats, PacketStatsSnapshot};
use super::worker::Worker;
use super::{check_audio_packet_size, PacketTransport};
use crate::audio::AudioBridge;
use crate::config::{StreamConfig, TimingConfig};
use crate::constants::MAX_DATAGRAM_SIZE;
use crate::error::{Error, Result};
use crate::protocol::{control_packet, RunMode};

/// Log every this many consecutive send failures
const SEND_ERROR_LOG_EVERY: u64 = 1000;

/// One direction of a UDP audio stream
pub struct UdpTransport {
    mode: RunMode,
    config: StreamConfig,
    binder: Arc<SocketBinder>,
    bridge: Arc<dyn AudioBridge>,
    events: EventSink,
    peer: Option<SocketAddr>,
    socket: Option<Arc<UdpSocket>>,
    audio_packet_size: usize,
    stats: Arc<PacketStats>,
    simulation: Option<IssueSimulation>,
    running: Arc<AtomicBool>,
    worker: Option<Worker>,
}

impl UdpTransport {
    pub fn new(
        mode: RunMode,
        config: StreamConfig,
        binder: Arc<SocketBinder>,
        bridge: Arc<dyn AudioBridge>,
        events: EventSink,
    ) -> Result<Self> {
        config.validate()?;
        let audio_packet_size = match mode {
            RunMode::Sender => config.audio.send_payload_size(),
            RunMode::Receiver => config.audio.receive_payload_size(),
        };
        Ok(Self {
            mode,
            config,
            binder,
            bridge,
            events,
            peer: None,
            socket: None,
            audio_packet_size,
            stats: Arc::new(PacketStats::new()),
            simulation: None,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        })
    }

    /// Use an already bound socket, e.g. one shared by both directions
    pub fn set_socket(&mut self, socket: Arc<UdpSocket>) {
        self.socket = Some(socket);
    }

    /// The bound socket, if any
    pub fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.clone()
    }

    pub fn peer_address(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Bind the local socket if none was provided; returns its address
    pub fn bind(&mut self) -> Result<SocketAddr> {
        if let Some(socket) = &self.socket {
            return Ok(socket.local_addr()?);
        }

        let ip = match self.peer {
            Some(SocketAddr::V6(_)) => Ipv6Addr::UNSPECIFIED.into(),
            _ => Ipv4Addr::UNSPECIFIED.into(),
        };
        let local = SocketAddr::new(ip, self.config.network.bind_port);
        let connect_to = match self.mode {
            RunMode::Sender => self.peer,
            RunMode::Receiver => None,
        };

        let socket = self
            .binder
            .bind_udp(local, connect_to, self.config.timing.poll_timeout())?;
        let addr = socket.local_addr()?;
        self.socket = Some(Arc::new(socket));
        Ok(addr)
    }
}

impl PacketTransport for UdpTransport {
    fn run_mode(&self) -> RunMode {
        self.mode
    }

    fn set_peer_address(&mut self, host: &str) -> Result<()> {
        self.peer = Some(resolve_peer(host, self.config.network.peer_port)?);
        Ok(())
    }

    fn set_audio_packet_size(&mut self, bytes: usize) {
        self.audio_packet_size = bytes;
    }

    fn audio_packet_size(&self) -> usize {
        self.audio_packet_size
    }

    fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(Error::AlreadyRunning);
        }
        self.stop();
        check_audio_packet_size(self.mode, &self.config, self.audio_packet_size)?;

        let local = self.bind()?;
        let socket = self
            .socket
            .clone()
            .ok_or(Error::NotConfigured("socket"))?;
        let redundancy = self.config.network.redundancy as usize;
        let running = self.running.clone();

        let worker = match self.mode {
            RunMode::Sender => {
                let peer = self.peer.ok_or(Error::NotConfigured("peer address"))?;
                let sender = PacketSender::new(&self.config, self.bridge.clone())?;
                let window = RedundancyWindow::new(redundancy, sender.packet_size());
                let connected = socket.peer_addr().ok() == Some(peer);
                info!(%local, %peer, redundancy, "Starting UDP sender");
                Worker::spawn("udp-sender", running, move |running| {
                    run_sender(&socket, peer, connected, sender, window, running)
                })?
            }
            RunMode::Receiver => {
                self.stats.reset();
                let mut receiver = PacketReceiver::new(
                    &self.config,
                    redundancy,
                    self.bridge.clone(),
                    self.stats.clone(),
                    self.events.clone(),
                )?;
                receiver.set_issue_simulation(self.simulation);
                let events = self.events.clone();
                let timing = self.config.timing.clone();
                info!(%local, redundancy, "Starting UDP receiver");
                Worker::spawn("udp-receiver", running, move |running| {
                    run_receiver(&socket, receiver, &timing, &events, running)
                })?
            }
        };

        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
            debug!(mode = %self.mode, "UDP transport stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.worker.as_ref().map_or(false, Worker::is_running)
    }

    fn stats(&self) -> Option<PacketStatsSnapshot> {
        match self.mode {
            RunMode::Receiver => Some(self.stats.snapshot()),
            RunMode::Sender => None,
        }
    }

    fn set_issue_simulation(&mut self, settings: IssueSimulation) {
        self.simulation = Some(settings);
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

fn send_slices(
    socket: &UdpSocket,
    slices: &[IoSlice<'_>],
    peer: &SockAddr,
    connected: bool,
) -> io::Result<usize> {
    let sock = SockRef::from(socket);
    if connected {
        sock.send_vectored(slices)
    } else {
        sock.send_to_vectored(slices, peer)
    }
}

fn run_sender(
    socket: &UdpSocket,
    peer: SocketAddr,
    connected: bool,
    mut sender: PacketSender,
    mut window: RedundancyWindow,
    running: &AtomicBool,
) {
    let peer_addr = SockAddr::from(peer);
    let mut failures: u64 = 0;

    while running.load(Ordering::Relaxed) {
        if !sender.next_packet(window.stage()) {
            continue;
        }
        window.commit();

        match send_slices(socket, &window.io_slices(), &peer_addr, connected) {
            Ok(_) => failures = 0,
            Err(e) => {
                // Typically ICMP port unreachable while the peer isn't listening yet
                if failures % SEND_ERROR_LOG_EVERY == 0 {
                    warn!(%peer, error = %e, "UDP send failed");
                }
                failures += 1;
            }
        }
    }

    let stop = control_packet();
    for _ in 0..2 {
        let _ = send_slices(socket, &[IoSlice::new(&stop)], &peer_addr, connected);
    }
    debug!(%peer, "Sent stop packets");
}

fn run_receiver(
    socket: &UdpSocket,
    mut receiver: PacketReceiver,
    timing: &TimingConfig,
    events: &EventSink,
    running: &AtomicBool,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut silence = SilenceMonitor::new(timing, Instant::now());

    while running.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                silence.packet_received(Instant::now());
                if !receiver.is_connected() {
                    debug!(%from, len, "First datagram");
                }
                if let Err(e) = receiver.handle_packet(&buf[..len]) {
                    events.error(&e);
                    break;
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                silence.check(Instant::now(), events);
            }
            // Windows reports ICMP port unreachable on the next receive
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {}
            Err(e) => {
                if running.load(Ordering::Relaxed) {
                    events.error(&Error::Io(e));
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::RingBuffer;

    fn transport(mode: RunMode) -> UdpTransport {
        let mut config = StreamConfig::default();
        config.network.bind_port = 0;
        let bridge = Arc::new(RingBuffer::new(config.audio.send_payload_size(), 8));
        UdpTransport::new(
            mode,
            config,
            Arc::new(SocketBinder::new()),
            bridge,
            EventSink::detached("test"),
        )
        .unwrap()
    }

    #[test]
    fn test_sender_requires_peer() {
        let mut udp = transport(RunMode::Sender);
        assert!(matches!(udp.start(), Err(Error::NotConfigured(_))));
        assert!(!udp.is_running());
    }

    #[test]
    fn test_invalid_peer_rejected() {
        let mut udp = transport(RunMode::Sender);
        assert!(matches!(
            udp.set_peer_address(""),
            Err(Error::InvalidPeerAddress(_))
        ));
    }

    #[test]
    fn test_wrong_packet_size_rejected() {
        let mut udp = transport(RunMode::Receiver);
        udp.set_audio_packet_size(3);
        assert!(matches!(udp.start(), Err(Error::Config(_))));
    }

    #[test]
    fn test_receiver_start_stop_idempotent() {
        let mut udp = transport(RunMode::Receiver);
        assert_eq!(udp.run_mode(), RunMode::Receiver);
        udp.start().unwrap();
        assert!(udp.is_running());
        assert!(udp.local_addr().is_some());
        assert!(matches!(udp.start(), Err(Error::AlreadyRunning)));

        udp.stop();
        assert!(!udp.is_running());
        udp.stop();
        assert!(udp.stats().is_some());
    }

    #[test]
    fn test_sender_has_no_stats() {
        let mut udp = transport(RunMode::Sender);
        udp.set_peer_address("127.0.0.1").unwrap();
        assert!(udp.stats().is_none());
    }
}
