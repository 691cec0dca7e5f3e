//! Raw ICMP binding
//!
//! Carries packets as the payload of ICMP echo requests, for networks
//! that filter UDP. Opening the raw socket needs elevated privileges.
//! Redundancy is not used on this path.
//!
//! ```text
//! ┌──────┬──────┬──────────┬────────────┬──────────┬─────────────────┐
//! │ type │ code │ checksum │ identifier │ sequence │ header ‖ payload│
//! │  u8  │  u8  │  u16 BE  │   u16 BE   │  u16 BE  │                 │
//! └──────┴──────┴──────────┴────────────┴──────────┴─────────────────┘
//! ```

use serde::Serialize;
use socket2::{SockAddr, Socket};
use std::io::{self, Read};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::address::resolve_peer;
use super::binder::SocketBinder;
use super::events::EventSink;
use super::receiver::{PacketReceiver, SilenceMonitor};
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

/// ICMP echo header length
pub const ICMP_HEADER_SIZE: usize = 8;

const ICMPV4_ECHO_REQUEST: u8 = 8;
const ICMPV6_ECHO_REQUEST: u8 = 128;

/// RFC 1071 internet checksum
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Fill in the echo header at the front of `datagram`; the payload must
/// already follow it.
///
/// The ICMPv6 checksum covers a pseudo-header and is left to the kernel.
pub fn write_echo_header(datagram: &mut [u8], ipv6: bool, identifier: u16, sequence: u16) {
    datagram[0] = if ipv6 { ICMPV6_ECHO_REQUEST } else { ICMPV4_ECHO_REQUEST };
    datagram[1] = 0;
    datagram[2..4].fill(0);
    datagram[4..6].copy_from_slice(&identifier.to_be_bytes());
    datagram[6..8].copy_from_slice(&sequence.to_be_bytes());
    if !ipv6 {
        let sum = checksum(datagram);
        datagram[2..4].copy_from_slice(&sum.to_be_bytes());
    }
}

/// Why a received datagram was not handed on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoRejection {
    /// Too short to hold the headers it claims
    Malformed,
    /// Somebody else's ICMP traffic
    Foreign,
}

/// Extract the payload of one of our echo requests.
///
/// Raw IPv4 sockets deliver the IP header too; IPv6 sockets don't.
pub fn parse_echo(datagram: &[u8], ipv6: bool, identifier: u16) -> std::result::Result<&[u8], EchoRejection> {
    let icmp = if ipv6 {
        datagram
    } else {
        let first = *datagram.first().ok_or(EchoRejection::Malformed)?;
        if first >> 4 != 4 {
            return Err(EchoRejection::Malformed);
        }
        let ihl = (first & 0x0F) as usize * 4;
        datagram.get(ihl..).ok_or(EchoRejection::Malformed)?
    };

    if icmp.len() < ICMP_HEADER_SIZE {
        return Err(EchoRejection::Malformed);
    }
    let expected_type = if ipv6 { ICMPV6_ECHO_REQUEST } else { ICMPV4_ECHO_REQUEST };
    if icmp[0] != expected_type || u16::from_be_bytes([icmp[4], icmp[5]]) != identifier {
        return Err(EchoRejection::Foreign);
    }
    Ok(&icmp[ICMP_HEADER_SIZE..])
}

/// Raw-socket counters
#[derive(Debug, Default)]
pub struct IcmpStats {
    sent: AtomicU64,
    received: AtomicU64,
    malformed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct IcmpStatsSnapshot {
    pub sent: u64,
    pub received: u64,
    pub malformed: u64,
}

impl IcmpStats {
    pub fn snapshot(&self) -> IcmpStatsSnapshot {
        IcmpStatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

/// One direction of an ICMP-tunnelled audio stream
pub struct IcmpTransport {
    mode: RunMode,
    config: StreamConfig,
    binder: Arc<SocketBinder>,
    bridge: Arc<dyn AudioBridge>,
    events: EventSink,
    peer: Option<IpAddr>,
    audio_packet_size: usize,
    icmp_stats: Arc<IcmpStats>,
    simulation: Option<IssueSimulation>,
    running: Arc<AtomicBool>,
    worker: Option<Worker>,
}

impl IcmpTransport {
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
            audio_packet_size,
            icmp_stats: Arc::new(IcmpStats::default()),
            simulation: None,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        })
    }

    pub fn icmp_stats(&self) -> IcmpStatsSnapshot {
        self.icmp_stats.snapshot()
    }

    fn ipv6(&self) -> bool {
        self.peer.map_or(false, |ip| ip.is_ipv6())
    }
}

impl PacketTransport for IcmpTransport {
    fn run_mode(&self) -> RunMode {
        self.mode
    }

    fn set_peer_address(&mut self, host: &str) -> Result<()> {
        self.peer = Some(resolve_peer(host, 0)?.ip());
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

        let ipv6 = self.ipv6();
        let identifier = self.config.network.icmp_identifier;
        let running = self.running.clone();
        let counters = self.icmp_stats.clone();

        let worker = match self.mode {
            RunMode::Sender => {
                let peer = self.peer.ok_or(Error::NotConfigured("peer address"))?;
                let socket = self.binder.bind_icmp(ipv6, self.config.timing.poll_timeout())?;
                let sender = PacketSender::new(&self.config, self.bridge.clone())?;
                info!(%peer, identifier, "Starting ICMP sender");
                Worker::spawn("icmp-sender", running, move |running| {
                    let link = EchoLink { socket, ipv6, identifier, counters };
                    link.run_sender(SocketAddr::new(peer, 0), sender, running)
                })?
            }
            RunMode::Receiver => {
                let socket = self.binder.bind_icmp(ipv6, self.config.timing.poll_timeout())?;
                let mut receiver = PacketReceiver::new(
                    &self.config,
                    1,
                    self.bridge.clone(),
                    Arc::new(PacketStats::new()),
                    self.events.clone(),
                )?;
                receiver.set_issue_simulation(self.simulation);
                let events = self.events.clone();
                let timing = self.config.timing.clone();
                info!(identifier, "Starting ICMP receiver");
                Worker::spawn("icmp-receiver", running, move |running| {
                    let link = EchoLink { socket, ipv6, identifier, counters };
                    link.run_receiver(receiver, &timing, &events, running)
                })?
            }
        };

        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
            debug!(mode = %self.mode, "ICMP transport stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.worker.as_ref().map_or(false, Worker::is_running)
    }

    /// Sequence statistics are not collected on this path
    fn stats(&self) -> Option<PacketStatsSnapshot> {
        None
    }

    fn set_issue_simulation(&mut self, settings: IssueSimulation) {
        self.simulation = Some(settings);
    }
}

impl Drop for IcmpTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

struct EchoLink {
    socket: Socket,
    ipv6: bool,
    identifier: u16,
    counters: Arc<IcmpStats>,
}

impl EchoLink {
    fn send(&self, datagram: &mut [u8], sequence: u16, peer: &SockAddr) -> io::Result<usize> {
        write_echo_header(datagram, self.ipv6, self.identifier, sequence);
        let sent = self.socket.send_to(datagram, peer)?;
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        Ok(sent)
    }

    fn run_sender(&self, peer: SocketAddr, mut sender: PacketSender, running: &AtomicBool) {
        let peer_addr = SockAddr::from(peer);
        let mut datagram = vec![0u8; ICMP_HEADER_SIZE + sender.packet_size()];
        let mut failed_once = false;

        while running.load(Ordering::Relaxed) {
            let sequence = sender.sequence_number();
            if !sender.next_packet(&mut datagram[ICMP_HEADER_SIZE..]) {
                continue;
            }
            if let Err(e) = self.send(&mut datagram, sequence, &peer_addr) {
                if !failed_once {
                    warn!(%peer, error = %e, "ICMP send failed");
                    failed_once = true;
                }
            }
        }

        let mut stop = vec![0u8; ICMP_HEADER_SIZE];
        stop.extend_from_slice(&control_packet());
        for _ in 0..2 {
            let _ = self.send(&mut stop, sender.sequence_number(), &peer_addr);
        }
    }

    fn run_receiver(
        &self,
        mut receiver: PacketReceiver,
        timing: &TimingConfig,
        events: &EventSink,
        running: &AtomicBool,
    ) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut silence = SilenceMonitor::new(timing, Instant::now());

        while running.load(Ordering::Relaxed) {
            match (&self.socket).read(&mut buf) {
                Ok(len) => match parse_echo(&buf[..len], self.ipv6, self.identifier) {
                    Ok(payload) => {
                        self.counters.received.fetch_add(1, Ordering::Relaxed);
                        silence.packet_received(Instant::now());
                        if let Err(e) = receiver.handle_packet(payload) {
                            events.error(&e);
                            break;
                        }
                    }
                    Err(EchoRejection::Malformed) => {
                        self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(EchoRejection::Foreign) => {}
                },
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    silence.check(Instant::now(), events);
                }
                Err(e) => {
                    if running.load(Ordering::Relaxed) {
                        events.error(&Error::Io(e));
                    }
                    break;
                }
            }
        }
    }
}
