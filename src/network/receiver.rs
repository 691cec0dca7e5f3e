//! Receive-side processing shared by all bindings
//!
//! [`PacketReceiver`] does everything between "a datagram arrived" and
//! "audio is in the ring buffer": shutdown sentinel, peer negotiation on
//! the first packet, sequence tracking with redundancy recovery, channel
//! layout conversion and gap accounting. Poll-driven bindings call it from
//! their receive loop; callback-driven bindings wrap it in a
//! [`PushReceiver`].

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::events::{EventSink, TransportEvent};
use super::redundancy::{ReorderDecision, ReorderEngine};
use super::simulation::{IssueDecision, IssueSimulation, IssueSimulator};
use super::stats::PacketStats;
use crate::audio::{planar_to_interleaved, AudioBridge};
use crate::config::{StreamConfig, TimingConfig};
use crate::error::{Error, ErrorKind, Result};
use crate::protocol::{build_header, is_control_packet, AudioFormat, PacketHeader};

/// Result of handing one datagram to a [`PacketReceiver`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// This many payloads reached the bridge
    Delivered(usize),
    /// Out-of-order transmission, or the receiver already failed
    Discarded,
    /// Dropped by issue simulation
    Dropped,
    /// The peer's shutdown sentinel
    Ceased,
}

#[derive(Debug, Clone, Copy)]
struct PeerLayout {
    channels: u8,
    packet_size: usize,
}

/// Sequence tracking and ring-buffer delivery for one incoming stream
pub struct PacketReceiver {
    header: Box<dyn PacketHeader>,
    format: AudioFormat,
    redundancy: usize,
    engine: ReorderEngine,
    bridge: Arc<dyn AudioBridge>,
    stats: Arc<PacketStats>,
    events: EventSink,
    peer: Option<PeerLayout>,
    stop_signal_sent: bool,
    failed: bool,
    interleaved: Vec<u8>,
    seqs: Vec<u16>,
    simulator: Option<IssueSimulator>,
}

impl PacketReceiver {
    pub fn new(
        config: &StreamConfig,
        redundancy: usize,
        bridge: Arc<dyn AudioBridge>,
        stats: Arc<PacketStats>,
        events: EventSink,
    ) -> Result<Self> {
        let header = build_header(config.network.header, &config.audio)?;
        let redundancy = redundancy.max(1);
        Ok(Self {
            header,
            format: config.audio,
            redundancy,
            engine: ReorderEngine::new(
                config.timing.out_of_order_reset,
                config.timing.max_sequence_gap,
            )
            .with_recovery(config.network.recovery),
            bridge,
            stats,
            events,
            peer: None,
            stop_signal_sent: false,
            failed: false,
            interleaved: vec![0u8; config.audio.receive_payload_size()],
            seqs: Vec::with_capacity(redundancy),
            simulator: None,
        })
    }

    pub fn set_issue_simulation(&mut self, settings: Option<IssueSimulation>) {
        self.simulator = settings.filter(IssueSimulation::is_active).map(IssueSimulator::new);
    }

    /// Whether the peer's first packet has been accepted
    pub fn is_connected(&self) -> bool {
        self.peer.is_some()
    }

    pub fn stats(&self) -> &Arc<PacketStats> {
        &self.stats
    }

    /// Forget the peer, the sequence history and any earlier failure so
    /// the next packet starts a new stream
    pub fn reset(&mut self) {
        self.peer = None;
        self.stop_signal_sent = false;
        self.failed = false;
        self.engine.reset();
        self.stats.reset();
    }

    /// Process one datagram.
    ///
    /// An error is fatal for the stream: the receiver ignores everything
    /// it is handed afterwards.
    pub fn handle_packet(&mut self, datagram: &[u8]) -> Result<ReceiveOutcome> {
        if self.failed {
            return Ok(ReceiveOutcome::Discarded);
        }

        if let Some(simulator) = &self.simulator {
            match simulator.decide() {
                IssueDecision::Drop => return Ok(ReceiveOutcome::Dropped),
                IssueDecision::Delay(delay) => thread::sleep(delay),
                IssueDecision::Deliver => {}
            }
        }

        if is_control_packet(datagram) {
            if !self.stop_signal_sent {
                self.stop_signal_sent = true;
                self.events.cease("Peer Stopped");
            }
            return Ok(ReceiveOutcome::Ceased);
        }

        let result = self.process(datagram);
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    fn process(&mut self, datagram: &[u8]) -> Result<ReceiveOutcome> {
        let peer = match self.peer {
            Some(peer) => peer,
            None => {
                let peer = self.negotiate(datagram)?;
                self.peer = Some(peer);
                self.events.peer_connected();
                peer
            }
        };

        let slots = (datagram.len() / peer.packet_size).min(self.redundancy);
        if slots == 0 {
            return Err(Error::BufferIncompatible(format!(
                "received {} bytes, a packet needs {}",
                datagram.len(),
                peer.packet_size
            )));
        }

        if self.header.header_size() == 0 {
            self.stats.record_delivery(0, 0);
            self.deliver_slot(&datagram[..peer.packet_size], peer, 0, 0)?;
            return Ok(ReceiveOutcome::Delivered(1));
        }

        self.seqs.clear();
        for i in 0..slots {
            let slot = &datagram[i * peer.packet_size..(i + 1) * peer.packet_size];
            self.seqs.push(self.header.peer_sequence_number(slot).unwrap_or(0));
        }

        match self.engine.process(&self.seqs) {
            ReorderDecision::Deliver {
                first_slot,
                gap_packets,
                lost,
                revived,
            } => {
                self.stats.record_delivery(lost as u64, revived as u64);
                if lost > 0 {
                    debug!(lost, revived, seq = self.seqs[0], "Sequence gap");
                }
                for idx in (0..=first_slot).rev() {
                    let slot = &datagram[idx * peer.packet_size..(idx + 1) * peer.packet_size];
                    let gap = if idx == first_slot { gap_packets as usize } else { 0 };
                    self.deliver_slot(slot, peer, gap, self.seqs[idx])?;
                }
                Ok(ReceiveOutcome::Delivered(first_slot + 1))
            }
            ReorderDecision::OutOfOrder => {
                self.stats.record_out_of_order();
                Ok(ReceiveOutcome::Discarded)
            }
            ReorderDecision::Resync => {
                warn!(seq = self.seqs[0], "Too many out-of-order packets, resynchronizing");
                self.stats.reset_sync();
                Ok(ReceiveOutcome::Discarded)
            }
        }
    }

    fn negotiate(&self, datagram: &[u8]) -> Result<PeerLayout> {
        self.header.check_peer_settings(datagram)?;

        let channels = match self.header.decode(datagram) {
            Some(fields) => {
                info!(peer = %fields.describe(), "Peer settings accepted");
                fields.input_channels
            }
            None => self.format.output_channels,
        };
        if channels == 0 {
            return Err(Error::BufferIncompatible("peer sends no channels".into()));
        }
        if channels != self.format.output_channels {
            info!(
                peer_channels = channels,
                local_channels = self.format.output_channels,
                "Channel counts differ, extra channels are dropped or silent"
            );
        }

        Ok(PeerLayout {
            channels,
            packet_size: self.header.header_size() + self.format.payload_size(channels),
        })
    }

    fn deliver_slot(&mut self, slot: &[u8], peer: PeerLayout, gap_packets: usize, seq: u16) -> Result<()> {
        let header_size = self.header.header_size();
        planar_to_interleaved(
            &slot[header_size..],
            peer.channels as usize,
            &mut self.interleaved,
            self.format.output_channels as usize,
            self.format.buffer_size as usize,
            self.format.bytes_per_sample(),
        );

        let gap_bytes = gap_packets * self.interleaved.len();
        if !self.bridge.write_audio_buffer(&self.interleaved, gap_bytes, seq) {
            return Err(Error::BufferIncompatible(
                "Local and Peer buffer settings are incompatible".into(),
            ));
        }
        Ok(())
    }
}

/// Tracks how long a receiver has gone without packets
#[derive(Debug, Clone)]
pub struct SilenceMonitor {
    wait_interval: Duration,
    peer_gone_after: Duration,
    last_packet: Instant,
    next_report: Duration,
    gone_reported: bool,
}

impl SilenceMonitor {
    pub fn new(timing: &TimingConfig, now: Instant) -> Self {
        let wait_interval = timing.wait_report_interval().max(Duration::from_millis(1));
        Self {
            wait_interval,
            peer_gone_after: timing.peer_gone_after(),
            last_packet: now,
            next_report: wait_interval,
            gone_reported: false,
        }
    }

    pub fn packet_received(&mut self, now: Instant) {
        if self.gone_reported || self.next_report > self.wait_interval {
            info!("Peer is sending again");
        }
        self.last_packet = now;
        self.next_report = self.wait_interval;
        self.gone_reported = false;
    }

    /// Emit whatever notifications the silence up to `now` calls for
    pub fn check(&mut self, now: Instant, events: &EventSink) {
        let silent = now.saturating_duration_since(self.last_packet);
        if silent >= self.next_report {
            events.emit(TransportEvent::WaitingTooLong(silent));
            while self.next_report <= silent {
                self.next_report += self.wait_interval;
            }
        }
        if !self.gone_reported && silent >= self.peer_gone_after {
            self.gone_reported = true;
            events.emit(TransportEvent::PeerGone(silent));
        }
    }
}

/// A [`PacketReceiver`] fed from a transport library's callbacks.
///
/// Callbacks arrive on the library's thread; a monitor loop on a worker
/// thread watches for silence.
pub struct PushReceiver {
    receiver: Mutex<PacketReceiver>,
    running: Arc<AtomicBool>,
    packet_seen: AtomicBool,
    closed_signalled: AtomicBool,
    events: EventSink,
}

impl PushReceiver {
    pub fn new(receiver: PacketReceiver, running: Arc<AtomicBool>, events: EventSink) -> Self {
        Self {
            receiver: Mutex::new(receiver),
            running,
            packet_seen: AtomicBool::new(false),
            closed_signalled: AtomicBool::new(false),
            events,
        }
    }

    /// Handle one message. Ignored unless the role is running.
    pub fn on_packet(&self, data: &[u8]) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        self.packet_seen.store(true, Ordering::Release);

        if let Err(e) = self.receiver.lock().handle_packet(data) {
            self.events.error(&e);
            self.running.store(false, Ordering::Release);
        }
    }

    /// The underlying channel or session went away
    pub fn on_closed(&self, reason: &str) {
        if !self.closed_signalled.swap(true, Ordering::AcqRel) {
            self.events.cease(reason);
        }
    }

    pub fn on_error(&self, message: &str) {
        self.events.emit(TransportEvent::Error {
            kind: ErrorKind::Io,
            message: message.to_string(),
        });
    }

    pub fn set_issue_simulation(&self, settings: Option<IssueSimulation>) {
        self.receiver.lock().set_issue_simulation(settings);
    }

    /// Prepare for a new run of the owning transport
    pub fn reset(&self) {
        self.receiver.lock().reset();
        self.packet_seen.store(false, Ordering::Release);
        self.closed_signalled.store(false, Ordering::Release);
    }

    pub fn stats(&self) -> Arc<PacketStats> {
        self.receiver.lock().stats().clone()
    }

    /// Silence watchdog; runs until `running` is cleared
    pub fn monitor(&self, running: &AtomicBool, timing: &TimingConfig) {
        let poll = timing.poll_timeout();
        let mut silence = SilenceMonitor::new(timing, Instant::now());
        while running.load(Ordering::Acquire) {
            thread::sleep(poll);
            let now = Instant::now();
            if self.packet_seen.swap(false, Ordering::AcqRel) {
                silence.packet_received(now);
            } else {
                silence.check(now, &self.events);
            }
        }
    }
}
