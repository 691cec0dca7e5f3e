//! WebTransport (QUIC datagram) binding
//!
//! Same callback-driven receive path as the WebRTC binding. The send path
//! writes each packet straight into a buffer from a [`BufferPool`] and
//! hands ownership to the session, which drops it once the datagram is
//! out. When every buffer is still in flight the tick's packet is skipped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

use super::events::EventSink;
use super::pool::{BufferPool, PooledBuffer};
use super::receiver::{PacketReceiver, PushReceiver};
use super::sender::PacketSender;
use super::simulation::IssueSimulation;
use super::stats::{PacketStats, PacketStatsSnapshot};
use super::worker::Worker;
use super::{check_audio_packet_size, PacketTransport};
use crate::audio::AudioBridge;
use crate::config::StreamConfig;
use crate::error::{Error, Result};
use crate::protocol::{control_packet, RunMode, CONTROL_PACKET_SIZE};

/// Log pool exhaustion once per this many skipped packets
const EXHAUSTED_LOG_EVERY: usize = 500;

/// An established session's datagram path
pub trait DatagramSession: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Queue one datagram. The session owns `datagram` until the send
    /// completes and releases it by dropping it.
    fn send_datagram(&self, datagram: PooledBuffer) -> std::result::Result<(), String>;
}

/// Entry points for the session library's callbacks
#[derive(Clone)]
pub struct WebTransportHandle {
    mode: RunMode,
    push: Arc<PushReceiver>,
}

impl WebTransportHandle {
    pub fn on_datagram(&self, data: &[u8]) {
        if self.mode == RunMode::Receiver {
            self.push.on_packet(data);
        }
    }

    pub fn on_session_closed(&self) {
        self.push.on_closed("Session closed");
    }

    pub fn on_error(&self, message: &str) {
        self.push.on_error(message);
    }
}

/// One direction of a WebTransport audio stream
pub struct WebTransportTransport {
    mode: RunMode,
    config: StreamConfig,
    session: Arc<dyn DatagramSession>,
    bridge: Arc<dyn AudioBridge>,
    audio_packet_size: usize,
    stats: Arc<PacketStats>,
    push: Arc<PushReceiver>,
    pool: Arc<BufferPool>,
    running: Arc<AtomicBool>,
    worker: Option<Worker>,
}

impl WebTransportTransport {
    pub fn new(
        mode: RunMode,
        config: StreamConfig,
        session: Arc<dyn DatagramSession>,
        bridge: Arc<dyn AudioBridge>,
        events: EventSink,
    ) -> Result<Self> {
        config.validate()?;
        let stats = Arc::new(PacketStats::new());
        let running = Arc::new(AtomicBool::new(false));
        let receiver = PacketReceiver::new(&config, 1, bridge.clone(), stats.clone(), events.clone())?;
        let push = Arc::new(PushReceiver::new(receiver, running.clone(), events));
        let pool = BufferPool::new(
            config.network.send_pool_size,
            config.send_packet_size()?.max(CONTROL_PACKET_SIZE),
        );
        let audio_packet_size = match mode {
            RunMode::Sender => config.audio.send_payload_size(),
            RunMode::Receiver => config.audio.receive_payload_size(),
        };

        Ok(Self {
            mode,
            config,
            session,
            bridge,
            audio_packet_size,
            stats,
            push,
            pool,
            running,
            worker: None,
        })
    }

    pub fn handle(&self) -> WebTransportHandle {
        WebTransportHandle {
            mode: self.mode,
            push: self.push.clone(),
        }
    }

    pub fn send_pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }
}

impl PacketTransport for WebTransportTransport {
    fn run_mode(&self) -> RunMode {
        self.mode
    }

    /// The peer is implied by the session
    fn set_peer_address(&mut self, _host: &str) -> Result<()> {
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

        let running = self.running.clone();
        let poll = self.config.timing.poll_timeout();

        let worker = match self.mode {
            RunMode::Sender => {
                let sender = PacketSender::new(&self.config, self.bridge.clone())?;
                let session = self.session.clone();
                let pool = self.pool.clone();
                info!(pool = pool.capacity(), "Starting WebTransport sender");
                Worker::spawn("webtransport-sender", running, move |running| {
                    run_sender(session.as_ref(), &pool, sender, poll, running)
                })?
            }
            RunMode::Receiver => {
                self.push.reset();
                let push = self.push.clone();
                let timing = self.config.timing.clone();
                info!("Starting WebTransport receiver");
                Worker::spawn("webtransport-monitor", running, move |running| {
                    push.monitor(running, &timing)
                })?
            }
        };

        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
            debug!(mode = %self.mode, "WebTransport stopped");
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
        self.push.set_issue_simulation(Some(settings));
    }
}

impl Drop for WebTransportTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_sender(
    session: &dyn DatagramSession,
    pool: &Arc<BufferPool>,
    mut sender: PacketSender,
    poll: std::time::Duration,
    running: &AtomicBool,
) {
    let packet_size = sender.packet_size();
    let mut scratch = vec![0u8; packet_size];
    let mut skipped: usize = 0;

    while running.load(Ordering::Relaxed) {
        if !session.is_connected() {
            thread::sleep(poll);
            continue;
        }

        match pool.acquire() {
            Some(mut datagram) => {
                if !sender.next_packet(&mut datagram) {
                    continue;
                }
                datagram.truncate(packet_size);
                if let Err(e) = session.send_datagram(datagram) {
                    debug!(error = %e, "Datagram send failed");
                }
            }
            None => {
                // Keep pace with the audio thread; the peer sees a sequence gap
                if sender.next_packet(&mut scratch) {
                    if skipped % EXHAUSTED_LOG_EVERY == 0 {
                        warn!(in_flight = pool.capacity(), "Send pool exhausted, packet skipped");
                    }
                    skipped += 1;
                }
            }
        }
    }

    if session.is_connected() {
        for _ in 0..2 {
            if let Some(mut datagram) = pool.acquire() {
                datagram.truncate(CONTROL_PACKET_SIZE);
                datagram.copy_from_slice(&control_packet());
                let _ = session.send_datagram(datagram);
            }
        }
    }
}

#[cfg(feature = "quic")]
pub mod quic {
    //! quinn adapter for the datagram path of an established connection

    use quinn::{Connection, ConnectionError};
    use tokio::runtime::Handle;
    use tokio::task::JoinHandle;
    use tracing::debug;

    use super::{DatagramSession, WebTransportHandle};
    use crate::network::pool::PooledBuffer;

    /// Sends datagrams on a quinn connection
    pub struct QuinnSession {
        conn: Connection,
    }

    impl QuinnSession {
        pub fn new(conn: Connection) -> Self {
            Self { conn }
        }
    }

    impl DatagramSession for QuinnSession {
        fn is_connected(&self) -> bool {
            self.conn.close_reason().is_none()
        }

        /// quinn keeps the `Bytes` until the datagram is packetized or
        /// dropped from its queue; the pool slot is released then.
        fn send_datagram(&self, datagram: PooledBuffer) -> Result<(), String> {
            self.conn
                .send_datagram(datagram.into_bytes())
                .map_err(|e| e.to_string())
        }
    }

    /// Feed the connection's incoming datagrams to a transport until the
    /// connection closes
    pub fn attach(conn: Connection, handle: WebTransportHandle, runtime: &Handle) -> JoinHandle<()> {
        runtime.spawn(async move {
            loop {
                match conn.read_datagram().await {
                    Ok(datagram) => handle.on_datagram(&datagram),
                    Err(ConnectionError::ApplicationClosed(_)) | Err(ConnectionError::LocallyClosed) => {
                        handle.on_session_closed();
                        break;
                    }
                    Err(e) => {
                        debug!(error = %e, "Connection lost");
                        handle.on_error(&e.to_string());
                        handle.on_session_closed();
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::RingBuffer;
    use crate::protocol::is_control_packet;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Session that keeps every datagram in flight until `complete` is called
    #[derive(Default)]
    struct HoldingSession {
        in_flight: Mutex<Vec<PooledBuffer>>,
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl HoldingSession {
        fn complete(&self) {
            self.in_flight.lock().clear();
        }
    }

    impl DatagramSession for HoldingSession {
        fn is_connected(&self) -> bool {
            true
        }

        fn send_datagram(&self, datagram: PooledBuffer) -> std::result::Result<(), String> {
            self.sent.lock().push(datagram.to_vec());
            self.in_flight.lock().push(datagram);
            Ok(())
        }
    }

    /// Session that converts to `Bytes` and queues them, as a QUIC stack does
    #[derive(Default)]
    struct QueueingSession {
        queue: Mutex<std::collections::VecDeque<bytes::Bytes>>,
    }

    impl DatagramSession for QueueingSession {
        fn is_connected(&self) -> bool {
            true
        }

        fn send_datagram(&self, datagram: PooledBuffer) -> std::result::Result<(), String> {
            self.queue.lock().push_back(datagram.into_bytes());
            Ok(())
        }
    }

    fn config() -> StreamConfig {
        let mut config = StreamConfig::default();
        config.audio.buffer_size = 4;
        config.network.send_pool_size = 2;
        config.timing.sender_read_timeout_ms = 5;
        config.timing.poll_timeout_ms = 1;
        config
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..400 {
            if done() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_exhausted_pool_skips_packets() {
        let config = config();
        let slot = vec![0u8; config.audio.send_payload_size()];
        let bridge = Arc::new(RingBuffer::new(slot.len(), 16));
        let session = Arc::new(HoldingSession::default());

        let mut transport = WebTransportTransport::new(
            RunMode::Sender,
            config,
            session.clone(),
            bridge.clone(),
            EventSink::detached("webtransport"),
        )
        .unwrap();
        transport.start().unwrap();

        for _ in 0..4 {
            bridge.insert_slot(&slot);
        }
        wait_for(|| bridge.is_empty());
        wait_for(|| transport.send_pool().exhausted_count() >= 2);

        assert_eq!(session.sent.lock().len(), 2);
        assert_eq!(transport.send_pool().in_use(), 2);

        session.complete();
        transport.stop();

        let sent = session.sent.lock();
        assert_eq!(sent.len(), 4);
        assert!(is_control_packet(&sent[2]));
        assert!(is_control_packet(&sent[3]));
        // the two skipped packets left a gap of two sequence numbers
        assert_eq!(u16::from_le_bytes([sent[0][8], sent[0][9]]), 0);
        assert_eq!(u16::from_le_bytes([sent[1][8], sent[1][9]]), 1);
    }

    #[test]
    fn test_pool_slot_released_when_queue_drains() {
        let config = config();
        let slot = vec![7u8; config.audio.send_payload_size()];
        let bridge = Arc::new(RingBuffer::new(slot.len(), 16));
        let session = Arc::new(QueueingSession::default());

        let mut transport = WebTransportTransport::new(
            RunMode::Sender,
            config,
            session.clone(),
            bridge.clone(),
            EventSink::detached("webtransport"),
        )
        .unwrap();
        transport.start().unwrap();

        bridge.insert_slot(&slot);
        wait_for(|| !session.queue.lock().is_empty());
        transport.stop();

        // audio datagram plus whatever stop packets the pool allowed
        let queued = session.queue.lock().len();
        assert!(queued >= 2);
        assert_eq!(transport.send_pool().in_use(), queued);

        let sent = session.queue.lock().pop_front().unwrap();
        assert_eq!(&sent[16..], &slot[..]);
        drop(sent);
        assert_eq!(transport.send_pool().in_use(), queued - 1);

        session.queue.lock().clear();
        assert_eq!(transport.send_pool().in_use(), 0);
    }

    #[test]
    fn test_receiver_restarts_after_error() {
        let config = config();
        let bridge = Arc::new(RingBuffer::new(config.audio.receive_payload_size(), 16));
        let (events, event_rx) = EventSink::channel("webtransport");
        let mut transport = WebTransportTransport::new(
            RunMode::Receiver,
            config.clone(),
            Arc::new(HoldingSession::default()),
            bridge.clone(),
            events,
        )
        .unwrap();
        let handle = transport.handle();
        transport.start().unwrap();

        handle.on_datagram(&[0u8; 20]);
        assert!(matches!(
            event_rx.try_recv().unwrap(),
            crate::network::TransportEvent::Error { .. }
        ));
        wait_for(|| !transport.is_running());
        assert!(!transport.is_running());

        transport.start().unwrap();
        let mut fields = crate::protocol::HeaderFields::from_format(&config.audio);
        fields.sequence_number = 3;
        let mut datagram = crate::protocol::DefaultHeader::to_bytes(&fields).to_vec();
        datagram.resize(datagram.len() + config.audio.send_payload_size(), 1);
        handle.on_datagram(&datagram);
        assert_eq!(
            event_rx.try_recv().unwrap(),
            crate::network::TransportEvent::PeerConnected
        );
        assert_eq!(bridge.len(), 1);
        transport.stop();
    }

    #[test]
    fn test_receiver_handle() {
        let config = config();
        let bridge = Arc::new(RingBuffer::new(config.audio.receive_payload_size(), 16));
        let (events, event_rx) = EventSink::channel("webtransport");
        let mut transport = WebTransportTransport::new(
            RunMode::Receiver,
            config,
            Arc::new(HoldingSession::default()),
            bridge.clone(),
            events,
        )
        .unwrap();
        let handle = transport.handle();
        transport.start().unwrap();

        handle.on_datagram(&control_packet());
        handle.on_session_closed();
        assert_eq!(
            event_rx.try_recv().unwrap(),
            crate::network::TransportEvent::CeaseTransmission("Peer Stopped".into())
        );
        assert_eq!(
            event_rx.try_recv().unwrap(),
            crate::network::TransportEvent::CeaseTransmission("Session closed".into())
        );
        assert!(bridge.is_empty());
        transport.stop();
    }
}
