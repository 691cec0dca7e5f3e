//! WebRTC data channel binding
//!
//! Packets travel over an unreliable, unordered data channel. Messages
//! arrive through the channel library's callbacks, so the receive side has
//! no loop of its own; a monitor thread only watches for silence. No
//! redundancy window is used here.
//!
//! The binding talks to the channel through the [`DataChannel`] trait.
//! With the `webrtc` feature, [`rtc::RtcDataChannel`] adapts a webrtc-rs
//! `RTCDataChannel` and [`rtc::attach`] wires its callbacks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

use super::events::EventSink;
use super::receiver::{PacketReceiver, PushReceiver};
use super::sender::PacketSender;
use super::simulation::IssueSimulation;
use super::stats::{PacketStats, PacketStatsSnapshot};
use super::worker::Worker;
use super::{check_audio_packet_size, PacketTransport};
use crate::audio::AudioBridge;
use crate::config::StreamConfig;
use crate::error::{Error, Result};
use crate::protocol::{control_packet, RunMode};

/// The sending half of a data channel
pub trait DataChannel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Queue one message. Must not block on the network.
    fn send(&self, data: &[u8]) -> std::result::Result<(), String>;
}

/// Entry points for the channel library's callbacks
#[derive(Clone)]
pub struct WebRtcHandle {
    mode: RunMode,
    push: Arc<PushReceiver>,
}

impl WebRtcHandle {
    pub fn on_open(&self) {
        info!(mode = %self.mode, "Data channel open");
    }

    pub fn on_message(&self, data: &[u8]) {
        if self.mode == RunMode::Receiver {
            self.push.on_packet(data);
        }
    }

    pub fn on_closed(&self) {
        self.push.on_closed("Data channel closed");
    }

    pub fn on_error(&self, message: &str) {
        self.push.on_error(message);
    }
}

/// One direction of a data channel audio stream
pub struct WebRtcTransport {
    mode: RunMode,
    config: StreamConfig,
    channel: Arc<dyn DataChannel>,
    bridge: Arc<dyn AudioBridge>,
    audio_packet_size: usize,
    stats: Arc<PacketStats>,
    push: Arc<PushReceiver>,
    running: Arc<AtomicBool>,
    worker: Option<Worker>,
}

impl WebRtcTransport {
    pub fn new(
        mode: RunMode,
        config: StreamConfig,
        channel: Arc<dyn DataChannel>,
        bridge: Arc<dyn AudioBridge>,
        events: EventSink,
    ) -> Result<Self> {
        config.validate()?;
        let stats = Arc::new(PacketStats::new());
        let running = Arc::new(AtomicBool::new(false));
        let receiver = PacketReceiver::new(&config, 1, bridge.clone(), stats.clone(), events.clone())?;
        let push = Arc::new(PushReceiver::new(receiver, running.clone(), events));
        let audio_packet_size = match mode {
            RunMode::Sender => config.audio.send_payload_size(),
            RunMode::Receiver => config.audio.receive_payload_size(),
        };

        Ok(Self {
            mode,
            config,
            channel,
            bridge,
            audio_packet_size,
            stats,
            push,
            running,
            worker: None,
        })
    }

    /// Callback entry points to register with the channel library
    pub fn handle(&self) -> WebRtcHandle {
        WebRtcHandle {
            mode: self.mode,
            push: self.push.clone(),
        }
    }
}

impl PacketTransport for WebRtcTransport {
    fn run_mode(&self) -> RunMode {
        self.mode
    }

    /// The peer is implied by the channel
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
                let channel = self.channel.clone();
                info!("Starting WebRTC sender");
                Worker::spawn("webrtc-sender", running, move |running| {
                    let mut sender = sender;
                    let mut packet = vec![0u8; sender.packet_size()];
                    let mut warned = false;

                    while running.load(Ordering::Relaxed) {
                        if !channel.is_open() {
                            thread::sleep(poll);
                            continue;
                        }
                        if !sender.next_packet(&mut packet) {
                            continue;
                        }
                        if let Err(e) = channel.send(&packet) {
                            if !warned {
                                warn!(error = %e, "Data channel send failed");
                                warned = true;
                            }
                        }
                    }

                    if channel.is_open() {
                        let stop = control_packet();
                        for _ in 0..2 {
                            let _ = channel.send(&stop);
                        }
                    }
                })?
            }
            RunMode::Receiver => {
                self.push.reset();
                let push = self.push.clone();
                let timing = self.config.timing.clone();
                info!("Starting WebRTC receiver");
                Worker::spawn("webrtc-monitor", running, move |running| {
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
            debug!(mode = %self.mode, "WebRTC transport stopped");
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

impl Drop for WebRtcTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(feature = "webrtc")]
pub mod rtc {
    //! webrtc-rs adapter

    use bytes::Bytes;
    use std::sync::Arc;
    use tokio::runtime::Handle;
    use tracing::debug;
    use webrtc::data_channel::data_channel_message::DataChannelMessage;
    use webrtc::data_channel::data_channel_state::RTCDataChannelState;
    use webrtc::data_channel::RTCDataChannel;

    use super::{DataChannel, WebRtcHandle};

    /// Sends through an `RTCDataChannel` on the given runtime
    pub struct RtcDataChannel {
        dc: Arc<RTCDataChannel>,
        runtime: Handle,
    }

    impl RtcDataChannel {
        pub fn new(dc: Arc<RTCDataChannel>, runtime: Handle) -> Self {
            Self { dc, runtime }
        }
    }

    impl DataChannel for RtcDataChannel {
        fn is_open(&self) -> bool {
            self.dc.ready_state() == RTCDataChannelState::Open
        }

        fn send(&self, data: &[u8]) -> Result<(), String> {
            let dc = self.dc.clone();
            let bytes = Bytes::copy_from_slice(data);
            self.runtime.spawn(async move {
                if let Err(e) = dc.send(&bytes).await {
                    debug!(error = %e, "Data channel send failed");
                }
            });
            Ok(())
        }
    }

    /// Route the channel's callbacks to a transport
    pub fn attach(dc: &Arc<RTCDataChannel>, handle: WebRtcHandle) {
        let on_open = handle.clone();
        dc.on_open(Box::new(move || {
            on_open.on_open();
            Box::pin(async {})
        }));

        let on_message = handle.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            on_message.on_message(&msg.data);
            Box::pin(async {})
        }));

        let on_close = handle.clone();
        dc.on_close(Box::new(move || {
            on_close.on_closed();
            Box::pin(async {})
        }));

        dc.on_error(Box::new(move |err: webrtc::Error| {
            handle.on_error(&err.to_string());
            Box::pin(async {})
        }));
    }
}
