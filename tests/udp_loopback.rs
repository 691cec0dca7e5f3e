//! End-to-end stream over the loopback interface

use std::sync::Arc;
use std::time::{Duration, Instant};

use tripstream::{
    audio::RingBuffer,
    config::StreamConfig,
    network::{EventSink, PacketTransport, SocketBinder, TransportEvent, UdpTransport},
    protocol::RunMode,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn config() -> StreamConfig {
    let mut config = StreamConfig::default();
    config.audio.buffer_size = 32;
    config.network.bind_port = 0;
    config.network.redundancy = 2;
    config.timing.sender_read_timeout_ms = 5;
    config
}

fn wait_for_event(
    rx: &crossbeam_channel::Receiver<TransportEvent>,
    wanted: &TransportEvent,
) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match rx.recv_timeout(left) {
            Ok(event) if &event == wanted => return true,
            Ok(_) => continue,
            Err(_) => return false,
        }
    }
    false
}

#[test]
fn test_udp_stream_end_to_end() {
    let binder = Arc::new(SocketBinder::new());

    let rx_config = config();
    let rx_bridge = Arc::new(RingBuffer::new(rx_config.audio.receive_payload_size(), 16));
    let (rx_events, rx_event_rx) = EventSink::channel("receiver");
    let mut receiver = UdpTransport::new(
        RunMode::Receiver,
        rx_config,
        binder.clone(),
        rx_bridge.clone(),
        rx_events,
    )
    .unwrap();
    receiver.start().unwrap();
    let port = receiver.local_addr().unwrap().port();

    let mut tx_config = config();
    tx_config.network.peer_port = port;
    let slot_size = tx_config.audio.send_payload_size();
    let tx_bridge = Arc::new(RingBuffer::new(slot_size, 16));
    let mut sender = UdpTransport::new(
        RunMode::Sender,
        tx_config,
        binder,
        tx_bridge.clone(),
        EventSink::detached("sender"),
    )
    .unwrap();
    sender.set_peer_address("127.0.0.1").unwrap();
    sender.start().unwrap();

    let sent: Vec<Vec<u8>> = (0..3u8)
        .map(|i| (0..slot_size).map(|b| (b as u8).wrapping_mul(i + 1)).collect())
        .collect();
    for slot in &sent {
        assert!(tx_bridge.insert_slot(slot));
    }

    assert!(wait_for_event(&rx_event_rx, &TransportEvent::PeerConnected));

    let deadline = Instant::now() + TIMEOUT;
    while rx_bridge.len() < sent.len() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }

    let mut received = vec![0u8; slot_size];
    for slot in &sent {
        assert!(rx_bridge.read_slot_blocking(&mut received, Duration::ZERO));
        assert_eq!(&received, slot);
    }

    sender.stop();
    assert!(wait_for_event(
        &rx_event_rx,
        &TransportEvent::CeaseTransmission("Peer Stopped".into())
    ));

    let stats = receiver.stats().unwrap();
    assert_eq!(stats.tot, 3);
    receiver.stop();
    assert!(!receiver.is_running());
}

#[test]
fn test_foreign_datagram_stops_receiver() {
    let config = config();
    let bridge = Arc::new(RingBuffer::new(config.audio.receive_payload_size(), 4));
    let (events, event_rx) = EventSink::channel("receiver");
    let mut receiver = UdpTransport::new(
        RunMode::Receiver,
        config,
        Arc::new(SocketBinder::new()),
        bridge.clone(),
        events,
    )
    .unwrap();
    receiver.start().unwrap();
    let port = receiver.local_addr().unwrap().port();

    let stranger = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    stranger.send_to(b"hello", ("127.0.0.1", port)).unwrap();

    let event = event_rx.recv_timeout(TIMEOUT).unwrap();
    assert!(matches!(event, TransportEvent::Error { .. }));

    let deadline = Instant::now() + TIMEOUT;
    while receiver.is_running() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(!receiver.is_running());
    assert!(bridge.is_empty());
}
