//! Lifecycle notifications from a transport to its owner

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::{Error, ErrorKind};

/// Something the owner of a transport may need to react to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The first valid packet from the peer arrived
    PeerConnected,
    /// No packet for this long; repeats at every reporting interval
    WaitingTooLong(Duration),
    /// Silence crossed the peer-gone threshold; sent once per silent period
    PeerGone(Duration),
    /// The stream ended gracefully
    CeaseTransmission(String),
    /// A fatal condition stopped the role's loop
    Error { kind: ErrorKind, message: String },
}

/// Sending half of a transport's event channel.
///
/// Every event is also logged. A sink without a channel only logs.
#[derive(Clone)]
pub struct EventSink {
    tx: Option<Sender<TransportEvent>>,
    source: &'static str,
}

impl EventSink {
    /// Create a sink and the receiver its events arrive on
    pub fn channel(source: &'static str) -> (Self, Receiver<TransportEvent>) {
        let (tx, rx) = unbounded();
        (Self { tx: Some(tx), source }, rx)
    }

    pub fn new(tx: Sender<TransportEvent>, source: &'static str) -> Self {
        Self { tx: Some(tx), source }
    }

    /// A sink that only logs
    pub fn detached(source: &'static str) -> Self {
        Self { tx: None, source }
    }

    pub fn emit(&self, event: TransportEvent) {
        match &event {
            TransportEvent::PeerConnected => {
                info!(source = self.source, "Received connection from peer")
            }
            TransportEvent::WaitingTooLong(waited) => warn!(
                source = self.source,
                waited_ms = waited.as_millis() as u64,
                "Waiting too long for data from peer"
            ),
            TransportEvent::PeerGone(waited) => warn!(
                source = self.source,
                waited_ms = waited.as_millis() as u64,
                "Peer has probably gone away"
            ),
            TransportEvent::CeaseTransmission(reason) => {
                info!(source = self.source, reason = %reason, "Ceasing transmission")
            }
            TransportEvent::Error { kind, message } => {
                error!(source = self.source, ?kind, "{}", message)
            }
        }

        if let Some(tx) = &self.tx {
            // The owner may have dropped its receiver during teardown
            let _ = tx.send(event);
        }
    }

    pub fn peer_connected(&self) {
        self.emit(TransportEvent::PeerConnected);
    }

    pub fn cease(&self, reason: impl Into<String>) {
        self.emit(TransportEvent::CeaseTransmission(reason.into()));
    }

    pub fn error(&self, err: &Error) {
        self.emit(TransportEvent::Error {
            kind: err.kind(),
            message: err.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_arrive_in_order() {
        let (sink, rx) = EventSink::channel("test");
        sink.peer_connected();
        sink.emit(TransportEvent::WaitingTooLong(Duration::from_secs(30)));
        sink.cease("Peer Stopped");

        assert_eq!(rx.try_recv().unwrap(), TransportEvent::PeerConnected);
        assert!(matches!(rx.try_recv().unwrap(), TransportEvent::WaitingTooLong(_)));
        assert_eq!(
            rx.try_recv().unwrap(),
            TransportEvent::CeaseTransmission("Peer Stopped".into())
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_error_carries_kind() {
        let (sink, rx) = EventSink::channel("test");
        sink.error(&Error::BufferIncompatible("slot size".into()));
        match rx.try_recv().unwrap() {
            TransportEvent::Error { kind, message } => {
                assert_eq!(kind, ErrorKind::BufferIncompatible);
                assert!(message.contains("incompatible"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_dropped_receiver_is_harmless() {
        let (sink, rx) = EventSink::channel("test");
        drop(rx);
        sink.peer_connected();
        EventSink::detached("test").cease("done");
    }
}
