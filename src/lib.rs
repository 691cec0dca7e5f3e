//! # tripstream
//!
//! Low-latency multichannel audio transport between two network endpoints.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────────────────────── SENDER ─────────────────────────────┐
//! │  Audio thread ──► RingBuffer ──► PacketSender                     │
//! │                                   │ interleaved → channel-major   │
//! │                                   │ header || payload             │
//! │                                   ▼                               │
//! │                           RedundancyWindow (R slots, newest first)│
//! │                                   │                               │
//! │          ┌──────────────┬─────────┴────┬──────────────────┐       │
//! │          ▼              ▼              ▼                  ▼       │
//! │         UDP           ICMP          WebRTC          WebTransport  │
//! └──────────┼──────────────┼──────────────┼──────────────────┼───────┘
//!            │              │              │                  │
//! ┌──────────┼──────────────┼──────────────┼──────────────────┼───────┐
//! │          ▼              ▼              ▼                  ▼       │
//! │     poll loop      poll loop     onMessage cb       datagram cb   │
//! │          └──────────────┴──────┬───────┴──────────────────┘       │
//! │                                ▼                                  │
//! │                         PacketReceiver                            │
//! │          sentinel check · peer negotiation · ReorderEngine        │
//! │                                │ gap + payloads, oldest first     │
//! │                                ▼                                  │
//! │              RingBuffer ──► Audio thread                          │
//! └──────────────────────────── RECEIVER ─────────────────────────────┘
//! ```
//!
//! Each role runs on its own thread. Notifications (peer connected,
//! waiting too long, cease transmission, errors) travel to the owner over
//! a channel of [`network::TransportEvent`]s.

pub mod audio;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;

pub use error::{Error, ErrorKind, Result};

/// Application-wide constants
pub mod constants {
    /// Default buffer size in frames
    pub const DEFAULT_BUFFER_SIZE: u16 = 128;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u8 = 2;

    /// Default UDP port for audio streaming
    pub const DEFAULT_PORT: u16 = 4464;

    /// Default redundancy factor (no redundancy)
    pub const DEFAULT_REDUNDANCY: u8 = 1;

    /// How long a receiver blocks on the socket before re-checking its stop flag
    pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 10;

    /// Interval between "waiting too long" notifications
    pub const DEFAULT_WAIT_REPORT_MS: u64 = 30_000;

    /// Silence after which the peer is reported as probably gone
    pub const DEFAULT_PEER_GONE_MS: u64 = 60_000;

    /// Consecutive out-of-order packets tolerated before resynchronizing
    pub const DEFAULT_OUT_OF_ORDER_RESET: u32 = 5;

    /// Largest sequence gap still treated as loss rather than disorder
    pub const DEFAULT_MAX_SEQUENCE_GAP: u16 = 1000;

    /// How long the sender waits on the ring buffer before re-checking its stop flag
    pub const DEFAULT_SENDER_READ_TIMEOUT_MS: u64 = 200;

    /// Number of pre-allocated WebTransport send buffers
    pub const DEFAULT_SEND_POOL_SIZE: usize = 32;

    /// Maximum UDP datagram payload
    pub const MAX_DATAGRAM_SIZE: usize = 65_507;

    /// Default ring buffer depth in slots
    pub const RING_BUFFER_SLOTS: usize = 16;
}
