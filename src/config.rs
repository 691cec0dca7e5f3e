//! Stream configuration
//!
//! One [`StreamConfig`] is handed to every transport at construction.
//! It is plain data, loadable from TOML:
//!
//! ```toml
//! [audio]
//! buffer_size = 128
//! sampling_rate = 48000
//! bit_resolution = 16
//! input_channels = 2
//! output_channels = 2
//!
//! [network]
//! bind_port = 4464
//! peer_port = 4464
//! redundancy = 2
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};
use crate::network::RecoveryMode;
use crate::protocol::{AudioFormat, HeaderType};

/// Complete configuration of one stream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub audio: AudioFormat,
    pub network: NetworkConfig,
    pub timing: TimingConfig,
}

/// Socket and packet framing settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Local port to bind (0 lets the OS pick)
    pub bind_port: u16,
    /// Port the peer receives on
    pub peer_port: u16,
    /// Number of consecutive transmissions that carry each packet
    pub redundancy: u8,
    pub header: HeaderType,
    /// Echo identifier that tags this stream's ICMP packets
    pub icmp_identifier: u16,
    /// Pre-allocated WebTransport send buffers
    pub send_pool_size: usize,
    /// How far back the receiver looks when a loss run outlasts the redundancy
    pub recovery: RecoveryMode,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_port: DEFAULT_PORT,
            peer_port: DEFAULT_PORT,
            redundancy: DEFAULT_REDUNDANCY,
            header: HeaderType::Default,
            icmp_identifier: 0x4A54,
            send_pool_size: DEFAULT_SEND_POOL_SIZE,
            recovery: RecoveryMode::Partial,
        }
    }
}

/// Timeouts and thresholds of the receive algorithm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub poll_timeout_ms: u64,
    pub wait_report_ms: u64,
    pub peer_gone_ms: u64,
    pub out_of_order_reset: u32,
    pub max_sequence_gap: u16,
    pub sender_read_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            wait_report_ms: DEFAULT_WAIT_REPORT_MS,
            peer_gone_ms: DEFAULT_PEER_GONE_MS,
            out_of_order_reset: DEFAULT_OUT_OF_ORDER_RESET,
            max_sequence_gap: DEFAULT_MAX_SEQUENCE_GAP,
            sender_read_timeout_ms: DEFAULT_SENDER_READ_TIMEOUT_MS,
        }
    }
}

impl TimingConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn wait_report_interval(&self) -> Duration {
        Duration::from_millis(self.wait_report_ms)
    }

    pub fn peer_gone_after(&self) -> Duration {
        Duration::from_millis(self.peer_gone_ms)
    }

    pub fn sender_read_timeout(&self) -> Duration {
        Duration::from_millis(self.sender_read_timeout_ms)
    }
}

impl StreamConfig {
    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: StreamConfig = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load the configuration file at `path`, or defaults if it doesn't exist
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write the configuration as TOML, creating parent directories
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Per-user configuration file location
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "tripstream", "tripstream")
            .map(|dirs| dirs.config_dir().join("stream.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        self.audio.validate()?;
        if self.network.redundancy == 0 {
            return Err(Error::Config("redundancy factor must be at least 1".into()));
        }
        if self.network.send_pool_size == 0 {
            return Err(Error::Config("send pool needs at least one buffer".into()));
        }
        if self.timing.poll_timeout_ms == 0 {
            return Err(Error::Config("poll timeout must be non-zero".into()));
        }
        if self.network.header == HeaderType::JamLink {
            crate::protocol::JamLinkHeader::new(&self.audio)?;
        }

        let header_size = crate::protocol::build_header(self.network.header, &self.audio)?
            .header_size();
        let datagram = (header_size + self.audio.send_payload_size())
            * self.network.redundancy as usize;
        if datagram > MAX_DATAGRAM_SIZE {
            return Err(Error::Config(format!(
                "redundant packet of {} bytes exceeds the maximum datagram size",
                datagram
            )));
        }
        Ok(())
    }

    /// Bytes of one full packet (header + payload) as sent by this side
    pub fn send_packet_size(&self) -> Result<usize> {
        let header = crate::protocol::build_header(self.network.header, &self.audio)?;
        Ok(header.header_size() + self.audio.send_payload_size())
    }
}
