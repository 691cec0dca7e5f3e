//! Wire protocol definitions
//!
//! Audio format metadata carried in every packet header, the role a
//! transport plays in a stream, and the in-band control sentinel.

pub mod header;
pub mod sequence;

pub use header::{
    build_header, DefaultHeader, EmptyHeader, HeaderFields, HeaderType, JamLinkHeader,
    PacketHeader,
};
pub use sequence::{sequence_delta, SequenceCheck};

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Error;

/// Size of the graceful-shutdown control packet
pub const CONTROL_PACKET_SIZE: usize = 63;

/// Byte value every position of the control packet carries
pub const CONTROL_PACKET_BYTE: u8 = 0xFF;

/// Whether a transport instance sends or receives packets.
///
/// Fixed at construction; a full-duplex stream uses one instance of each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Sender,
    Receiver,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Sender => write!(f, "sender"),
            RunMode::Receiver => write!(f, "receiver"),
        }
    }
}

/// Sampling rates with their on-wire enum codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum SamplingRate {
    Sr22050,
    Sr32000,
    Sr44100,
    Sr48000,
    Sr88200,
    Sr96000,
    Sr192000,
}

impl SamplingRate {
    /// Code written into the header
    pub fn code(self) -> u8 {
        match self {
            SamplingRate::Sr22050 => 0,
            SamplingRate::Sr32000 => 1,
            SamplingRate::Sr44100 => 2,
            SamplingRate::Sr48000 => 3,
            SamplingRate::Sr88200 => 4,
            SamplingRate::Sr96000 => 5,
            SamplingRate::Sr192000 => 6,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(SamplingRate::Sr22050),
            1 => Some(SamplingRate::Sr32000),
            2 => Some(SamplingRate::Sr44100),
            3 => Some(SamplingRate::Sr48000),
            4 => Some(SamplingRate::Sr88200),
            5 => Some(SamplingRate::Sr96000),
            6 => Some(SamplingRate::Sr192000),
            _ => None,
        }
    }

    /// Rate in Hz
    pub fn hz(self) -> u32 {
        match self {
            SamplingRate::Sr22050 => 22_050,
            SamplingRate::Sr32000 => 32_000,
            SamplingRate::Sr44100 => 44_100,
            SamplingRate::Sr48000 => 48_000,
            SamplingRate::Sr88200 => 88_200,
            SamplingRate::Sr96000 => 96_000,
            SamplingRate::Sr192000 => 192_000,
        }
    }
}

impl TryFrom<u32> for SamplingRate {
    type Error = String;

    fn try_from(hz: u32) -> Result<Self, Self::Error> {
        match hz {
            22_050 => Ok(SamplingRate::Sr22050),
            32_000 => Ok(SamplingRate::Sr32000),
            44_100 => Ok(SamplingRate::Sr44100),
            48_000 => Ok(SamplingRate::Sr48000),
            88_200 => Ok(SamplingRate::Sr88200),
            96_000 => Ok(SamplingRate::Sr96000),
            192_000 => Ok(SamplingRate::Sr192000),
            other => Err(format!("unsupported sampling rate: {} Hz", other)),
        }
    }
}

impl From<SamplingRate> for u32 {
    fn from(rate: SamplingRate) -> Self {
        rate.hz()
    }
}

/// Sample bit depth; the header carries the bit count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum BitResolution {
    Bit8,
    Bit16,
    Bit24,
    Bit32,
}

impl BitResolution {
    pub fn bits(self) -> u8 {
        match self {
            BitResolution::Bit8 => 8,
            BitResolution::Bit16 => 16,
            BitResolution::Bit24 => 24,
            BitResolution::Bit32 => 32,
        }
    }

    pub fn bytes_per_sample(self) -> usize {
        self.bits() as usize / 8
    }
}

impl TryFrom<u8> for BitResolution {
    type Error = String;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        match bits {
            8 => Ok(BitResolution::Bit8),
            16 => Ok(BitResolution::Bit16),
            24 => Ok(BitResolution::Bit24),
            32 => Ok(BitResolution::Bit32),
            other => Err(format!("unsupported bit resolution: {} bits", other)),
        }
    }
}

impl From<BitResolution> for u8 {
    fn from(res: BitResolution) -> Self {
        res.bits()
    }
}

/// Locally configured audio format; the peer must agree on it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioFormat {
    /// Frames per packet
    pub buffer_size: u16,
    pub sampling_rate: SamplingRate,
    pub bit_resolution: BitResolution,
    /// Channels read from the audio thread and sent to the network
    pub input_channels: u8,
    /// Channels received from the network and played back
    pub output_channels: u8,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            buffer_size: crate::constants::DEFAULT_BUFFER_SIZE,
            sampling_rate: SamplingRate::Sr48000,
            bit_resolution: BitResolution::Bit16,
            input_channels: crate::constants::DEFAULT_CHANNELS,
            output_channels: crate::constants::DEFAULT_CHANNELS,
        }
    }
}

impl AudioFormat {
    pub fn bytes_per_sample(&self) -> usize {
        self.bit_resolution.bytes_per_sample()
    }

    /// Bytes of one frame-buffer for `channels` channels
    pub fn payload_size(&self, channels: u8) -> usize {
        self.buffer_size as usize * channels as usize * self.bytes_per_sample()
    }

    /// Payload the sender reads from the audio thread each tick
    pub fn send_payload_size(&self) -> usize {
        self.payload_size(self.input_channels)
    }

    /// Payload the receiver hands to the audio thread each tick
    pub fn receive_payload_size(&self) -> usize {
        self.payload_size(self.output_channels)
    }

    /// Duration of one packet of audio
    pub fn period(&self) -> std::time::Duration {
        std::time::Duration::from_micros(
            self.buffer_size as u64 * 1_000_000 / self.sampling_rate.hz() as u64,
        )
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.buffer_size == 0 {
            return Err(Error::Config("buffer size must be at least one frame".into()));
        }
        if self.input_channels == 0 && self.output_channels == 0 {
            return Err(Error::Config("at least one channel is required".into()));
        }
        Ok(())
    }
}

/// Check whether `data` is the graceful-shutdown control packet
pub fn is_control_packet(data: &[u8]) -> bool {
    data.len() == CONTROL_PACKET_SIZE && data.iter().all(|&b| b == CONTROL_PACKET_BYTE)
}

/// The graceful-shutdown control packet
pub fn control_packet() -> [u8; CONTROL_PACKET_SIZE] {
    [CONTROL_PACKET_BYTE; CONTROL_PACKET_SIZE]
}

/// Microseconds since the Unix epoch
pub fn usec_time() -> u64 {
    chrono::Utc::now().timestamp_micros().max(0) as u64
}
