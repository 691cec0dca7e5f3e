//! Packet header codec
//!
//! Every packet starts with a fixed-size header followed by the
//! channel-major audio payload. Three header layouts exist:
//!
//! ```text
//! Default (16 bytes)                 JamLink (8 bytes)       Empty (0 bytes)
//! ┌────────┬──────┬─────────────────┐ ┌────────┬────────┐
//! │ 0  u64 │ timestamp_usec         │ │ 0  u16 │ common │
//! │ 8  u16 │ sequence_number        │ │ 2  u16 │ seq    │
//! │ 10 u16 │ buffer_size (frames)   │ │ 4  u32 │ time   │
//! │ 12 u8  │ sampling_rate code     │ └────────┴────────┘
//! │ 13 u8  │ bit resolution (bits)  │
//! │ 14 u8  │ input channels         │
//! │ 15 u8  │ output channels        │
//! └────────┴────────────────────────┘
//! ```
//!
//! Multi-byte fields are little-endian.

use serde::{Deserialize, Serialize};

use super::{usec_time, AudioFormat, SamplingRate};
use crate::error::{Error, SettingsMismatch};

/// Size of the default header in bytes
pub const DEFAULT_HEADER_SIZE: usize = 16;

/// Size of the JamLink header in bytes
pub const JAMLINK_HEADER_SIZE: usize = 8;

/// Header layout selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderType {
    #[default]
    Default,
    JamLink,
    Empty,
}

/// Decoded header metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderFields {
    pub timestamp_usec: u64,
    pub sequence_number: u16,
    pub buffer_size: u16,
    pub sampling_rate_code: u8,
    pub bit_resolution: u8,
    pub input_channels: u8,
    pub output_channels: u8,
}

impl HeaderFields {
    /// Metadata describing `format`, with zeroed timestamp and sequence
    pub fn from_format(format: &AudioFormat) -> Self {
        Self {
            timestamp_usec: 0,
            sequence_number: 0,
            buffer_size: format.buffer_size,
            sampling_rate_code: format.sampling_rate.code(),
            bit_resolution: format.bit_resolution.bits(),
            input_channels: format.input_channels,
            output_channels: format.output_channels,
        }
    }

    /// Compare the negotiated fields of a peer header against ours
    pub fn check_against(&self, peer: &HeaderFields) -> Result<(), SettingsMismatch> {
        if peer.buffer_size != self.buffer_size {
            return Err(SettingsMismatch::BufferSize {
                local: self.buffer_size,
                peer: peer.buffer_size,
            });
        }
        if peer.sampling_rate_code != self.sampling_rate_code {
            return Err(SettingsMismatch::SamplingRate {
                local: self.sampling_rate_code,
                peer: peer.sampling_rate_code,
            });
        }
        if peer.bit_resolution != self.bit_resolution {
            return Err(SettingsMismatch::BitResolution {
                local: self.bit_resolution,
                peer: peer.bit_resolution,
            });
        }
        Ok(())
    }

    /// Human-readable dump for logs
    pub fn describe(&self) -> String {
        let rate = SamplingRate::from_code(self.sampling_rate_code)
            .map(|r| format!("{} Hz", r.hz()))
            .unwrap_or_else(|| format!("code {}", self.sampling_rate_code));
        format!(
            "buffer {} frames, {}, {} bits, {} in / {} out channels, seq {}, ts {}",
            self.buffer_size,
            rate,
            self.bit_resolution,
            self.input_channels,
            self.output_channels,
            self.sequence_number,
            self.timestamp_usec
        )
    }
}

/// Produce and parse packet headers.
///
/// The sequence number is advanced separately from encoding so a header
/// that was already written can be reused for redundant copies.
pub trait PacketHeader: Send + Sync {
    fn header_type(&self) -> HeaderType;

    fn header_size(&self) -> usize;

    /// Metadata the next outgoing header will carry
    fn local_fields(&self) -> HeaderFields;

    /// Byte-for-byte dump of `fields` into `dst[..header_size()]`
    fn encode(&self, fields: &HeaderFields, dst: &mut [u8]);

    /// Parse the header at the front of `packet`.
    ///
    /// Returns `None` if the packet is too short or the layout carries no
    /// metadata.
    fn decode(&self, packet: &[u8]) -> Option<HeaderFields>;

    /// Set the timestamp the next header will carry
    fn stamp(&mut self, timestamp_usec: u64);

    fn increase_sequence_number(&mut self);

    fn sequence_number(&self) -> u16;

    /// Stamp the current time and write the header into `packet`
    fn write_header(&mut self, packet: &mut [u8]) {
        self.stamp(usec_time());
        let fields = self.local_fields();
        self.encode(&fields, packet);
    }

    /// Verify that a peer's packet was produced with our audio settings
    fn check_peer_settings(&self, packet: &[u8]) -> Result<(), SettingsMismatch> {
        if self.header_size() == 0 {
            return Ok(());
        }
        let peer = self.decode(packet).ok_or(SettingsMismatch::Truncated {
            expected: self.header_size(),
            actual: packet.len(),
        })?;
        self.local_fields().check_against(&peer)
    }

    fn peer_sequence_number(&self, packet: &[u8]) -> Option<u16> {
        self.decode(packet).map(|f| f.sequence_number)
    }
}

/// Construct the header selected by `header_type` for `format`
pub fn build_header(
    header_type: HeaderType,
    format: &AudioFormat,
) -> Result<Box<dyn PacketHeader>, Error> {
    Ok(match header_type {
        HeaderType::Default => Box::new(DefaultHeader::new(format)),
        HeaderType::JamLink => Box::new(JamLinkHeader::new(format)?),
        HeaderType::Empty => Box::new(EmptyHeader::new(format)),
    })
}

// ─── Default header ────────────────────────────────────────────────────────

/// Full metadata header used between two instances of this crate
#[derive(Debug, Clone)]
pub struct DefaultHeader {
    fields: HeaderFields,
}

impl DefaultHeader {
    pub fn new(format: &AudioFormat) -> Self {
        Self {
            fields: HeaderFields::from_format(format),
        }
    }

    pub fn to_bytes(fields: &HeaderFields) -> [u8; DEFAULT_HEADER_SIZE] {
        let mut bytes = [0u8; DEFAULT_HEADER_SIZE];
        bytes[0..8].copy_from_slice(&fields.timestamp_usec.to_le_bytes());
        bytes[8..10].copy_from_slice(&fields.sequence_number.to_le_bytes());
        bytes[10..12].copy_from_slice(&fields.buffer_size.to_le_bytes());
        bytes[12] = fields.sampling_rate_code;
        bytes[13] = fields.bit_resolution;
        bytes[14] = fields.input_channels;
        bytes[15] = fields.output_channels;
        bytes
    }

    pub fn from_bytes(bytes: &[u8; DEFAULT_HEADER_SIZE]) -> HeaderFields {
        HeaderFields {
            timestamp_usec: u64::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ]),
            sequence_number: u16::from_le_bytes([bytes[8], bytes[9]]),
            buffer_size: u16::from_le_bytes([bytes[10], bytes[11]]),
            sampling_rate_code: bytes[12],
            bit_resolution: bytes[13],
            input_channels: bytes[14],
            output_channels: bytes[15],
        }
    }
}

impl PacketHeader for DefaultHeader {
    fn header_type(&self) -> HeaderType {
        HeaderType::Default
    }

    fn header_size(&self) -> usize {
        DEFAULT_HEADER_SIZE
    }

    fn local_fields(&self) -> HeaderFields {
        self.fields
    }

    fn encode(&self, fields: &HeaderFields, dst: &mut [u8]) {
        dst[..DEFAULT_HEADER_SIZE].copy_from_slice(&Self::to_bytes(fields));
    }

    fn decode(&self, packet: &[u8]) -> Option<HeaderFields> {
        let bytes: &[u8; DEFAULT_HEADER_SIZE] = packet.get(..DEFAULT_HEADER_SIZE)?.try_into().ok()?;
        Some(Self::from_bytes(bytes))
    }

    fn stamp(&mut self, timestamp_usec: u64) {
        self.fields.timestamp_usec = timestamp_usec;
    }

    fn increase_sequence_number(&mut self) {
        self.fields.sequence_number = self.fields.sequence_number.wrapping_add(1);
    }

    fn sequence_number(&self) -> u16 {
        self.fields.sequence_number
    }
}

// ─── JamLink header ────────────────────────────────────────────────────────

// Stream-type word bits
const ETX_XTND: u16 = 1 << 14;
const ETX_STEREO: u16 = 1 << 13;
const ETX_NOT_16BIT: u16 = 1 << 12;
const ETX_RATE_SHIFT: u16 = 9;
const ETX_RATE_MASK: u16 = 0x7 << ETX_RATE_SHIFT;
const ETX_SPP_MASK: u16 = 0x01FF;

/// JamLink only interoperates at this buffer size
pub const JAMLINK_BUFFER_SIZE: u16 = 64;

/// Sampling rate for each of the eight JamLink rate codes
const JAMLINK_RATES_HZ: [u32; 8] = [48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 11_025, 8_000];

/// Header code for a rate this crate has no [`SamplingRate`] for
pub const UNDEFINED_RATE_CODE: u8 = 7;

fn jamlink_rate_bits(rate: SamplingRate) -> Option<u16> {
    let code = JAMLINK_RATES_HZ.iter().position(|&hz| hz == rate.hz())?;
    Some((code as u16) << ETX_RATE_SHIFT)
}

/// Rate in Hz carried by a JamLink stream-type word
pub fn jamlink_rate_hz(word: u16) -> u32 {
    JAMLINK_RATES_HZ[((word & ETX_RATE_MASK) >> ETX_RATE_SHIFT) as usize]
}

fn jamlink_rate_code(word: u16) -> u8 {
    SamplingRate::try_from(jamlink_rate_hz(word))
        .map(SamplingRate::code)
        .unwrap_or(UNDEFINED_RATE_CODE)
}

/// Minimal header spoken by JamLink hardware: mono, 16-bit, 48 kHz, 64 frames
#[derive(Debug, Clone)]
pub struct JamLinkHeader {
    common: u16,
    sequence_number: u16,
    timestamp: u32,
}

impl JamLinkHeader {
    pub fn new(format: &AudioFormat) -> Result<Self, Error> {
        if format.input_channels != 1 {
            return Err(Error::Config(
                "JamLink only supports one channel".into(),
            ));
        }
        if format.sampling_rate != SamplingRate::Sr48000 {
            return Err(Error::Config("JamLink only supports 48 kHz".into()));
        }
        if format.buffer_size != JAMLINK_BUFFER_SIZE {
            return Err(Error::Config(format!(
                "JamLink only supports a buffer size of {} frames",
                JAMLINK_BUFFER_SIZE
            )));
        }
        if format.bit_resolution.bits() != 16 {
            return Err(Error::Config("JamLink only supports 16-bit audio".into()));
        }

        let rate_bits = jamlink_rate_bits(format.sampling_rate).unwrap_or(0);
        Ok(Self {
            common: ETX_XTND | rate_bits | JAMLINK_BUFFER_SIZE,
            sequence_number: 0,
            timestamp: 0,
        })
    }

    /// Raw stream-type word
    pub fn common(&self) -> u16 {
        self.common
    }
}

impl PacketHeader for JamLinkHeader {
    fn header_type(&self) -> HeaderType {
        HeaderType::JamLink
    }

    fn header_size(&self) -> usize {
        JAMLINK_HEADER_SIZE
    }

    fn local_fields(&self) -> HeaderFields {
        let channels = if self.common & ETX_STEREO != 0 { 2 } else { 1 };
        HeaderFields {
            timestamp_usec: self.timestamp as u64,
            sequence_number: self.sequence_number,
            buffer_size: self.common & ETX_SPP_MASK,
            sampling_rate_code: jamlink_rate_code(self.common),
            bit_resolution: 16,
            input_channels: channels,
            output_channels: channels,
        }
    }

    fn encode(&self, fields: &HeaderFields, dst: &mut [u8]) {
        let mut common = self.common & !(ETX_SPP_MASK | ETX_STEREO);
        common |= fields.buffer_size & ETX_SPP_MASK;
        if fields.input_channels == 2 {
            common |= ETX_STEREO;
        }
        dst[0..2].copy_from_slice(&common.to_le_bytes());
        dst[2..4].copy_from_slice(&fields.sequence_number.to_le_bytes());
        dst[4..8].copy_from_slice(&(fields.timestamp_usec as u32).to_le_bytes());
    }

    fn decode(&self, packet: &[u8]) -> Option<HeaderFields> {
        let bytes = packet.get(..JAMLINK_HEADER_SIZE)?;
        let common = u16::from_le_bytes([bytes[0], bytes[1]]);
        let channels = if common & ETX_STEREO != 0 { 2 } else { 1 };
        Some(HeaderFields {
            timestamp_usec: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as u64,
            sequence_number: u16::from_le_bytes([bytes[2], bytes[3]]),
            buffer_size: common & ETX_SPP_MASK,
            sampling_rate_code: jamlink_rate_code(common),
            bit_resolution: if common & ETX_NOT_16BIT != 0 { 0 } else { 16 },
            input_channels: channels,
            output_channels: channels,
        })
    }

    fn stamp(&mut self, timestamp_usec: u64) {
        self.timestamp = timestamp_usec as u32;
    }

    fn increase_sequence_number(&mut self) {
        self.sequence_number = self.sequence_number.wrapping_add(1);
    }

    fn sequence_number(&self) -> u16 {
        self.sequence_number
    }
}

// ─── Empty header ──────────────────────────────────────────────────────────

/// No header at all, for peers that send raw audio
#[derive(Debug, Clone)]
pub struct EmptyHeader {
    fields: HeaderFields,
}

impl EmptyHeader {
    pub fn new(format: &AudioFormat) -> Self {
        Self {
            fields: HeaderFields::from_format(format),
        }
    }
}

impl PacketHeader for EmptyHeader {
    fn header_type(&self) -> HeaderType {
        HeaderType::Empty
    }

    fn header_size(&self) -> usize {
        0
    }

    fn local_fields(&self) -> HeaderFields {
        self.fields
    }

    fn encode(&self, _fields: &HeaderFields, _dst: &mut [u8]) {}

    fn decode(&self, _packet: &[u8]) -> Option<HeaderFields> {
        None
    }

    fn stamp(&mut self, _timestamp_usec: u64) {}

    fn increase_sequence_number(&mut self) {}

    fn sequence_number(&self) -> u16 {
        0
    }
}
