//! Send-side packet assembly shared by all bindings

use std::sync::Arc;
use std::time::Duration;

use crate::audio::{interleaved_to_planar, AudioBridge};
use crate::config::StreamConfig;
use crate::error::Result;
use crate::protocol::{build_header, AudioFormat, PacketHeader};

/// Turns audio slots from the bridge into wire packets
pub struct PacketSender {
    header: Box<dyn PacketHeader>,
    format: AudioFormat,
    bridge: Arc<dyn AudioBridge>,
    interleaved: Vec<u8>,
    read_timeout: Duration,
}

impl PacketSender {
    pub fn new(config: &StreamConfig, bridge: Arc<dyn AudioBridge>) -> Result<Self> {
        let header = build_header(config.network.header, &config.audio)?;
        Ok(Self {
            header,
            format: config.audio,
            bridge,
            interleaved: vec![0u8; config.audio.send_payload_size()],
            read_timeout: config.timing.sender_read_timeout(),
        })
    }

    /// Header plus payload
    pub fn packet_size(&self) -> usize {
        self.header.header_size() + self.interleaved.len()
    }

    pub fn header_size(&self) -> usize {
        self.header.header_size()
    }

    /// Sequence number the next packet will carry
    pub fn sequence_number(&self) -> u16 {
        self.header.sequence_number()
    }

    /// Read one slot from the bridge and write header and channel-major
    /// payload into `packet`.
    ///
    /// Returns `false` if the bridge had nothing within the read timeout;
    /// `packet` is left untouched and the sequence number does not move.
    pub fn next_packet(&mut self, packet: &mut [u8]) -> bool {
        if !self.bridge.read_audio_buffer(&mut self.interleaved, self.read_timeout) {
            return false;
        }

        let header_size = self.header.header_size();
        self.header.write_header(packet);
        interleaved_to_planar(
            &self.interleaved,
            &mut packet[header_size..header_size + self.interleaved.len()],
            self.format.input_channels as usize,
            self.format.buffer_size as usize,
            self.format.bytes_per_sample(),
        );
        self.header.increase_sequence_number();
        true
    }
}
