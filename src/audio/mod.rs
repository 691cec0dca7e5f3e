//! Audio-side collaborators of the transport layer

pub mod buffer;
pub mod layout;

pub use buffer::{create_shared_buffer, AudioBridge, RingBuffer, SharedRingBuffer, UnderrunPolicy};
pub use layout::{interleaved_to_planar, planar_to_interleaved};
