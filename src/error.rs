//! Error types for the audio transport layer

use thiserror::Error;

/// Main error type for the transport layer
#[derive(Error, Debug)]
pub enum Error {
    #[error("Socket bind failed: {0}")]
    SocketBind(String),

    #[error("Invalid peer address: '{0}' is not a valid IP address or host name")]
    InvalidPeerAddress(String),

    #[error("Local and peer settings don't match: {0}")]
    SettingsMismatch(#[from] SettingsMismatch),

    #[error("Local and peer buffer settings are incompatible: {0}")]
    BufferIncompatible(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport not configured: {0}")]
    NotConfigured(&'static str),

    #[error("Transport is already running")]
    AlreadyRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Classify the error so it can travel inside a transport event
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::SocketBind(_) => ErrorKind::SocketBind,
            Error::InvalidPeerAddress(_) => ErrorKind::InvalidPeerAddress,
            Error::SettingsMismatch(_) => ErrorKind::SettingsMismatch,
            Error::BufferIncompatible(_) => ErrorKind::BufferIncompatible,
            Error::Config(_) | Error::NotConfigured(_) | Error::AlreadyRunning => ErrorKind::Config,
            Error::Io(_) => ErrorKind::Io,
        }
    }
}

/// Copyable error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    SocketBind,
    InvalidPeerAddress,
    SettingsMismatch,
    BufferIncompatible,
    Config,
    Io,
}

/// Which negotiated field differed between the local and peer configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettingsMismatch {
    #[error("peer buffer size is {peer} frames, local buffer size is {local} frames")]
    BufferSize { local: u16, peer: u16 },

    #[error("peer sampling rate code is {peer}, local sampling rate code is {local}")]
    SamplingRate { local: u8, peer: u8 },

    #[error("peer bit resolution is {peer} bits, local bit resolution is {local} bits")]
    BitResolution { local: u8, peer: u8 },

    #[error("peer packet is {actual} bytes, header needs {expected}")]
    Truncated { expected: usize, actual: usize },
}

/// Result type alias for the transport layer
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        let err = Error::from(SettingsMismatch::BufferSize { local: 128, peer: 256 });
        assert_eq!(err.kind(), ErrorKind::SettingsMismatch);

        let err = Error::SocketBind("address in use".into());
        assert_eq!(err.kind(), ErrorKind::SocketBind);

        let err = Error::from(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_mismatch_message() {
        let err = Error::from(SettingsMismatch::SamplingRate { local: 3, peer: 2 });
        let msg = err.to_string();
        assert!(msg.contains("sampling rate"));
        assert!(msg.contains("don't match"));
    }
}
