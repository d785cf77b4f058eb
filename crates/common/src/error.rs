//! Common error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The device was unplugged; terminal for every handle on it
    #[error("Device is gone")]
    DeviceGone,

    /// The surface's wireless link is asleep or out of range
    #[error("Device is offline")]
    Offline,

    /// Non-blocking call found nothing to do
    #[error("Operation would block")]
    WouldBlock,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Exclusive open already held by another opener
    #[error("Device busy")]
    Busy,

    #[error("No such device: minor {0}")]
    NoSuchDevice(u32),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True when the device can no longer serve reads or writes right now,
    /// as opposed to simply having no data yet
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Error::DeviceGone | Error::Offline)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_classification() {
        assert!(Error::DeviceGone.is_unavailable());
        assert!(Error::Offline.is_unavailable());
        assert!(!Error::WouldBlock.is_unavailable());
        assert!(!Error::InvalidArgument("x".into()).is_unavailable());
    }

    #[test]
    fn test_protocol_error_conversion() {
        let err: Error = protocol::ProtocolError::InvalidFrameLength { len: 3 }.into();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(err.to_string().contains("3 bytes"));
    }
}
