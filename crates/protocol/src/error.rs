//! Protocol error types

use thiserror::Error;

/// Errors raised while building or parsing Tranzport frames
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A frame must be exactly eight bytes long
    #[error("Invalid frame length: {len} bytes (expected 8)")]
    InvalidFrameLength { len: usize },

    /// A packed payload must be a whole number of frames
    #[error("Payload of {len} bytes is not a whole number of frames")]
    PartialFrame { len: usize },

    /// The LCD has ten cells of four characters each
    #[error("Invalid LCD cell: {cell} (max: 9)")]
    InvalidLcdCell { cell: u8 },
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
