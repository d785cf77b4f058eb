//! Fixed-width Tranzport frames
//!
//! Every interrupt report the surface sends, and every command it accepts,
//! is exactly eight bytes. Writes may pack several commands back to back.

use crate::error::{ProtocolError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of one report or command in bytes
pub const FRAME_SIZE: usize = 8;

/// Frontier Designs USB vendor ID
pub const VENDOR_ID: u16 = 0x165b;

/// Tranzport USB product ID
pub const PRODUCT_ID: u16 = 0x8101;

/// One eight byte report or command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Frame([u8; FRAME_SIZE]);

impl Frame {
    pub const fn new(bytes: [u8; FRAME_SIZE]) -> Self {
        Self(bytes)
    }

    /// Copy a frame out of a slice that must be exactly eight bytes long
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let bytes: [u8; FRAME_SIZE] = data
            .try_into()
            .map_err(|_| ProtocolError::InvalidFrameLength { len: data.len() })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; FRAME_SIZE] {
        &self.0
    }

    pub fn into_bytes(self) -> [u8; FRAME_SIZE] {
        self.0
    }

    /// Status byte (0xff while the wireless link is offline)
    pub fn status(&self) -> u8 {
        self.0[1]
    }

    /// Signed wheel delta carried in byte 6
    pub fn wheel(&self) -> i8 {
        self.0[6] as i8
    }

    /// Same frame with a different wheel delta
    pub fn with_wheel(mut self, delta: i8) -> Self {
        self.0[6] = delta as u8;
        self
    }
}

impl From<[u8; FRAME_SIZE]> for Frame {
    fn from(bytes: [u8; FRAME_SIZE]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Pack frames into one contiguous outbound payload
pub fn pack_frames(frames: &[Frame]) -> Bytes {
    let mut buf = BytesMut::with_capacity(frames.len() * FRAME_SIZE);
    for frame in frames {
        buf.put_slice(frame.as_bytes());
    }
    buf.freeze()
}

/// Split a payload into frames; the length must be a whole number of frames
pub fn unpack_frames(data: &[u8]) -> Result<Vec<Frame>> {
    if data.len() % FRAME_SIZE != 0 {
        return Err(ProtocolError::PartialFrame { len: data.len() });
    }

    data.chunks_exact(FRAME_SIZE).map(Frame::from_slice).collect()
}

/// Largest whole-frame payload that fits in a write buffer of `write_buffer_size` bytes
pub fn max_payload(write_buffer_size: usize) -> usize {
    write_buffer_size - write_buffer_size % FRAME_SIZE
}
