//! Open file handles
//!
//! An `OpenFile` is what a successful open hands back. It forwards reads and
//! writes to the device with its own blocking mode, and releases the device
//! exactly once when dropped.

use crate::device::{Readiness, TranzportDevice};
use common::Result;
use protocol::{Frame, pack_frames};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Options for `DriverRegistry::open`
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    pub nonblocking: bool,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nonblocking(mut self, nonblocking: bool) -> Self {
        self.nonblocking = nonblocking;
        self
    }
}

#[derive(Debug)]
pub struct OpenFile {
    device: Arc<TranzportDevice>,
    nonblocking: AtomicBool,
}

impl OpenFile {
    /// Wrap a device that has already accepted `open()`
    pub(crate) fn new(device: Arc<TranzportDevice>, options: OpenOptions) -> Self {
        Self {
            device,
            nonblocking: AtomicBool::new(options.nonblocking),
        }
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.device.read(buf, self.is_nonblocking())
    }

    pub fn read_frame(&self) -> Result<Frame> {
        self.device.read_frame(self.is_nonblocking())
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        self.device.write(buf, self.is_nonblocking())
    }

    /// Send several command frames in one transfer
    pub fn write_frames(&self, frames: &[Frame]) -> Result<usize> {
        self.write(&pack_frames(frames))
    }

    pub fn flush(&self, timeout: Duration) -> Result<bool> {
        self.device.flush(timeout)
    }

    pub fn poll(&self) -> Readiness {
        self.device.poll()
    }

    pub fn poll_wait(&self, timeout: Duration) -> Readiness {
        self.device.poll_wait(timeout)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) {
        self.nonblocking.store(nonblocking, Ordering::Relaxed);
    }

    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking.load(Ordering::Relaxed)
    }

    pub fn device(&self) -> &Arc<TranzportDevice> {
        &self.device
    }
}

impl Drop for OpenFile {
    fn drop(&mut self) {
        self.device.release();
    }
}
