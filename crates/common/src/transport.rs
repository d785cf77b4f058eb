//! Transport abstraction
//!
//! A transport moves frames between the driver and the hardware. Submissions
//! return immediately; the outcome of each transfer is posted later through
//! the [`CompletionSender`](crate::channel::CompletionSender) the transport was
//! built with.

use crate::channel::{CompletionReceiver, CompletionSender};
use bytes::Bytes;
use std::fmt;
use std::time::Duration;

/// Asynchronous interrupt transfer submission
pub trait Transport: Send + Sync {
    /// Arm one inbound interrupt read
    ///
    /// Exactly one `InCompletion` is posted per successful submission unless
    /// the read is cancelled first. It is posted tagged with `epoch`, which
    /// lets the device tell a current read from one it has since abandoned.
    fn submit_in(&self, epoch: u64) -> crate::Result<()>;

    /// Start one outbound interrupt write
    ///
    /// Exactly one `OutCompletion` is posted per successful submission unless
    /// the write is cancelled first.
    fn submit_out(&self, payload: Bytes) -> crate::Result<()>;

    /// Cancel the armed read. Once this returns, no completion for it is posted.
    fn cancel_in(&self);

    /// Cancel the outstanding write. Once this returns, no completion for it is posted.
    fn cancel_out(&self);
}

/// Interrupt endpoint parameters discovered at probe time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    pub in_address: u8,
    pub in_max_packet: usize,
    pub in_interval: Duration,
    pub out_address: u8,
    pub out_max_packet: usize,
    pub out_interval: Duration,
}

impl Default for EndpointInfo {
    fn default() -> Self {
        Self {
            in_address: 0x81,
            in_max_packet: protocol::FRAME_SIZE,
            in_interval: Duration::from_millis(1),
            out_address: 0x02,
            out_max_packet: protocol::FRAME_SIZE,
            out_interval: Duration::from_millis(1),
        }
    }
}

/// Everything needed to attach a device to the driver
pub struct TransportBinding {
    /// Human readable location, e.g. "bus 001 device 004"
    pub location: String,
    pub endpoints: EndpointInfo,
    pub transport: Box<dyn Transport>,
    pub completions: CompletionReceiver,
    /// Sender into the same channel, used to stop the dispatcher
    pub notifier: CompletionSender,
}

impl fmt::Debug for TransportBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportBinding")
            .field("location", &self.location)
            .field("endpoints", &self.endpoints)
            .finish_non_exhaustive()
    }
}
