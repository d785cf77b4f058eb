//! Common utilities for the Tranzport driver
//!
//! This crate provides the pieces shared between the driver library, its
//! binary and its tests: the error taxonomy, logging setup, the completion
//! channel that replaces interrupt-context callbacks, the `Transport`
//! abstraction, and test utilities.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;
pub mod transport;

pub use channel::{
    CompletionReceiver, CompletionSender, InCompletion, OutCompletion, TransportEvent,
    completion_channel,
};
pub use error::{Error, Result};
pub use logging::{effective_level, setup_logging};
pub use transport::{EndpointInfo, Transport, TransportBinding};
