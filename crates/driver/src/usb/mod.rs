//! USB subsystem
//!
//! Real-hardware backing for the driver: device discovery, hot-plug
//! detection, and a `Transport` built on rusb.
//!
//! libusb calls block, so transfers run on dedicated threads and report back
//! through the completion channel rather than blocking the Tokio runtime.

pub mod monitor;
pub mod probe;
pub mod transport;

pub use monitor::{HotplugEvent, HotplugMonitor};
pub use probe::{DeviceSummary, find_devices, list_devices, open_device};
pub use transport::RusbTransport;
