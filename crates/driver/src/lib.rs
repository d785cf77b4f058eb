//! Tranzport control surface driver
//!
//! User-space driver for the Frontier Design Tranzport. The surface reports
//! buttons, the jog wheel and its wireless link state as 8 byte frames on an
//! interrupt-in endpoint, and accepts light and LCD commands on interrupt-out.
//!
//! # Architecture
//!
//! - [`registry::DriverRegistry`] attaches devices and hands out open handles
//! - [`device::TranzportDevice`] holds the ring of unread reports and
//!   serializes reads, writes and teardown
//! - [`lifecycle`] runs one completion dispatcher thread per device
//! - [`usb`] provides discovery, hot-plug and a rusb-backed transport
//!
//! # Example
//!
//! ```
//! use common::test_utils::{MockTransport, wheel_frame};
//! use driver::{DriverConfig, DriverRegistry, OpenOptions};
//!
//! let registry = DriverRegistry::new(DriverConfig::default());
//! let (mock, binding) = MockTransport::new();
//! let minor = registry.probe(binding).unwrap();
//!
//! let file = registry.open(minor, OpenOptions::new()).unwrap();
//! assert!(mock.deliver_frame(wheel_frame(3)));
//! assert_eq!(file.read_frame().unwrap().wheel(), 3);
//! ```

pub mod attributes;
pub mod config;
pub mod device;
pub mod file;
pub mod lifecycle;
pub mod registry;
pub mod ring;
pub mod usb;

pub use attributes::{list_attributes, show_attribute, store_attribute};
pub use config::DriverConfig;
pub use device::{DeviceStats, Readiness, TranzportDevice};
pub use file::{OpenFile, OpenOptions};
pub use lifecycle::LifecycleState;
pub use registry::DriverRegistry;
pub use ring::{RingBuffer, RingStats};
