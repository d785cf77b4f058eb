//! Frame-level protocol for the Frontier Designs Tranzport
//!
//! This crate defines the fixed eight byte frame exchanged with the surface,
//! decoding of inbound button/wheel reports, and encoding of outbound light and
//! LCD commands.
//!
//! # Example
//!
//! ```
//! use protocol::{Button, Frame, InputReport};
//!
//! let frame = Frame::new([0x00, 0x01, 0x00, 0x10, 0x00, 0x00, 0x02, 0x00]);
//! let report = InputReport::decode(&frame);
//!
//! assert!(report.is_pressed(Button::Play));
//! assert_eq!(report.wheel, 2);
//! ```

pub mod command;
pub mod error;
pub mod frame;
pub mod report;

pub use command::{Command, LCD_CELLS, Light, lcd_line};
pub use error::{ProtocolError, Result};
pub use frame::{
    FRAME_SIZE, Frame, PRODUCT_ID, VENDOR_ID, max_payload, pack_frames, unpack_frames,
};
pub use report::{Button, InputReport, STATUS_OFFLINE, STATUS_ONLINE, coalesce_wheel};
