//! Decoding of inbound Tranzport reports
//!
//! Report layout:
//!
//! ```text
//! byte  0     1       2..6                 6        7
//!      [0x00][status][button mask (BE u32)][wheel i8][0x00]
//! ```
//!
//! A status of `0xff` means the wireless link went to sleep or out of range.

use crate::frame::Frame;
use byteorder::{BigEndian, ByteOrder};
use serde::Serialize;

/// Status byte reported while the surface is offline
pub const STATUS_OFFLINE: u8 = 0xff;

/// Status byte reported while the surface is online
pub const STATUS_ONLINE: u8 = 0x01;

/// Buttons on the surface and their bit in the report's button mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Button {
    Battery,
    Backlight,
    TrackLeft,
    TrackRight,
    TrackRec,
    TrackMute,
    TrackSolo,
    Undo,
    In,
    Out,
    Punch,
    Loop,
    Prev,
    Add,
    Next,
    Rewind,
    FastForward,
    Stop,
    Play,
    Record,
    Shift,
}

impl Button {
    pub const ALL: [Button; 21] = [
        Button::Battery,
        Button::Backlight,
        Button::TrackLeft,
        Button::TrackRight,
        Button::TrackRec,
        Button::TrackMute,
        Button::TrackSolo,
        Button::Undo,
        Button::In,
        Button::Out,
        Button::Punch,
        Button::Loop,
        Button::Prev,
        Button::Add,
        Button::Next,
        Button::Rewind,
        Button::FastForward,
        Button::Stop,
        Button::Play,
        Button::Record,
        Button::Shift,
    ];

    pub const fn mask(self) -> u32 {
        match self {
            Button::Battery => 0x0000_4000,
            Button::Backlight => 0x0000_8000,
            Button::TrackLeft => 0x0400_0000,
            Button::TrackRight => 0x4000_0000,
            Button::TrackRec => 0x0004_0000,
            Button::TrackMute => 0x0040_0000,
            Button::TrackSolo => 0x0000_0400,
            Button::Undo => 0x8000_0000,
            Button::In => 0x0200_0000,
            Button::Out => 0x2000_0000,
            Button::Punch => 0x0080_0000,
            Button::Loop => 0x0008_0000,
            Button::Prev => 0x0002_0000,
            Button::Add => 0x0020_0000,
            Button::Next => 0x0000_0200,
            Button::Rewind => 0x0100_0000,
            Button::FastForward => 0x1000_0000,
            Button::Stop => 0x0001_0000,
            Button::Play => 0x0010_0000,
            Button::Record => 0x0000_0100,
            Button::Shift => 0x0800_0000,
        }
    }
}

/// A decoded inbound report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InputReport {
    pub status: u8,
    pub buttons: u32,
    pub wheel: i8,
}

impl InputReport {
    pub fn decode(frame: &Frame) -> Self {
        let bytes = frame.as_bytes();
        Self {
            status: bytes[1],
            buttons: BigEndian::read_u32(&bytes[2..6]),
            wheel: frame.wheel(),
        }
    }

    pub fn is_offline(&self) -> bool {
        self.status == STATUS_OFFLINE
    }

    pub fn is_wheel_event(&self) -> bool {
        self.wheel != 0
    }

    pub fn is_pressed(&self, button: Button) -> bool {
        self.buttons & button.mask() != 0
    }

    /// Buttons held down in this report
    pub fn pressed(&self) -> impl Iterator<Item = Button> + '_ {
        Button::ALL.into_iter().filter(|b| self.is_pressed(*b))
    }
}

/// Merge two consecutive wheel reports into one
///
/// Both frames must move the wheel in the same direction with identical status
/// and button state. Returns `None` when they cannot be merged, including when
/// the summed delta would not fit in a signed byte.
pub fn coalesce_wheel(older: &Frame, newer: &Frame) -> Option<Frame> {
    let (old, new) = (older.wheel(), newer.wheel());
    if old == 0 || new == 0 || (old > 0) != (new > 0) {
        return None;
    }
    if older.as_bytes()[1..6] != newer.as_bytes()[1..6] {
        return None;
    }

    old.checked_add(new).map(|sum| newer.with_wheel(sum))
}
