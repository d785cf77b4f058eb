//! Outbound commands understood by the surface

use crate::error::{ProtocolError, Result};
use crate::frame::Frame;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Number of four-character cells on the 2x20 LCD
pub const LCD_CELLS: u8 = 10;

/// Characters per LCD cell
pub const LCD_CELL_WIDTH: usize = 4;

/// Indicator lights, in hardware order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Light {
    Record = 0,
    TrackRec = 1,
    TrackMute = 2,
    TrackSolo = 3,
    AnySolo = 4,
    Loop = 5,
    Punch = 6,
}

impl FromStr for Light {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "record" => Ok(Light::Record),
            "trackrec" => Ok(Light::TrackRec),
            "trackmute" => Ok(Light::TrackMute),
            "tracksolo" => Ok(Light::TrackSolo),
            "anysolo" => Ok(Light::AnySolo),
            "loop" => Ok(Light::Loop),
            "punch" => Ok(Light::Punch),
            other => Err(format!("unknown light '{}'", other)),
        }
    }
}

/// A command frame sent to the surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Switch an indicator light
    Light { light: Light, on: bool },
    /// Write up to four characters into one LCD cell
    Lcd { cell: u8, text: String },
}

impl Command {
    pub fn encode(&self) -> Result<Frame> {
        match self {
            Command::Light { light, on } => Ok(Frame::new([
                0x00,
                0x00,
                *light as u8,
                u8::from(*on),
                0x00,
                0x00,
                0x00,
                0x00,
            ])),
            Command::Lcd { cell, text } => {
                if *cell >= LCD_CELLS {
                    return Err(ProtocolError::InvalidLcdCell { cell: *cell });
                }
                let mut chars = [b' '; LCD_CELL_WIDTH];
                for (slot, c) in chars.iter_mut().zip(text.chars()) {
                    // the LCD character ROM is ASCII only
                    *slot = if c.is_ascii() { c as u8 } else { b'?' };
                }
                Ok(Frame::new([
                    0x00, 0x01, *cell, chars[0], chars[1], chars[2], chars[3], 0x00,
                ]))
            }
        }
    }
}

/// Encode a line of text across consecutive LCD cells starting at `first_cell`
pub fn lcd_line(first_cell: u8, text: &str) -> Result<Vec<Frame>> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(LCD_CELL_WIDTH)
        .enumerate()
        .map(|(i, chunk)| {
            let cell = first_cell.saturating_add(i as u8);
            Command::Lcd {
                cell,
                text: chunk.iter().collect(),
            }
            .encode()
        })
        .collect()
}
