//! Cell Colors
//!
//! Validated 24-bit RGB colors. The wire accepts `#RGB` and `#RRGGBB`
//! (case-insensitive); everything is stored packed and rendered back as
//! lowercase `#rrggbb`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Packed 24-bit color (`0xRRGGBB`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Color(u32);

/// Color parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid color {0:?}: expected #RGB or #RRGGBB")]
pub struct InvalidColor(pub String);

impl Color {
    /// Black.
    pub const BLACK: Color = Color(0x000000);
    /// White.
    pub const WHITE: Color = Color(0xFFFFFF);

    /// Create from a packed `0xRRGGBB` value. Bits above 24 are discarded.
    pub const fn from_rgb(rgb: u32) -> Self {
        Self(rgb & 0x00FF_FFFF)
    }

    /// Packed `0xRRGGBB` value.
    pub const fn rgb(self) -> u32 {
        self.0
    }

    /// Parse a `#RGB` or `#RRGGBB` hex string.
    pub fn parse(s: &str) -> Result<Self, InvalidColor> {
        let invalid = || InvalidColor(s.to_string());

        let digits = s.strip_prefix('#').ok_or_else(invalid)?;
        if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid());
        }

        match digits.len() {
            3 => {
                // Each nibble doubles: #abc -> #aabbcc
                let short = u32::from_str_radix(digits, 16).map_err(|_| invalid())?;
                let r = (short >> 8) & 0xF;
                let g = (short >> 4) & 0xF;
                let b = short & 0xF;
                Ok(Self((r * 0x11) << 16 | (g * 0x11) << 8 | (b * 0x11)))
            }
            6 => u32::from_str_radix(digits, 16)
                .map(Self)
                .map_err(|_| invalid()),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:06x}", self.0)
    }
}

impl FromStr for Color {
    type Err = InvalidColor;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Color {
    type Error = InvalidColor;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Color> for String {
    fn from(color: Color) -> Self {
        color.to_string()
    }
}
