//! KNX Individual Address implementation.
//!
//! Individual addresses identify physical devices on the KNX bus.
//! Format: Area.Line.Device (e.g., 1.1.5)
//! - Area: 0-15 (4 bits)
//! - Line: 0-15 (4 bits)
//! - Device: 0-255 (8 bits)

use std::fmt;

use crate::error::{KnxError, Result};

/// KNX Individual Address (Area.Line.Device)
///
/// Used to identify physical devices on the KNX bus. A tunneling connect
/// response carries the address the server assigned to the client.
///
/// # Examples
///
/// ```
/// use knx_link::IndividualAddress;
///
/// let addr = IndividualAddress::new(1, 1, 5).unwrap();
/// assert_eq!(addr.to_string(), "1.1.5");
///
/// let addr = IndividualAddress::from(0x1105u16);
/// assert_eq!(addr.area(), 1);
/// assert_eq!(addr.line(), 1);
/// assert_eq!(addr.device(), 5);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndividualAddress {
    raw: u16,
}

impl IndividualAddress {
    /// Maximum area value (4 bits)
    pub const MAX_AREA: u8 = 15;
    /// Maximum line value (4 bits)
    pub const MAX_LINE: u8 = 15;

    /// Create a new Individual Address from components.
    ///
    /// # Errors
    ///
    /// Returns an error if area or line is out of range.
    pub fn new(area: u8, line: u8, device: u8) -> Result<Self> {
        if area > Self::MAX_AREA {
            return Err(KnxError::InvalidArgument(format!("area {area} out of range (0-15)")));
        }
        if line > Self::MAX_LINE {
            return Err(KnxError::InvalidArgument(format!("line {line} out of range (0-15)")));
        }
        // device is u8, always in range

        let raw = (u16::from(area) << 12) | (u16::from(line) << 8) | u16::from(device);
        Ok(Self { raw })
    }

    /// Get the raw u16 representation of the address.
    #[inline]
    pub const fn raw(self) -> u16 {
        self.raw
    }

    /// Get the area component (0-15).
    #[inline]
    pub const fn area(self) -> u8 {
        ((self.raw >> 12) & 0x0F) as u8
    }

    /// Get the line component (0-15).
    #[inline]
    pub const fn line(self) -> u8 {
        ((self.raw >> 8) & 0x0F) as u8
    }

    /// Get the device component (0-255).
    #[inline]
    pub const fn device(self) -> u8 {
        (self.raw & 0xFF) as u8
    }
}

impl fmt::Display for IndividualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.area(), self.line(), self.device())
    }
}

impl From<u16> for IndividualAddress {
    #[inline]
    fn from(raw: u16) -> Self {
        Self { raw }
    }
}

impl From<IndividualAddress> for u16 {
    #[inline]
    fn from(addr: IndividualAddress) -> u16 {
        addr.raw
    }
}

impl std::str::FromStr for IndividualAddress {
    type Err = KnxError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || KnxError::InvalidArgument(format!("invalid individual address '{s}'"));

        let mut parts = s.split('.');
        let area = parts.next().and_then(|p| p.parse::<u8>().ok()).ok_or_else(invalid)?;
        let line = parts.next().and_then(|p| p.parse::<u8>().ok()).ok_or_else(invalid)?;
        let device = parts.next().and_then(|p| p.parse::<u8>().ok()).ok_or_else(invalid)?;
        if parts.next().is_some() {
            return Err(invalid());
        }

        Self::new(area, line, device)
    }
}
