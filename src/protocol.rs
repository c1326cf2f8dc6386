use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    error::{Result, SmartWindowError},
    types::OpenPercentage,
};

/// Frame size in bytes
pub const FRAME_SIZE: usize = 6;

/// Fixed header preceding the percentage byte of every open/close command
pub const OPEN_COMMAND_HEADER: [u8; 5] = [0x2A, 0x17, 0x10, 0x00, 0x00];

/// Open/close command sent to the window controller board
///
/// Layout:
/// - Bytes 0-4: fixed header `2A 17 10 00 00`
/// - Byte 5: target open percentage, integer 0-100
///
/// The peripheral defines no response frame; commands are absolute positions, so a
/// lost or reordered frame is corrected by the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenCommand {
    percentage: u8,
}

impl OpenCommand {
    /// Build a command for the given (clamped, rounded) percentage
    #[must_use]
    pub fn new(percentage: OpenPercentage) -> Self {
        Self {
            percentage: percentage.as_byte(),
        }
    }

    /// Build a command from any raw value, clamping into `[0, 100]`
    #[must_use]
    pub fn from_value(value: f64) -> Self {
        Self::new(OpenPercentage::new(value))
    }

    /// Target percentage carried by this frame
    #[must_use]
    pub const fn percentage(&self) -> u8 {
        self.percentage
    }

    /// Serialize the frame
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_SIZE);
        buf.put_slice(&OPEN_COMMAND_HEADER);
        buf.put_u8(self.percentage);
        buf.freeze()
    }

    /// Base64 form of the frame, as handed to mobile BLE stacks
    #[must_use]
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.to_bytes())
    }

    /// Parse a raw frame
    ///
    /// # Errors
    ///
    /// Returns [`SmartWindowError::Protocol`] if the length or header is wrong or the
    /// percentage is above 100.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != FRAME_SIZE {
            return Err(SmartWindowError::Protocol(format!(
                "Frame has {} bytes, expected {FRAME_SIZE}",
                data.len()
            )));
        }

        if data[..5] != OPEN_COMMAND_HEADER {
            return Err(SmartWindowError::Protocol(format!(
                "Unexpected frame header: {:02X?}",
                &data[..5]
            )));
        }

        let percentage = data[5];
        if percentage > 100 {
            return Err(SmartWindowError::Protocol(format!(
                "Percentage out of range: {percentage}"
            )));
        }

        Ok(Self { percentage })
    }

    /// Parse the base64 form of a frame
    ///
    /// # Errors
    ///
    /// Returns [`SmartWindowError::Protocol`] on invalid base64 or an invalid frame.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let data = STANDARD
            .decode(encoded)
            .map_err(|e| SmartWindowError::Protocol(format!("Invalid base64 frame: {e}")))?;
        Self::from_bytes(&data)
    }
}
