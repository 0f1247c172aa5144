//! Acknowledgement frames.
//!
//! Most commands are answered with a 128-byte frame whose content the host
//! ignores; only its arrival matters. FIRMWARE_CRC is the exception and
//! carries the device-computed CRC16.

use std::fmt;

use super::frame::{Field, FrameError, FrameReader};

/// CRC16 reported in a FIRMWARE_CRC response.
pub const FIRMWARE_CRC: Field = Field::new("firmware_crc", 1, 2);

/// A received acknowledgement.
#[derive(Clone, PartialEq, Eq)]
pub struct Ack {
    frame: Vec<u8>,
}

impl Ack {
    /// Wrap a response frame. An empty read is not an acknowledgement.
    pub fn from_frame(frame: Vec<u8>) -> Option<Self> {
        if frame.is_empty() {
            None
        } else {
            Some(Self { frame })
        }
    }

    /// First byte, which the receiver sets to the opcode it answers.
    pub fn opcode(&self) -> u8 {
        self.frame[0]
    }

    pub fn len(&self) -> usize {
        self.frame.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frame.is_empty()
    }

    /// The CRC16 field of a FIRMWARE_CRC response.
    pub fn firmware_crc(&self) -> Result<u16, FrameError> {
        FrameReader::new(&self.frame).u16_le(FIRMWARE_CRC)
    }
}

impl fmt::Debug for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ack(0x{:02X}, {} bytes)", self.opcode(), self.frame.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_frame_is_not_an_ack() {
        assert!(Ack::from_frame(Vec::new()).is_none());
    }

    #[test]
    fn test_firmware_crc_is_little_endian() {
        let mut frame = vec![0u8; 128];
        frame[0] = 0x05;
        frame[1] = 0xC3;
        frame[2] = 0x31;
        let ack = Ack::from_frame(frame).unwrap();
        assert_eq!(ack.opcode(), 0x05);
        assert_eq!(ack.firmware_crc().unwrap(), 0x31C3);
        assert_eq!(format!("{ack:?}"), "Ack(0x05, 128 bytes)");
    }

    #[test]
    fn test_short_crc_frame() {
        let ack = Ack::from_frame(vec![0x05, 0x01]).unwrap();
        assert!(ack.firmware_crc().is_err());
    }
}
