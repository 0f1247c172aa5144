//! Bounds-checked field access for fixed-length response frames.
//!
//! Every multi-byte field is read through a named offset so that a short
//! frame fails with the name of the first field it cannot supply.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame too short for {field}: need {required} bytes, got {actual}")]
    TooShort {
        field: &'static str,
        required: usize,
        actual: usize,
    },
}

/// A named field location inside a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub offset: usize,
    pub len: usize,
}

impl Field {
    pub const fn new(name: &'static str, offset: usize, len: usize) -> Self {
        Self { name, offset, len }
    }

    /// One past the last byte of this field.
    pub const fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// Read-only view over a received frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameReader<'a> {
    data: &'a [u8],
}

impl<'a> FrameReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Fail unless the frame covers `required` bytes.
    pub fn require(&self, field: &'static str, required: usize) -> Result<(), FrameError> {
        if self.data.len() < required {
            return Err(FrameError::TooShort {
                field,
                required,
                actual: self.data.len(),
            });
        }
        Ok(())
    }

    pub fn bytes(&self, field: Field) -> Result<&'a [u8], FrameError> {
        self.require(field.name, field.end())?;
        Ok(&self.data[field.offset..field.end()])
    }

    pub fn u8(&self, field: Field) -> Result<u8, FrameError> {
        Ok(self.bytes(field)?[0])
    }

    pub fn u16_le(&self, field: Field) -> Result<u16, FrameError> {
        Ok(LittleEndian::read_u16(self.bytes(field)?))
    }

    pub fn u32_le(&self, field: Field) -> Result<u32, FrameError> {
        Ok(LittleEndian::read_u32(self.bytes(field)?))
    }

    pub fn i16_be(&self, field: Field) -> Result<i16, FrameError> {
        Ok(BigEndian::read_i16(self.bytes(field)?))
    }

    /// Accumulate bytes from the last one down to the first, multiplying by
    /// 256 at each step.
    pub fn u64_accumulated(&self, field: Field) -> Result<u64, FrameError> {
        let bytes = self.bytes(field)?;
        Ok(bytes
            .iter()
            .rev()
            .fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORD: Field = Field::new("word", 1, 4);

    #[test]
    fn test_little_endian_fields() {
        let frame = [0xAA, 0x78, 0x56, 0x34, 0x12];
        let reader = FrameReader::new(&frame);
        assert_eq!(reader.u32_le(WORD).unwrap(), 0x1234_5678);
        assert_eq!(
            reader.u16_le(Field::new("half", 1, 2)).unwrap(),
            0x5678
        );
    }

    #[test]
    fn test_big_endian_signed() {
        let frame = [0xFF, 0xFE];
        let reader = FrameReader::new(&frame);
        assert_eq!(reader.i16_be(Field::new("axis", 0, 2)).unwrap(), -2);
    }

    #[test]
    fn test_accumulated_u64_starts_at_last_byte() {
        let frame = [0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02];
        let reader = FrameReader::new(&frame);
        let id = reader.u64_accumulated(Field::new("id", 0, 8)).unwrap();
        assert_eq!(id, 0x0200_0000_0000_0001);
    }

    #[test]
    fn test_short_frame_names_field() {
        let frame = [0u8; 3];
        let reader = FrameReader::new(&frame);
        let err = reader.u32_le(WORD).unwrap_err();
        assert_eq!(
            err,
            FrameError::TooShort {
                field: "word",
                required: 5,
                actual: 3
            }
        );
    }
}
