//! Firmware image padding and paging.
//!
//! The receiver erases its whole firmware slot before an update, so the host
//! always sends the full slot: the supplied binary followed by erased-flash
//! bytes, split into flash pages sent in order.

use thiserror::Error;

use crate::crc::crc16;
use crate::protocol::constants::FIRMWARE_PAD_BYTE;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FirmwareError {
    #[error("Firmware binary too large: {actual} bytes, slot holds {maximum}")]
    TooLarge { actual: usize, maximum: usize },
    #[error("Firmware slot size is zero")]
    ZeroImageSize,
    #[error("Flash page size is zero")]
    ZeroPageSize,
    #[error("Firmware binary is empty")]
    EmptyBinary,
}

/// A padded firmware image ready for transfer.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    data: Vec<u8>,
    page_size: usize,
    crc: u16,
}

impl FirmwareImage {
    /// Pad `binary` with 0xFF up to `image_len` bytes and page it by
    /// `page_size`. The last page is shorter when `image_len` is not a
    /// multiple of the page size.
    pub fn new(binary: &[u8], image_len: usize, page_size: usize) -> Result<Self, FirmwareError> {
        if image_len == 0 {
            return Err(FirmwareError::ZeroImageSize);
        }
        if page_size == 0 {
            return Err(FirmwareError::ZeroPageSize);
        }
        if binary.is_empty() {
            return Err(FirmwareError::EmptyBinary);
        }
        if binary.len() > image_len {
            return Err(FirmwareError::TooLarge {
                actual: binary.len(),
                maximum: image_len,
            });
        }

        let mut data = Vec::with_capacity(image_len);
        data.extend_from_slice(binary);
        data.resize(image_len, FIRMWARE_PAD_BYTE);
        let crc = crc16(&data);

        Ok(Self {
            data,
            page_size,
            crc,
        })
    }

    /// Pages in transfer order.
    pub fn pages(&self) -> std::slice::Chunks<'_, u8> {
        self.data.chunks(self.page_size)
    }

    /// Page `index`, if it exists.
    pub fn page(&self, index: usize) -> Option<&[u8]> {
        let start = index.checked_mul(self.page_size)?;
        if start >= self.data.len() {
            return None;
        }
        let end = (start + self.page_size).min(self.data.len());
        Some(&self.data[start..end])
    }

    pub fn page_count(&self) -> usize {
        self.data.len().div_ceil(self.page_size)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// CRC16 over the full padded image, as the device computes it.
    pub fn crc(&self) -> u16 {
        self.crc
    }

    /// Get raw data.
    pub fn raw_data(&self) -> &[u8] {
        &self.data
    }

    /// Get total size.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::{FIRMWARE_SIZE, FLASH_PAGE_SIZE};

    #[test]
    fn test_short_binary_is_padded_to_slot() {
        let binary = vec![0x5Au8; 1000];
        let image = FirmwareImage::new(&binary, FIRMWARE_SIZE, FLASH_PAGE_SIZE).unwrap();

        assert_eq!(image.len(), 48 * 1024);
        assert_eq!(&image.raw_data()[..1000], binary.as_slice());
        assert!(image.raw_data()[1000..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_pages() {
        let image = FirmwareImage::new(&[1, 2, 3], FIRMWARE_SIZE, FLASH_PAGE_SIZE).unwrap();
        assert_eq!(image.page_count(), 24);

        let pages: Vec<_> = image.pages().collect();
        assert_eq!(pages.len(), 24);
        assert!(pages.iter().all(|p| p.len() == FLASH_PAGE_SIZE));
        assert_eq!(&pages[0][..4], &[1, 2, 3, 0xFF]);
        assert_eq!(image.page(23), Some(pages[23]));
        assert_eq!(image.page(24), None);
    }

    #[test]
    fn test_partial_last_page() {
        let image = FirmwareImage::new(&[0; 10], 5000, 2048).unwrap();
        assert_eq!(image.page_count(), 3);
        assert_eq!(image.page(2).map(<[u8]>::len), Some(5000 - 4096));
    }

    #[test]
    fn test_crc_covers_padding() {
        let image = FirmwareImage::new(&[0xAB], 64, 16).unwrap();
        let mut expected = vec![0xFFu8; 64];
        expected[0] = 0xAB;
        assert_eq!(image.crc(), crc16(&expected));
    }

    #[test]
    fn test_rejects_bad_geometry() {
        assert_eq!(
            FirmwareImage::new(&[0; 10], 8, 4).unwrap_err(),
            FirmwareError::TooLarge {
                actual: 10,
                maximum: 8
            }
        );
        assert_eq!(
            FirmwareImage::new(&[0; 4], 8, 0).unwrap_err(),
            FirmwareError::ZeroPageSize
        );
        assert_eq!(
            FirmwareImage::new(&[0; 4], 0, 4).unwrap_err(),
            FirmwareError::ZeroImageSize
        );
        assert_eq!(
            FirmwareImage::new(&[], 8, 4).unwrap_err(),
            FirmwareError::EmptyBinary
        );
    }

    #[test]
    fn test_exact_fit_needs_no_padding() {
        let binary = vec![0x11u8; 32];
        let image = FirmwareImage::new(&binary, 32, 8).unwrap();
        assert_eq!(image.raw_data(), binary.as_slice());
        assert_eq!(image.page_count(), 4);
    }
}
