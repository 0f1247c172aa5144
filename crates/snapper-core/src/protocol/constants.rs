//! Protocol constants for the SnapperGPS USB interface.
//!
//! Opcodes and frame geometry are fixed by the receiver firmware.

// ============================================================================
// Device Identification
// ============================================================================

/// Silicon Labs Vendor ID used by SnapperGPS receivers.
pub const SNAPPER_VENDOR_ID: u16 = 0x10C4;

/// Substring of the USB product string identifying a receiver (case-insensitive).
pub const SNAPPER_PRODUCT_MATCH: &str = "SNAPPER";

/// Interface holding the bulk endpoint pair.
pub const SNAPPER_INTERFACE: u8 = 0;

// ============================================================================
// Command Opcodes (Host -> Device)
// ============================================================================

pub const MSG_SET_TIME: u8 = 0x01;
pub const MSG_GET_INFO: u8 = 0x02;
pub const MSG_FIRMWARE_INIT: u8 = 0x03;
pub const MSG_FIRMWARE_CRC: u8 = 0x05;
pub const MSG_FIRMWARE_FLASH: u8 = 0x06;
pub const MSG_GET_SNAPSHOT: u8 = 0x81;
pub const MSG_START: u8 = 0x82;
pub const MSG_SHUTDOWN: u8 = 0x83;
pub const MSG_GET_SNAPSHOT_PAGE: u8 = 0x84;

// ============================================================================
// Size Constants
// ============================================================================

/// Device info / acknowledgement response length.
pub const RESPONSE_SIZE: usize = 128;

/// Snapshot buffer on the device (6 KB).
pub const SNAPSHOT_BUFFER_SIZE: usize = 0x1800;

/// Bytes of each snapshot buffer used for metadata.
pub const METADATA_SIZE: usize = 8;

/// Bytes transferred per snapshot page request.
pub const SNAPSHOT_PAGE_SIZE: usize = SNAPSHOT_BUFFER_SIZE - METADATA_SIZE;

/// Logical snapshot length (12 ms at 4.092 MHz, 1 bit per sample).
pub const SNAPSHOT_SIZE: usize = 6138;

/// Default firmware slot length (48 KB).
pub const FIRMWARE_SIZE: usize = 48 * 1024;

/// Default flash page length (2 KB).
pub const FLASH_PAGE_SIZE: usize = 2048;

/// Fill byte for unused firmware space (erased flash).
pub const FIRMWARE_PAD_BYTE: u8 = 0xFF;

/// Sub-second fields count 1/1024ths of a second.
pub const SUBSECOND_TICKS: u32 = 1024;

/// Raw temperature offset; degrees Celsius = (raw - offset) / 10.
pub const TEMPERATURE_OFFSET: i64 = 1024;
