//! GET_INFO response decoding.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use super::device_instant;
use super::frame::{Field, FrameError, FrameReader};

pub const TIME: Field = Field::new("time", 1, 4);
pub const TIME_SUBSECOND: Field = Field::new("time_subsecond", 5, 2);
pub const BATTERY: Field = Field::new("battery", 9, 4);
pub const DEVICE_ID: Field = Field::new("device_id", 13, 8);
pub const FIRMWARE_DESCRIPTION: Field = Field::new("firmware_description", 21, 32);
pub const FIRMWARE_VERSION: Field = Field::new("firmware_version", 53, 3);
pub const FIRMWARE_SIZE: Field = Field::new("firmware_size", 56, 4);
pub const FLASH_PAGE_SIZE: Field = Field::new("flash_page_size", 60, 2);
pub const STATUS: Field = Field::new("status", 62, 1);
pub const SNAPSHOT_COUNT: Field = Field::new("snapshot_count", 63, 2);
pub const ACCEL_X: Field = Field::new("accel_x", 65, 2);
pub const ACCEL_Y: Field = Field::new("accel_y", 67, 2);
pub const ACCEL_Z: Field = Field::new("accel_z", 69, 2);
pub const CONTROL_REGISTERS: Field = Field::new("control_registers", 71, 7);

/// Shortest frame carrying every field, accelerometer block included.
pub const DEVICE_INFO_MIN_LEN: usize = CONTROL_REGISTERS.end();

/// LIS3DH at +/-2 g: milli-g per 16-bit LSB, scaled by 1000.
const ACCEL_LSB_MILLI_G: f64 = 4.0;
const ACCEL_LSB16_TO_KILO_LSB10: f64 = 64000.0;

/// What the device will do once it is unplugged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceStatus {
    WillShutdown,
    WillRecord,
    Erasing,
    Undefined(u8),
}

impl From<u8> for DeviceStatus {
    fn from(raw: u8) -> Self {
        match raw {
            0 => DeviceStatus::WillShutdown,
            1 => DeviceStatus::WillRecord,
            2 => DeviceStatus::Erasing,
            other => DeviceStatus::Undefined(other),
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceStatus::WillShutdown => write!(f, "Will shutdown"),
            DeviceStatus::WillRecord => write!(f, "Will record"),
            DeviceStatus::Erasing => write!(f, "Erasing"),
            DeviceStatus::Undefined(_) => write!(f, "Undefined"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Accelerometer sample and LIS3DH control registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MotionState {
    /// Raw x/y/z readings.
    pub acceleration: [i16; 3],
    /// CTRL_REG1..CTRL_REG6 and REFERENCE.
    pub control_registers: [u8; 7],
}

impl MotionState {
    /// Acceleration in units of g.
    pub fn acceleration_g(&self) -> [f64; 3] {
        self.acceleration
            .map(|raw| f64::from(raw) * ACCEL_LSB_MILLI_G / ACCEL_LSB16_TO_KILO_LSB10)
    }
}

/// Everything the device reports in one GET_INFO response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub device_id: u64,
    pub firmware_description: String,
    pub firmware_version: FirmwareVersion,
    pub firmware_size: u32,
    pub flash_page_size: u16,
    pub status: DeviceStatus,
    pub snapshot_count: u16,
    /// Battery voltage in volts.
    pub battery_voltage: f64,
    pub time: DateTime<Utc>,
    pub motion: MotionState,
}

impl DeviceInfo {
    /// Decode a GET_INFO response. Frames shorter than
    /// [`DEVICE_INFO_MIN_LEN`] are rejected as a whole.
    pub fn decode(frame: &[u8]) -> Result<Self, FrameError> {
        let reader = FrameReader::new(frame);
        reader.require("device_info", DEVICE_INFO_MIN_LEN)?;

        let version = reader.bytes(FIRMWARE_VERSION)?;
        let mut control_registers = [0u8; 7];
        control_registers.copy_from_slice(reader.bytes(CONTROL_REGISTERS)?);
        let motion = MotionState {
            acceleration: [
                reader.i16_be(ACCEL_X)?,
                reader.i16_be(ACCEL_Y)?,
                reader.i16_be(ACCEL_Z)?,
            ],
            control_registers,
        };

        Ok(Self {
            device_id: reader.u64_accumulated(DEVICE_ID)?,
            firmware_description: printable_ascii(reader.bytes(FIRMWARE_DESCRIPTION)?),
            firmware_version: FirmwareVersion {
                major: version[0],
                minor: version[1],
                patch: version[2],
            },
            firmware_size: reader.u32_le(FIRMWARE_SIZE)?,
            flash_page_size: reader.u16_le(FLASH_PAGE_SIZE)?,
            status: DeviceStatus::from(reader.u8(STATUS)?),
            snapshot_count: reader.u16_le(SNAPSHOT_COUNT)?,
            battery_voltage: f64::from(reader.u32_le(BATTERY)?) / 100.0,
            time: device_instant(reader.u32_le(TIME)?, reader.u16_le(TIME_SUBSECOND)?),
            motion,
        })
    }

    /// Device ID as shown to users (upper-case hex).
    pub fn device_id_hex(&self) -> String {
        format!("{:X}", self.device_id)
    }

    /// Firmware updates need both the image and page size from the device.
    pub fn supports_firmware_update(&self) -> bool {
        self.firmware_size > 0 && self.flash_page_size > 0
    }
}

/// NUL bytes are dropped; other unprintable bytes become '.'.
fn printable_ascii(bytes: &[u8]) -> String {
    bytes
        .iter()
        .filter(|&&b| b != 0)
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RESPONSE_SIZE;

    fn put(frame: &mut [u8], field: Field, bytes: &[u8]) {
        frame[field.offset..field.offset + bytes.len()].copy_from_slice(bytes);
    }

    fn sample_frame() -> Vec<u8> {
        let mut frame = vec![0u8; RESPONSE_SIZE];
        frame[0] = 0x02;
        put(&mut frame, TIME, &1_650_000_000u32.to_le_bytes());
        put(&mut frame, TIME_SUBSECOND, &512u16.to_le_bytes());
        put(&mut frame, BATTERY, &412u32.to_le_bytes());
        put(
            &mut frame,
            DEVICE_ID,
            &[0xEF, 0xCD, 0xAB, 0x89, 0x67, 0x45, 0x23, 0x01],
        );
        put(&mut frame, FIRMWARE_DESCRIPTION, b"SnapperGPS-basic\0\0\0");
        put(&mut frame, FIRMWARE_VERSION, &[1, 2, 3]);
        put(&mut frame, FIRMWARE_SIZE, &(48u32 * 1024).to_le_bytes());
        put(&mut frame, FLASH_PAGE_SIZE, &2048u16.to_le_bytes());
        put(&mut frame, STATUS, &[1]);
        put(&mut frame, SNAPSHOT_COUNT, &300u16.to_le_bytes());
        put(&mut frame, ACCEL_X, &(-16i16).to_be_bytes());
        put(&mut frame, ACCEL_Y, &16000i16.to_be_bytes());
        put(&mut frame, ACCEL_Z, &0i16.to_be_bytes());
        put(&mut frame, CONTROL_REGISTERS, &[0x57, 0, 0, 0x80, 0, 0, 0]);
        frame
    }

    #[test]
    fn test_device_id() {
        let info = DeviceInfo::decode(&sample_frame()).unwrap();
        assert_eq!(info.device_id, 0x0123_4567_89AB_CDEF);
        assert_eq!(info.device_id_hex(), "123456789ABCDEF");
    }

    #[test]
    fn test_firmware_fields() {
        let info = DeviceInfo::decode(&sample_frame()).unwrap();
        assert_eq!(info.firmware_description, "SnapperGPS-basic");
        assert_eq!(info.firmware_version.to_string(), "1.2.3");
        assert_eq!(info.firmware_size, 48 * 1024);
        assert_eq!(info.flash_page_size, 2048);
        assert!(info.supports_firmware_update());
    }

    #[test]
    fn test_status_and_count() {
        let info = DeviceInfo::decode(&sample_frame()).unwrap();
        assert_eq!(info.status, DeviceStatus::WillRecord);
        assert_eq!(info.snapshot_count, 300);
        assert_eq!(DeviceStatus::from(0), DeviceStatus::WillShutdown);
        assert_eq!(DeviceStatus::from(2), DeviceStatus::Erasing);
        assert_eq!(DeviceStatus::from(7), DeviceStatus::Undefined(7));
        assert_eq!(DeviceStatus::Undefined(7).to_string(), "Undefined");
    }

    #[test]
    fn test_battery_and_time() {
        let info = DeviceInfo::decode(&sample_frame()).unwrap();
        assert!((info.battery_voltage - 4.12).abs() < 1e-9);
        assert_eq!(info.time.timestamp(), 1_650_000_000);
        assert_eq!(info.time.timestamp_subsec_millis(), 500);
    }

    #[test]
    fn test_motion_state() {
        let info = DeviceInfo::decode(&sample_frame()).unwrap();
        let motion = info.motion;
        assert_eq!(motion.acceleration, [-16, 16000, 0]);
        assert_eq!(motion.control_registers[0], 0x57);
        let g = motion.acceleration_g();
        assert!((g[1] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_frame_without_control_registers_is_rejected() {
        let frame = sample_frame();
        let err = DeviceInfo::decode(&frame[..CONTROL_REGISTERS.end() - 1]).unwrap_err();
        assert_eq!(
            err,
            FrameError::TooShort {
                field: "device_info",
                required: CONTROL_REGISTERS.end(),
                actual: CONTROL_REGISTERS.end() - 1,
            }
        );
        assert!(DeviceInfo::decode(&frame[..CONTROL_REGISTERS.end()]).is_ok());
    }

    #[test]
    fn test_short_frame_is_rejected() {
        let frame = sample_frame();
        for len in [0, 1, 20, 65, 70, DEVICE_INFO_MIN_LEN - 1] {
            assert!(DeviceInfo::decode(&frame[..len]).is_err(), "len {len}");
        }
    }

    #[test]
    fn test_unprintable_description_bytes() {
        assert_eq!(printable_ascii(b"AB\x01C\0\0"), "AB.C");
    }
}
