//! GET_SNAPSHOT response decoding.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::constants::TEMPERATURE_OFFSET;
use super::device_instant;
use super::frame::{Field, FrameError, FrameReader};

/// Non-zero while the device still has stored snapshots.
pub const VALID: Field = Field::new("valid", 1, 1);
pub const TIMESTAMP: Field = Field::new("timestamp", 2, 4);
pub const TIMESTAMP_SUBSECOND: Field = Field::new("timestamp_subsecond", 6, 2);
pub const TEMPERATURE: Field = Field::new("temperature", 10, 4);
pub const BATTERY: Field = Field::new("battery", 14, 4);

/// Shortest frame carrying every metadata field.
pub const SNAPSHOT_META_MIN_LEN: usize = BATTERY.end();

/// Metadata stored alongside one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SnapshotMeta {
    pub valid: bool,
    pub timestamp: DateTime<Utc>,
    /// Degrees Celsius.
    pub temperature: f64,
    /// Volts.
    pub battery: f64,
}

impl SnapshotMeta {
    /// Read only the validity byte. A zero means the device has no more data.
    pub fn validity(frame: &[u8]) -> Result<bool, FrameError> {
        Ok(FrameReader::new(frame).u8(VALID)? != 0)
    }

    pub fn decode(frame: &[u8]) -> Result<Self, FrameError> {
        let reader = FrameReader::new(frame);
        reader.require("snapshot_meta", SNAPSHOT_META_MIN_LEN)?;

        let raw_temperature = i64::from(reader.u32_le(TEMPERATURE)?);
        Ok(Self {
            valid: reader.u8(VALID)? != 0,
            timestamp: device_instant(
                reader.u32_le(TIMESTAMP)?,
                reader.u16_le(TIMESTAMP_SUBSECOND)?,
            ),
            temperature: (raw_temperature - TEMPERATURE_OFFSET) as f64 / 10.0,
            battery: f64::from(reader.u32_le(BATTERY)?) / 100.0,
        })
    }
}

#[cfg(test)]
pub(crate) fn encode_for_test(
    valid: bool,
    unix_secs: u32,
    subsecond: u16,
    temp_raw: u32,
    battery_raw: u32,
) -> Vec<u8> {
    let mut frame = vec![0u8; super::RESPONSE_SIZE];
    frame[0] = super::MSG_GET_SNAPSHOT;
    frame[VALID.offset] = u8::from(valid);
    frame[TIMESTAMP.offset..TIMESTAMP.end()].copy_from_slice(&unix_secs.to_le_bytes());
    frame[TIMESTAMP_SUBSECOND.offset..TIMESTAMP_SUBSECOND.end()]
        .copy_from_slice(&subsecond.to_le_bytes());
    frame[TEMPERATURE.offset..TEMPERATURE.end()].copy_from_slice(&temp_raw.to_le_bytes());
    frame[BATTERY.offset..BATTERY.end()].copy_from_slice(&battery_raw.to_le_bytes());
    frame
}
