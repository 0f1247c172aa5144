//! Protocol module - SnapperGPS USB message definitions.

pub mod ack;
pub mod command;
pub mod constants;
pub mod device_info;
pub mod frame;
pub mod snapshot_meta;

pub use ack::Ack;
pub use command::{Command, encode_command};
pub use constants::*;
pub use device_info::{DeviceInfo, DeviceStatus, FirmwareVersion, MotionState};
pub use frame::{Field, FrameError, FrameReader};
pub use snapshot_meta::SnapshotMeta;

use chrono::{DateTime, TimeDelta, Utc};

/// Convert a device clock reading (UNIX seconds plus 1/1024 s ticks) into
/// an absolute instant, rounding the sub-second part to milliseconds.
pub fn device_instant(unix_secs: u32, subsecond_ticks: u16) -> DateTime<Utc> {
    let millis = (u32::from(subsecond_ticks) * 1000 + SUBSECOND_TICKS / 2) / SUBSECOND_TICKS;
    DateTime::<Utc>::UNIX_EPOCH
        + TimeDelta::seconds(i64::from(unix_secs))
        + TimeDelta::milliseconds(i64::from(millis))
}
