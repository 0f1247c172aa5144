//! Outbound command frames.

use std::fmt;

use super::constants::*;

/// A host-to-device command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Set the device clock (UNIX seconds).
    SetTime { unix_secs: u32 },
    /// Request the device info frame.
    GetInfo,
    /// Erase external flash and prepare for a firmware image.
    FirmwareInit,
    /// Ask the device for the CRC16 of the received image.
    FirmwareCrc,
    /// Copy the image to internal flash and restart.
    FirmwareFlash,
    /// Start reading the next stored snapshot (metadata first).
    GetSnapshot,
    /// Read the payload page of the current snapshot.
    GetSnapshotPage,
    /// Configure a recording window.
    Start {
        interval_secs: u32,
        start_secs: u32,
        end_secs: u32,
    },
    /// Shut down once unplugged.
    Shutdown,
}

impl Command {
    pub fn opcode(&self) -> u8 {
        match self {
            Command::SetTime { .. } => MSG_SET_TIME,
            Command::GetInfo => MSG_GET_INFO,
            Command::FirmwareInit => MSG_FIRMWARE_INIT,
            Command::FirmwareCrc => MSG_FIRMWARE_CRC,
            Command::FirmwareFlash => MSG_FIRMWARE_FLASH,
            Command::GetSnapshot => MSG_GET_SNAPSHOT,
            Command::GetSnapshotPage => MSG_GET_SNAPSHOT_PAGE,
            Command::Start { .. } => MSG_START,
            Command::Shutdown => MSG_SHUTDOWN,
        }
    }

    /// Frame length on the wire for this opcode.
    pub fn frame_len(&self) -> usize {
        match self {
            Command::SetTime { .. } => 9,
            Command::Start { .. } => 13,
            _ => 1,
        }
    }

    /// Little-endian u32 fields following the opcode.
    fn fields(&self) -> Vec<u32> {
        match *self {
            Command::SetTime { unix_secs } => vec![unix_secs],
            Command::Start {
                interval_secs,
                start_secs,
                end_secs,
            } => vec![interval_secs, start_secs, end_secs],
            _ => Vec::new(),
        }
    }

    /// Opcode name as the firmware headers spell it.
    pub fn name(&self) -> &'static str {
        match self {
            Command::SetTime { .. } => "SET_TIME",
            Command::GetInfo => "GET_INFO",
            Command::FirmwareInit => "FIRMWARE_INIT",
            Command::FirmwareCrc => "FIRMWARE_CRC",
            Command::FirmwareFlash => "FIRMWARE_FLASH",
            Command::GetSnapshot => "GET_SNAPSHOT",
            Command::GetSnapshotPage => "GET_SNAPSHOT_PAGE",
            Command::Start { .. } => "START",
            Command::Shutdown => "SHUTDOWN",
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_command(self.opcode(), &self.fields(), self.frame_len())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Pack an opcode and little-endian u32 fields into a zero-filled frame of
/// `frame_len` bytes. Fields that do not fit are cut off at the frame end.
pub fn encode_command(opcode: u8, fields: &[u32], frame_len: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(frame_len.max(1 + fields.len() * 4));
    buf.push(opcode);
    for &field in fields {
        buf.extend_from_slice(&field.to_le_bytes());
    }
    buf.resize(frame_len.max(1), 0);
    buf
}
