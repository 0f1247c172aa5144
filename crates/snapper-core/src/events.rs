//! Event system for UI decoupling.
//!
//! The CLI (or any other front end) subscribes to session progress without
//! the core knowing how it is displayed.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use tracing::{debug, error, info, trace, warn};

/// Severity of a [`SnapperEvent::Log`] line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// What the session is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapperPhase {
    /// Waiting for the receiver to enumerate.
    WaitingForDevice,
    /// Connected, no multi-step operation running.
    Idle,
    Retrieving,
    Uploading,
    FlashingFirmware,
}

impl fmt::Display for SnapperPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SnapperPhase::WaitingForDevice => "Waiting for Device",
            SnapperPhase::Idle => "Idle",
            SnapperPhase::Retrieving => "Retrieving Snapshots",
            SnapperPhase::Uploading => "Uploading Snapshots",
            SnapperPhase::FlashingFirmware => "Flashing Firmware",
        };
        f.write_str(name)
    }
}

/// Events emitted by a device session.
#[derive(Debug, Clone)]
pub enum SnapperEvent {
    DeviceConnected { vid: u16, pid: u16 },
    /// A transfer failed because the receiver went away.
    DeviceDisconnected,
    PhaseChanged { from: SnapperPhase, to: SnapperPhase },
    /// Step `current` of `total` in a counted operation, such as firmware pages.
    Progress {
        phase: SnapperPhase,
        operation: String,
        current: u64,
        total: u64,
    },
    /// Running count of snapshots read off the device.
    SnapshotTransferred { count: usize },
    /// One upload task finished; `completed` counts finished tasks so far.
    SnapshotUploaded {
        index: usize,
        success: bool,
        completed: usize,
    },
    /// A milestone worth showing to the user.
    Log { level: LogLevel, message: String },
    /// Terminal error, already formatted for display.
    Error { message: String },
    /// One frame on the wire. `data` holds at most the first 32 bytes.
    Packet {
        direction: PacketDirection,
        opcode: Option<u8>,
        length: usize,
        data: Option<Vec<u8>>,
    },
    /// The current operation finished successfully.
    Complete,
}

/// Which way a frame travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    /// Host to device.
    Tx,
    /// Device to host.
    Rx,
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PacketDirection::Tx => "TX",
            PacketDirection::Rx => "RX",
        })
    }
}

/// Receives session events.
///
/// Upload workers report from their own threads, hence `Send + Sync`.
pub trait SnapperObserver: Send + Sync {
    fn on_event(&self, event: &SnapperEvent);
}

/// Discards every event.
pub struct NullObserver;

impl SnapperObserver for NullObserver {
    fn on_event(&self, _event: &SnapperEvent) {}
}

/// Forwards events to `tracing`.
pub struct TracingObserver;

fn percent(current: u64, total: u64) -> u64 {
    (current * 100).checked_div(total).unwrap_or(0)
}

impl SnapperObserver for TracingObserver {
    fn on_event(&self, event: &SnapperEvent) {
        match event {
            SnapperEvent::DeviceConnected { vid, pid } => {
                info!(vid = %format!("{vid:04X}"), pid = %format!("{pid:04X}"), "Device connected");
            }
            SnapperEvent::DeviceDisconnected => warn!("Device disconnected"),
            SnapperEvent::PhaseChanged { from, to } => {
                debug!(from = %from, to = %to, "Phase changed");
            }
            SnapperEvent::Progress {
                phase,
                operation,
                current,
                total,
            } => {
                // Firmware pages: log every tenth step and the last one.
                if current % 10 == 0 || current == total {
                    info!(
                        phase = %phase,
                        operation = %operation,
                        progress = %format!("{}%", percent(*current, *total)),
                        "{current}/{total}"
                    );
                }
            }
            SnapperEvent::SnapshotTransferred { count } => debug!(count, "Snapshot transferred"),
            SnapperEvent::SnapshotUploaded {
                index,
                success: true,
                completed,
            } => debug!(index, completed, "Snapshot uploaded"),
            SnapperEvent::SnapshotUploaded {
                index, completed, ..
            } => warn!(index, completed, "Snapshot upload failed"),
            SnapperEvent::Log { level, message } => match level {
                LogLevel::Trace => trace!("{message}"),
                LogLevel::Debug => debug!("{message}"),
                LogLevel::Info => info!("{message}"),
                LogLevel::Warn => warn!("{message}"),
                LogLevel::Error => error!("{message}"),
            },
            SnapperEvent::Error { message } => error!("{message}"),
            SnapperEvent::Packet {
                direction,
                opcode,
                length,
                ..
            } => trace!(
                dir = %direction,
                opcode = %opcode.map(|op| format!("0x{op:02X}")).unwrap_or_default(),
                len = length,
                "USB frame"
            ),
            SnapperEvent::Complete => info!("Operation complete"),
        }
    }
}

/// Keeps every event, for tests and scripted front ends.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<SnapperEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything received so far.
    pub fn events(&self) -> Vec<SnapperEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl SnapperObserver for RecordingObserver {
    fn on_event(&self, event: &SnapperEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_display() {
        let names: Vec<_> = [
            SnapperPhase::WaitingForDevice,
            SnapperPhase::Idle,
            SnapperPhase::Retrieving,
            SnapperPhase::Uploading,
            SnapperPhase::FlashingFirmware,
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        assert_eq!(
            names,
            [
                "Waiting for Device",
                "Idle",
                "Retrieving Snapshots",
                "Uploading Snapshots",
                "Flashing Firmware"
            ]
        );
        assert_eq!(PacketDirection::Rx.to_string(), "RX");
    }

    #[test]
    fn test_percent_handles_empty_total() {
        assert_eq!(percent(5, 0), 0);
        assert_eq!(percent(12, 24), 50);
    }

    #[test]
    fn test_recording_observer_keeps_order() {
        let observer = RecordingObserver::new();
        observer.on_event(&SnapperEvent::SnapshotTransferred { count: 1 });
        observer.on_event(&SnapperEvent::Complete);

        let events = observer.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], SnapperEvent::SnapshotTransferred { count: 1 }));
        assert!(matches!(events[1], SnapperEvent::Complete));
    }
}
