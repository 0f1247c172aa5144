//! Protocol-level error taxonomy.

use thiserror::Error;

use crate::export::ExportError;
use crate::payload::FirmwareError;
use crate::protocol::FrameError;
use crate::session::TransferMode;
use crate::transport::TransportError;
use crate::upload::UploadError;

/// Errors surfaced by the state machines and the device session.
///
/// None of these are retried inside the protocol layer; only individual
/// snapshot uploads are retried, by the upload queue.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Device unavailable: {reason}")]
    TransportUnavailable { reason: String },

    #[error("Malformed response: {0}")]
    Malformed(#[from] FrameError),

    #[error("Transfer aborted during {stage}: {source}")]
    TransferAborted {
        stage: &'static str,
        #[source]
        source: TransportError,
    },

    #[error("Firmware CRC mismatch: host 0x{expected:04X}, device 0x{reported:04X}")]
    IntegrityMismatch { expected: u16, reported: u16 },

    #[error("Upload of snapshot {index} failed after {attempts} attempts: {source}")]
    UploadFailed {
        index: usize,
        attempts: u32,
        #[source]
        source: UploadError,
    },

    #[error("Device session busy: {active} in progress")]
    Busy { active: TransferMode },

    #[error("Invalid transition: {event} in state {state}")]
    InvalidTransition { state: String, event: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Stopped after {limit} snapshots without an end-of-data marker")]
    SnapshotLimit { limit: usize },

    #[error("Firmware image: {0}")]
    Firmware(#[from] FirmwareError),

    #[error("Upload session: {0}")]
    Upload(#[from] UploadError),

    #[error("Snapshot archive: {0}")]
    Export(#[from] ExportError),
}

impl ProtocolError {
    pub(crate) fn aborted(stage: &'static str, source: TransportError) -> Self {
        ProtocolError::TransferAborted { stage, source }
    }

    /// True when the failure means the device is gone or out of sync and the
    /// session should be reopened before further use.
    pub fn invalidates_session(&self) -> bool {
        matches!(
            self,
            ProtocolError::TransportUnavailable { .. } | ProtocolError::TransferAborted { .. }
        )
    }
}
