//! Payload handling module.
//!
//! Snapshot buffers coming off the device and firmware images going to it.

pub mod firmware;
pub mod snapshot;

pub use firmware::{FirmwareError, FirmwareImage};
pub use snapshot::{RetrievedSnapshot, SnapshotPayload, UploadTask};
