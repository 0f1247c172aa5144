//! Snapper-Core: host side of the SnapperGPS receiver USB protocol.
//!
//! This crate talks to a SnapperGPS receiver over its bulk USB interface:
//! reading device status, scheduling recordings, pulling stored GNSS
//! snapshots off the device and uploading them to a processing server, and
//! flashing new firmware.
//!
//! # Architecture
//!
//! - **Protocol**: Opcodes, command frames and response decoding
//! - **CRC**: CRC16 used to verify firmware images
//! - **Transport**: USB communication abstraction (nusb, mock)
//! - **State**: Snapshot retrieval and firmware update state machines
//! - **Upload**: Backend client, retry policy and the concurrent upload queue
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: One owned handle per connected receiver
//! - **Export**: Writes retrieved snapshots to disk and reads them back
//!
//! # Example
//!
//! ```no_run
//! use snapper_core::session::{DeviceSession, SessionConfig};
//!
//! let session = DeviceSession::open(SessionConfig::default())?;
//! let info = session.refresh_info()?;
//! println!("{} has {} snapshots", info.device_id_hex(), info.snapshot_count);
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod crc;
pub mod error;
pub mod events;
pub mod export;
pub mod payload;
pub mod protocol;
pub mod session;
pub mod state;
pub mod transport;
pub mod upload;

// Re-exports for convenience
pub use error::ProtocolError;
pub use events::{LogLevel, SnapperEvent, SnapperObserver, SnapperPhase, TracingObserver};
pub use export::{ArchiveSummary, ExportError, ImportedArchive, SnapshotArchive};
pub use payload::{FirmwareImage, RetrievedSnapshot, SnapshotPayload, UploadTask};
pub use protocol::{Command, DeviceInfo, SnapshotMeta};
pub use session::{
    DeviceSession, RecordingWindow, ReferenceLocation, SessionConfig, TransferMode,
    UploadOptions, UploadSummary, upload_archive, wait_for_device,
};
pub use transport::{MockTransport, NusbTransport, TransportError, UsbTransport};
pub use upload::{
    HttpBackend, MemoryBackend, ProcessingPriority, RetryPolicy, UploadBackend, UploadError,
    UploadQueue, UploadReport, UploadRequest,
};
