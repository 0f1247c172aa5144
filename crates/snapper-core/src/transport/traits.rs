//! USB Transport layer abstraction.
//!
//! Defines the `UsbTransport` trait for bulk communication with a receiver,
//! allowing different implementations (nusb, mock, etc.).

use thiserror::Error;

/// Failures below the protocol layer. Any of these ends the current operation.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("No receiver with VID {vid:04X} and a product name containing '{product}'")]
    DeviceNotFound { vid: u16, product: String },

    #[error("USB enumeration failed: {0}")]
    Enumeration(String),

    #[error("Could not open receiver: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Interface has no bulk {direction} endpoint")]
    MissingEndpoint { direction: &'static str },

    #[error("Bulk OUT transfer failed: {0}")]
    WriteFailed(String),

    #[error("Bulk IN transfer failed: {0}")]
    ReadFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("No response within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

/// Abstract USB transport interface.
///
/// One request is in flight at a time: every `write` is followed by the
/// matching `read` before the next `write`. Implementations fail rather than
/// block once the device is gone, and never retry internally.
pub trait UsbTransport: Send + Sync {
    /// Write one frame to the bulk OUT endpoint.
    fn write(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read up to `max_len` bytes from the bulk IN endpoint.
    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError>;

    /// False once the device is gone; operations then fail fast.
    fn is_connected(&self) -> bool;

    /// USB vendor ID of the open device.
    fn vendor_id(&self) -> u16;

    /// USB product ID of the open device.
    fn product_id(&self) -> u16;
}
