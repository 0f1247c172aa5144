//! nusb-based USB transport implementation.

use nusb::descriptors::TransferType;
use nusb::transfer::{Bulk, Direction, In, Out};
use nusb::{Device, Interface, MaybeFuture, list_devices};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, instrument, warn};

use super::traits::{TransportError, UsbTransport};
use crate::protocol::constants::{SNAPPER_INTERFACE, SNAPPER_PRODUCT_MATCH, SNAPPER_VENDOR_ID};

/// Receiver frames are small; one buffer covers any command.
const WRITE_BUFFER: usize = 4096;

/// A receiver opened through nusb, with interface 0 claimed.
pub struct NusbTransport {
    interface: Interface,
    in_endpoint: u8,
    out_endpoint: u8,
    vid: u16,
    pid: u16,
    /// Cleared after the first failed transfer; the session must reopen.
    open: AtomicBool,
}

impl NusbTransport {
    /// Open the first SnapperGPS receiver found.
    pub fn open() -> Result<Self, TransportError> {
        Self::open_matching(SNAPPER_VENDOR_ID, SNAPPER_PRODUCT_MATCH)
    }

    /// Open the first device with `vid` whose product string contains
    /// `product` (case-insensitive).
    #[instrument(level = "debug", fields(vid = format!("{:04X}", vid)))]
    pub fn open_matching(vid: u16, product: &str) -> Result<Self, TransportError> {
        let needle = product.to_uppercase();
        let found = list_devices()
            .wait()
            .map_err(|e| TransportError::Enumeration(e.to_string()))?
            .find(|d| {
                d.vendor_id() == vid
                    && d.product_string()
                        .is_some_and(|name| name.to_uppercase().contains(&needle))
            });

        match found {
            Some(device_info) => Self::claim(device_info),
            None => Err(TransportError::DeviceNotFound {
                vid,
                product: product.to_string(),
            }),
        }
    }

    fn claim(device_info: nusb::DeviceInfo) -> Result<Self, TransportError> {
        let (vid, pid) = (device_info.vendor_id(), device_info.product_id());
        info!(
            vendor_id = %format!("{:04X}", vid),
            product_id = %format!("{:04X}", pid),
            product = device_info.product_string().unwrap_or("?"),
            serial = device_info.serial_number().unwrap_or("?"),
            "Found receiver"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
        let interface = device
            .claim_interface(SNAPPER_INTERFACE)
            .wait()
            .map_err(|e| TransportError::ClaimInterfaceFailed {
                interface: SNAPPER_INTERFACE,
                message: e.to_string(),
            })?;

        let in_endpoint = bulk_endpoint(&device, Direction::In)
            .ok_or(TransportError::MissingEndpoint { direction: "IN" })?;
        let out_endpoint = bulk_endpoint(&device, Direction::Out)
            .ok_or(TransportError::MissingEndpoint { direction: "OUT" })?;

        info!(
            in_ep = %format!("0x{:02X}", in_endpoint),
            out_ep = %format!("0x{:02X}", out_endpoint),
            "Receiver interface claimed"
        );

        Ok(Self {
            interface,
            in_endpoint,
            out_endpoint,
            vid,
            pid,
            open: AtomicBool::new(true),
        })
    }

    fn mark_closed(&self, error: &TransportError) {
        if self.open.swap(false, Ordering::SeqCst) {
            warn!(%error, "Transfer failed, treating device as disconnected");
        }
    }

    fn bulk_write(&self, data: &[u8]) -> Result<usize, TransportError> {
        let failed = |e: std::io::Error| TransportError::WriteFailed(e.to_string());
        let endpoint = self
            .interface
            .endpoint::<Bulk, Out>(self.out_endpoint)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        let mut writer = endpoint.writer(WRITE_BUFFER);
        writer.write_all(data).map_err(failed)?;
        writer.flush().map_err(failed)?;
        Ok(data.len())
    }

    fn bulk_read(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let endpoint = self
            .interface
            .endpoint::<Bulk, In>(self.in_endpoint)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        // IN transfers must be a whole number of packets.
        let packet = endpoint.max_packet_size().max(1);
        let mut reader = endpoint.reader(max_len.div_ceil(packet).max(1) * packet);
        let mut buf = vec![0u8; max_len];
        let n = reader
            .read(&mut buf)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;
        buf.truncate(n);
        Ok(buf)
    }
}

/// Address of the first bulk endpoint of the receiver interface in `direction`.
fn bulk_endpoint(device: &Device, direction: Direction) -> Option<u8> {
    for config in device.configurations() {
        let receiver = config
            .interfaces()
            .filter(|iface| iface.interface_number() == SNAPPER_INTERFACE);
        for iface in receiver {
            for alt in iface.alt_settings() {
                let found = alt.endpoints().find(|ep| {
                    ep.transfer_type() == TransferType::Bulk && ep.direction() == direction
                });
                if let Some(ep) = found {
                    return Some(ep.address());
                }
            }
        }
    }
    None
}

impl UsbTransport for NusbTransport {
    #[instrument(level = "trace", skip(self, data), fields(len = data.len()))]
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        let result = self.bulk_write(data);
        match &result {
            Ok(n) => debug!(bytes_written = n, "Write complete"),
            Err(e) => self.mark_closed(e),
        }
        result
    }

    #[instrument(level = "trace", skip(self))]
    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        let result = self.bulk_read(max_len);
        match &result {
            Ok(buf) => debug!(bytes_read = buf.len(), "Read complete"),
            Err(e) => self.mark_closed(e),
        }
        result
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}
