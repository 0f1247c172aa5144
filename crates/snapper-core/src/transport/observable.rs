//! Transport wrapper that reports every frame to an observer.

use crate::events::{PacketDirection, SnapperEvent, SnapperObserver};

use super::traits::{TransportError, UsbTransport};

/// Bytes of each frame copied into a packet event.
const PACKET_PREVIEW: usize = 32;

/// Transport wrapper that emits packet events.
pub struct ObservableTransport<'a, T: UsbTransport, O: SnapperObserver + ?Sized> {
    inner: &'a T,
    observer: &'a O,
}

impl<'a, T: UsbTransport, O: SnapperObserver + ?Sized> ObservableTransport<'a, T, O> {
    pub fn new(inner: &'a T, observer: &'a O) -> Self {
        Self { inner, observer }
    }
}

impl<T: UsbTransport, O: SnapperObserver + ?Sized> UsbTransport for ObservableTransport<'_, T, O> {
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        let res = self.inner.write(data);
        if res.is_ok() {
            self.observer.on_event(&SnapperEvent::Packet {
                direction: PacketDirection::Tx,
                opcode: data.first().copied(),
                length: data.len(),
                data: Some(data.iter().take(PACKET_PREVIEW).copied().collect()),
            });
        }
        res
    }

    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let res = self.inner.read(max_len);
        if let Ok(data) = &res
            && !data.is_empty()
        {
            self.observer.on_event(&SnapperEvent::Packet {
                direction: PacketDirection::Rx,
                opcode: None,
                length: data.len(),
                data: Some(data.iter().take(PACKET_PREVIEW).copied().collect()),
            });
        }
        res
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn vendor_id(&self) -> u16 {
        self.inner.vendor_id()
    }

    fn product_id(&self) -> u16 {
        self.inner.product_id()
    }
}
