//! Mock USB transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use super::traits::{TransportError, UsbTransport};
use crate::protocol::constants::{RESPONSE_SIZE, SNAPPER_VENDOR_ID};

/// One scripted reply to a `read`.
#[derive(Debug, Clone)]
enum Reply {
    Data(Vec<u8>),
    Fail,
}

/// Mock transport for unit testing state machine logic.
///
/// Clones share the same script and capture log, so a test can hand one
/// clone to a session and inspect the other.
#[derive(Clone)]
pub struct MockTransport {
    /// Queued replies to return on read.
    replies: Arc<Mutex<VecDeque<Reply>>>,
    /// Captured writes.
    write_log: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Requested read lengths.
    read_log: Arc<Mutex<Vec<usize>>>,
    /// Writes accepted before every further write fails.
    write_budget: Arc<Mutex<Option<usize>>>,
    /// Simulated VID/PID.
    vid: u16,
    pid: u16,
    /// Whether device is "connected".
    connected: Arc<Mutex<bool>>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            replies: Arc::new(Mutex::new(VecDeque::new())),
            write_log: Arc::new(Mutex::new(Vec::new())),
            read_log: Arc::new(Mutex::new(Vec::new())),
            write_budget: Arc::new(Mutex::new(None)),
            vid: SNAPPER_VENDOR_ID,
            pid: 0x8A4F,
            connected: Arc::new(Mutex::new(true)),
        }
    }

    /// Queue a response to be returned on next read.
    pub fn queue_response(&self, bytes: &[u8]) {
        lock(&self.replies).push_back(Reply::Data(bytes.to_vec()));
    }

    /// Queue a zero-filled 128-byte acknowledgement echoing `opcode`.
    pub fn queue_ack(&self, opcode: u8) {
        let mut frame = vec![0u8; RESPONSE_SIZE];
        frame[0] = opcode;
        self.queue_response(&frame);
    }

    /// Queue a read that fails.
    pub fn queue_read_failure(&self) {
        lock(&self.replies).push_back(Reply::Fail);
    }

    /// Let the next `n` writes succeed and fail every one after.
    pub fn fail_writes_after(&self, n: usize) {
        *lock(&self.write_budget) = Some(n);
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        lock(&self.write_log).clone()
    }

    /// Opcodes (first byte) of all captured writes.
    pub fn written_opcodes(&self) -> Vec<u8> {
        lock(&self.write_log)
            .iter()
            .filter_map(|w| w.first().copied())
            .collect()
    }

    /// Lengths requested by every read so far.
    pub fn get_read_lengths(&self) -> Vec<usize> {
        lock(&self.read_log).clone()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        lock(&self.write_log).clear();
    }

    /// Replies not yet consumed.
    pub fn pending_responses(&self) -> usize {
        lock(&self.replies).len()
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        *lock(&self.connected) = false;
    }

    /// Simulate device reconnect.
    pub fn reconnect(&self) {
        *lock(&self.connected) = true;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbTransport for MockTransport {
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        if !*lock(&self.connected) {
            return Err(TransportError::Disconnected);
        }
        if let Some(budget) = lock(&self.write_budget).as_mut() {
            if *budget == 0 {
                return Err(TransportError::WriteFailed("injected write failure".into()));
            }
            *budget -= 1;
        }
        lock(&self.write_log).push(data.to_vec());
        Ok(data.len())
    }

    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        if !*lock(&self.connected) {
            return Err(TransportError::Disconnected);
        }
        lock(&self.read_log).push(max_len);
        match lock(&self.replies).pop_front() {
            Some(Reply::Data(mut bytes)) => {
                bytes.truncate(max_len);
                Ok(bytes)
            }
            Some(Reply::Fail) => Err(TransportError::ReadFailed("injected read failure".into())),
            None => Err(TransportError::Timeout { timeout_ms: 5000 }),
        }
    }

    fn is_connected(&self) -> bool {
        *lock(&self.connected)
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_response_queue() {
        let mock = MockTransport::new();
        mock.queue_ack(0x02);
        mock.queue_response(&[0x81, 0x00]);

        let first = mock.read(RESPONSE_SIZE).unwrap();
        assert_eq!(first.len(), RESPONSE_SIZE);
        assert_eq!(first[0], 0x02);

        assert_eq!(mock.read(RESPONSE_SIZE).unwrap(), vec![0x81, 0x00]);

        // Queue is empty now
        assert!(matches!(
            mock.read(RESPONSE_SIZE),
            Err(TransportError::Timeout { .. })
        ));
        assert_eq!(mock.get_read_lengths(), vec![RESPONSE_SIZE; 3]);
    }

    #[test]
    fn test_mock_write_capture() {
        let mock = MockTransport::new();
        mock.write(&[0x81]).unwrap();
        mock.write(&[0x84]).unwrap();

        assert_eq!(mock.get_writes(), vec![vec![0x81], vec![0x84]]);
        assert_eq!(mock.written_opcodes(), vec![0x81, 0x84]);
    }

    #[test]
    fn test_injected_failures() {
        let mock = MockTransport::new();
        mock.queue_read_failure();
        assert!(matches!(
            mock.read(8),
            Err(TransportError::ReadFailed(_))
        ));

        mock.fail_writes_after(1);
        assert!(mock.write(&[1]).is_ok());
        assert!(mock.write(&[2]).is_err());
        assert_eq!(mock.get_writes().len(), 1);
    }

    #[test]
    fn test_mock_disconnect() {
        let mock = MockTransport::new();
        let handle = mock.clone();
        assert!(mock.is_connected());

        handle.disconnect();
        assert!(!mock.is_connected());
        assert!(matches!(
            mock.write(&[0x02]),
            Err(TransportError::Disconnected)
        ));
        assert!(mock.read(1).is_err());

        handle.reconnect();
        assert!(mock.is_connected());
    }
}
