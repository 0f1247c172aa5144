//! Retrieved snapshot data.

use serde::Serialize;

use crate::protocol::SnapshotMeta;
use crate::protocol::constants::SNAPSHOT_SIZE;
use crate::upload::UploadSessionId;

/// Raw signal samples of one snapshot, always [`SNAPSHOT_SIZE`] bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct SnapshotPayload(Box<[u8]>);

impl SnapshotPayload {
    /// Build from a page response: shorter pages are zero-padded, longer
    /// ones truncated.
    pub fn from_page(mut page: Vec<u8>) -> Self {
        page.resize(SNAPSHOT_SIZE, 0);
        Self(page.into_boxed_slice())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0.into_vec()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for SnapshotPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SnapshotPayload({} bytes)", self.0.len())
    }
}

impl AsRef<[u8]> for SnapshotPayload {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// One snapshot read off the device.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedSnapshot {
    /// Position in retrieval order, starting at 0.
    pub index: usize,
    pub meta: SnapshotMeta,
    #[serde(skip)]
    pub payload: SnapshotPayload,
}

/// A retrieved snapshot bound to a backend upload session.
///
/// Moved into exactly one worker and dropped after its upload attempts.
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub upload_id: UploadSessionId,
    pub index: usize,
    pub meta: SnapshotMeta,
    pub payload: SnapshotPayload,
}

impl UploadTask {
    pub fn new(upload_id: UploadSessionId, snapshot: RetrievedSnapshot) -> Self {
        Self {
            upload_id,
            index: snapshot.index,
            meta: snapshot.meta,
            payload: snapshot.payload,
        }
    }
}

#[cfg(test)]
pub(crate) fn task_for_test(index: usize) -> UploadTask {
    use crate::protocol::snapshot_meta::encode_for_test;

    let frame = encode_for_test(true, 1_650_000_000 + index as u32, 0, 1024 + 150, 410);
    let meta = SnapshotMeta::decode(&frame).unwrap_or_else(|e| panic!("{e}"));
    UploadTask {
        upload_id: UploadSessionId::new("test-upload"),
        index,
        meta,
        payload: SnapshotPayload::from_page(vec![index as u8; 16]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::SNAPSHOT_PAGE_SIZE;

    #[test]
    fn test_page_is_zero_padded() {
        let payload = SnapshotPayload::from_page(vec![0xA5; SNAPSHOT_PAGE_SIZE]);
        assert_eq!(payload.len(), SNAPSHOT_SIZE);
        assert!(payload.as_bytes()[..SNAPSHOT_PAGE_SIZE].iter().all(|&b| b == 0xA5));
        assert_eq!(&payload.as_bytes()[SNAPSHOT_PAGE_SIZE..], &[0, 0]);
    }

    #[test]
    fn test_long_page_is_truncated() {
        let payload = SnapshotPayload::from_page(vec![7; SNAPSHOT_SIZE + 100]);
        assert_eq!(payload.len(), SNAPSHOT_SIZE);
        assert_eq!(payload.into_vec(), vec![7; SNAPSHOT_SIZE]);
    }

    #[test]
    fn test_debug_hides_bytes() {
        let payload = SnapshotPayload::from_page(Vec::new());
        assert_eq!(format!("{payload:?}"), "SnapshotPayload(6138 bytes)");
    }
}
