//! In-memory upload backend for tests and dry runs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use super::backend::{
    ReferencePoint, UploadBackend, UploadError, UploadRequest, UploadSessionId,
};
use crate::payload::UploadTask;

#[derive(Debug, Default)]
struct Log {
    started: Vec<UploadRequest>,
    attempts: BTreeMap<usize, u32>,
    stored: Vec<usize>,
    payloads: BTreeMap<usize, Vec<u8>>,
    reference_points: Vec<ReferencePoint>,
    finished: Vec<(UploadSessionId, String)>,
    cancelled: Vec<UploadSessionId>,
}

/// Records every call and fails the snapshots it is told to fail.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    log: Mutex<Log>,
    failing: BTreeSet<usize>,
    fail_reference_points: bool,
    delay: Duration,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every attempt for these snapshot indices.
    pub fn failing(mut self, indices: impl IntoIterator<Item = usize>) -> Self {
        self.failing.extend(indices);
        self
    }

    /// Reject every reference point.
    pub fn failing_reference_points(mut self) -> Self {
        self.fail_reference_points = true;
        self
    }

    /// Hold each snapshot upload for `delay`, so concurrent uploads overlap.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn log(&self) -> MutexGuard<'_, Log> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Upload attempts per snapshot index.
    pub fn attempts(&self) -> BTreeMap<usize, u32> {
        self.log().attempts.clone()
    }

    /// Indices stored successfully, in completion order.
    pub fn stored(&self) -> Vec<usize> {
        self.log().stored.clone()
    }

    /// Bytes received per stored snapshot index.
    pub fn payloads(&self) -> BTreeMap<usize, Vec<u8>> {
        self.log().payloads.clone()
    }

    pub fn started(&self) -> Vec<UploadRequest> {
        self.log().started.clone()
    }

    pub fn reference_points(&self) -> Vec<ReferencePoint> {
        self.log().reference_points.clone()
    }

    /// `(upload id, earliest processing date)` per finish call.
    pub fn finished(&self) -> Vec<(UploadSessionId, String)> {
        self.log().finished.clone()
    }

    pub fn cancelled(&self) -> Vec<UploadSessionId> {
        self.log().cancelled.clone()
    }

    /// Most snapshot uploads ever running at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

impl UploadBackend for MemoryBackend {
    fn start_upload(&self, request: &UploadRequest) -> Result<UploadSessionId, UploadError> {
        let mut log = self.log();
        log.started.push(request.clone());
        Ok(UploadSessionId::new(format!("upload-{}", log.started.len())))
    }

    fn upload_snapshot(&self, task: &UploadTask) -> Result<(), UploadError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }

        let result = {
            let mut log = self.log();
            *log.attempts.entry(task.index).or_default() += 1;
            if self.failing.contains(&task.index) {
                Err(UploadError::Rejected(format!("snapshot {}", task.index)))
            } else {
                log.stored.push(task.index);
                log.payloads
                    .insert(task.index, task.payload.as_bytes().to_vec());
                Ok(())
            }
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn add_reference_point(
        &self,
        _id: &UploadSessionId,
        point: &ReferencePoint,
    ) -> Result<(), UploadError> {
        if self.fail_reference_points {
            return Err(UploadError::Rejected("reference point".into()));
        }
        self.log().reference_points.push(*point);
        Ok(())
    }

    fn finish_upload(
        &self,
        id: &UploadSessionId,
        earliest_processing: &str,
    ) -> Result<(), UploadError> {
        self.log()
            .finished
            .push((id.clone(), earliest_processing.to_string()));
        Ok(())
    }

    fn cancel_upload(&self, id: &UploadSessionId) -> Result<(), UploadError> {
        self.log().cancelled.push(id.clone());
        Ok(())
    }
}
