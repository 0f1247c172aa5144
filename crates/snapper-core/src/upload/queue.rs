//! Bounded-concurrency upload queue.
//!
//! Retrieval produces tasks while workers upload them. All shared counters
//! live in one `QueueState` behind one mutex, and completion (`closed`, no
//! busy worker, every enqueued task taken) is tested and recorded in the same
//! critical section that changes any of its inputs. Whichever of the
//! producer's [`UploadQueue::close`] and the last worker gets there first
//! marks the queue finished; `run` alone then calls its completion hook, so
//! the hook runs exactly once.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use super::backend::UploadBackend;
use super::policy::RetryPolicy;
use crate::error::ProtocolError;
use crate::events::{SnapperEvent, SnapperObserver};
use crate::payload::UploadTask;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<UploadTask>,
    /// Tasks ever enqueued.
    enqueued: usize,
    /// Tasks taken by a worker.
    read_index: usize,
    busy: usize,
    peak_busy: usize,
    /// Producer will enqueue nothing more.
    closed: bool,
    /// Producer failed; pending tasks were dropped.
    aborted: bool,
    discarded: usize,
    finished: bool,
    uploaded: usize,
    failures: Vec<ProtocolError>,
    earliest: Option<DateTime<Utc>>,
    latest: Option<DateTime<Utc>>,
}

impl QueueState {
    /// Check-and-act: marks the queue finished at most once.
    fn try_finish(&mut self) -> bool {
        if self.finished || self.busy > 0 {
            return false;
        }
        let drained = self.read_index + self.discarded == self.enqueued;
        if (self.closed || self.aborted) && drained {
            self.finished = true;
            return true;
        }
        false
    }
}

/// Outcome of one queue run.
#[derive(Debug, Default)]
pub struct UploadReport {
    pub enqueued: usize,
    pub uploaded: usize,
    /// One [`ProtocolError::UploadFailed`] per task that ran out of attempts.
    pub failures: Vec<ProtocolError>,
    /// Most workers busy at the same time.
    pub peak_busy: usize,
    /// Tasks dropped unstarted because the producer aborted.
    pub discarded: usize,
    pub aborted: bool,
    /// Earliest and latest snapshot timestamps enqueued.
    pub earliest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
}

impl UploadReport {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

/// FIFO of upload tasks drained by a pool of workers.
pub struct UploadQueue {
    state: Mutex<QueueState>,
    /// Wakes workers: new task, close or abort.
    work: Condvar,
    /// Wakes `run` once the queue is finished.
    done: Condvar,
    policy: RetryPolicy,
}

impl UploadQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            work: Condvar::new(),
            done: Condvar::new(),
            policy,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a task. After `close` or `abort` the task is handed back.
    pub fn enqueue(&self, task: UploadTask) -> Result<(), UploadTask> {
        let mut state = self.lock();
        if state.closed || state.aborted {
            return Err(task);
        }
        let at = task.meta.timestamp;
        state.earliest = Some(state.earliest.map_or(at, |t| t.min(at)));
        state.latest = Some(state.latest.map_or(at, |t| t.max(at)));
        state.enqueued += 1;
        state.pending.push_back(task);
        drop(state);
        self.work.notify_one();
        Ok(())
    }

    /// The producer is done; the queue finishes once drained.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        let finished = state.try_finish();
        drop(state);
        self.work.notify_all();
        if finished {
            debug!("Queue finished on close");
            self.done.notify_all();
        }
    }

    /// The producer failed: drop pending tasks and let in-flight ones end.
    pub fn abort(&self) {
        let mut state = self.lock();
        state.aborted = true;
        let dropped = state.pending.len();
        state.pending.clear();
        state.discarded += dropped;
        let finished = state.try_finish();
        drop(state);
        if dropped > 0 {
            warn!(dropped, "Upload queue aborted");
        }
        self.work.notify_all();
        if finished {
            self.done.notify_all();
        }
    }

    pub fn peak_busy(&self) -> usize {
        self.lock().peak_busy
    }

    /// Tasks enqueued but not yet taken by a worker.
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Drain the queue with up to `max_workers` concurrent uploads.
    ///
    /// Returns after the queue is closed (or aborted) and every taken task
    /// has finished. `on_complete` is called exactly once, with the final
    /// report, before `run` returns its result.
    #[instrument(skip_all, fields(max_workers = max_workers))]
    pub fn run<B, O, F, R>(
        &self,
        backend: &B,
        observer: &O,
        max_workers: usize,
        on_complete: F,
    ) -> R
    where
        B: UploadBackend + ?Sized,
        O: SnapperObserver + ?Sized,
        F: FnOnce(UploadReport) -> R,
    {
        let workers = max_workers.max(1);
        info!(workers, "Upload workers starting");

        thread::scope(|scope| {
            for worker in 0..workers {
                scope.spawn(move || self.work_loop(worker, backend, observer));
            }

            let mut state = self.lock();
            while !state.finished {
                state = self
                    .done
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        });

        let report = self.take_report();
        info!(
            uploaded = report.uploaded,
            failed = report.failed(),
            peak_busy = report.peak_busy,
            aborted = report.aborted,
            "Upload queue drained"
        );
        on_complete(report)
    }

    fn take_report(&self) -> UploadReport {
        let mut state = self.lock();
        UploadReport {
            enqueued: state.enqueued,
            uploaded: state.uploaded,
            failures: std::mem::take(&mut state.failures),
            peak_busy: state.peak_busy,
            discarded: state.discarded,
            aborted: state.aborted,
            earliest: state.earliest,
            latest: state.latest,
        }
    }

    /// Next task, or `None` once nothing more will arrive.
    fn next_task(&self) -> Option<UploadTask> {
        let mut state = self.lock();
        loop {
            if let Some(task) = state.pending.pop_front() {
                state.read_index += 1;
                state.busy += 1;
                state.peak_busy = state.peak_busy.max(state.busy);
                return Some(task);
            }
            if state.closed || state.aborted {
                return None;
            }
            state = self
                .work
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn work_loop<B, O>(&self, worker: usize, backend: &B, observer: &O)
    where
        B: UploadBackend + ?Sized,
        O: SnapperObserver + ?Sized,
    {
        while let Some(task) = self.next_task() {
            let index = task.index;
            debug!(worker, index, "Uploading snapshot");
            let result = self
                .policy
                .run("snapshot upload", |_| backend.upload_snapshot(&task));
            drop(task);

            let success = result.is_ok();
            let mut state = self.lock();
            state.busy -= 1;
            match result {
                Ok(()) => state.uploaded += 1,
                Err(exhausted) => state.failures.push(ProtocolError::UploadFailed {
                    index,
                    attempts: exhausted.attempts,
                    source: exhausted.last_error,
                }),
            }
            let completed = state.uploaded + state.failures.len();
            let finished = state.try_finish();
            drop(state);

            observer.on_event(&SnapperEvent::SnapshotUploaded {
                index,
                success,
                completed,
            });
            if finished {
                debug!(worker, "Queue finished by worker");
                self.done.notify_all();
            }
        }
        debug!(worker, "Upload worker exiting");
    }
}
