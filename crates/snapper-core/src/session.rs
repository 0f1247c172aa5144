//! Device session - one owned handle per connected receiver.
//!
//! Every operation that talks to the device goes through a
//! [`DeviceSession`], which owns the transport, the last device info and the
//! transfer mode. Long operations claim the mode for their whole duration
//! and release it on every exit path, so retrieval, upload and firmware
//! update never share the transport.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::ProtocolError;
use crate::events::{LogLevel, SnapperEvent, SnapperObserver, SnapperPhase, TracingObserver};
use crate::export::{ArchiveSummary, SnapshotArchive};
use crate::payload::{FirmwareImage, RetrievedSnapshot, UploadTask};
use crate::protocol::constants::{
    FIRMWARE_SIZE, FLASH_PAGE_SIZE, RESPONSE_SIZE, SNAPPER_PRODUCT_MATCH, SNAPPER_VENDOR_ID,
};
use crate::protocol::{Command, DeviceInfo};
use crate::state::{FirmwareUpdate, SnapshotRetrieval, drive};
use crate::transport::{NusbTransport, ObservableTransport, TransportError, UsbTransport};
use crate::upload::{
    ProcessingPriority, ReferencePoint, RetryPolicy, UploadBackend, UploadQueue, UploadReport,
    UploadRequest, UploadSessionId,
};

/// Configuration for a device session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// USB vendor ID of the receiver.
    pub vendor_id: u16,
    /// Case-insensitive substring of the USB product string.
    pub product_match: String,
    /// Base URL of the upload server.
    pub backend_url: String,
    /// Concurrent snapshot uploads.
    pub max_workers: usize,
    /// Attempts per snapshot upload.
    pub retry: RetryPolicy,
    /// Stop retrieval after this many snapshots without an end marker.
    pub max_snapshots: usize,
    /// Firmware slot size used when the device reports none.
    pub firmware_size: usize,
    /// Flash page size used when the device reports none.
    pub flash_page_size: usize,
    /// How long to wait for the receiver to enumerate.
    pub connect_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            vendor_id: SNAPPER_VENDOR_ID,
            product_match: SNAPPER_PRODUCT_MATCH.to_string(),
            backend_url: "http://localhost:3000".to_string(),
            max_workers: 4,
            retry: RetryPolicy::default(),
            max_snapshots: 65_536,
            firmware_size: FIRMWARE_SIZE,
            flash_page_size: FLASH_PAGE_SIZE,
            connect_timeout_secs: 30,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Which multi-step operation currently owns the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Idle,
    Retrieving,
    Uploading,
    FlashingFirmware,
}

impl TransferMode {
    fn phase(self) -> SnapperPhase {
        match self {
            TransferMode::Idle => SnapperPhase::Idle,
            TransferMode::Retrieving => SnapperPhase::Retrieving,
            TransferMode::Uploading => SnapperPhase::Uploading,
            TransferMode::FlashingFirmware => SnapperPhase::FlashingFirmware,
        }
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferMode::Idle => write!(f, "idle"),
            TransferMode::Retrieving => write!(f, "snapshot retrieval"),
            TransferMode::Uploading => write!(f, "snapshot upload"),
            TransferMode::FlashingFirmware => write!(f, "firmware update"),
        }
    }
}

/// A recording schedule for START.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordingWindow {
    /// Seconds between snapshots.
    pub interval_secs: u32,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl RecordingWindow {
    fn command(&self) -> Result<Command, ProtocolError> {
        if self.interval_secs == 0 {
            return Err(ProtocolError::InvalidArgument(
                "snapshot interval must be positive".into(),
            ));
        }
        if self.end <= self.start {
            return Err(ProtocolError::InvalidArgument(format!(
                "recording ends ({}) before it starts ({})",
                self.end, self.start
            )));
        }
        Ok(Command::Start {
            interval_secs: self.interval_secs,
            start_secs: device_seconds(self.start)?,
            end_secs: device_seconds(self.end)?,
        })
    }
}

/// Device clocks count whole UNIX seconds in 32 bits; round to nearest.
fn device_seconds(at: DateTime<Utc>) -> Result<u32, ProtocolError> {
    let secs = (at.timestamp_millis() + 500).div_euclid(1000);
    u32::try_from(secs)
        .map_err(|_| ProtocolError::InvalidArgument(format!("{at} is outside the device clock range")))
}

/// Known position of the receiver, used to anchor the track.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferenceLocation {
    pub lat: f64,
    pub lng: f64,
    /// When the receiver was at this position at the start; defaults to the
    /// first snapshot.
    pub start: Option<DateTime<Utc>>,
    /// Likewise at the end; defaults to the last snapshot.
    pub end: Option<DateTime<Utc>>,
}

/// How an upload is finalized.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UploadOptions {
    pub priority: ProcessingPriority,
    pub reference: Option<ReferenceLocation>,
}

/// Result of a completed upload.
#[derive(Debug)]
pub struct UploadSummary {
    pub upload_id: UploadSessionId,
    pub report: UploadReport,
    /// Set once the server accepted the finished upload; `None` when there
    /// was nothing to upload and the server-side upload was cancelled.
    pub earliest_processing: Option<String>,
}

/// Releases the transfer mode when dropped.
struct ModeGuard<'a, O: SnapperObserver> {
    mode: &'a Mutex<TransferMode>,
    observer: &'a O,
    held: TransferMode,
}

impl<O: SnapperObserver> Drop for ModeGuard<'_, O> {
    fn drop(&mut self) {
        *lock(self.mode) = TransferMode::Idle;
        self.observer.on_event(&SnapperEvent::PhaseChanged {
            from: self.held.phase(),
            to: SnapperPhase::Idle,
        });
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An open receiver.
pub struct DeviceSession<T: UsbTransport, O: SnapperObserver> {
    transport: T,
    observer: Arc<O>,
    config: SessionConfig,
    mode: Mutex<TransferMode>,
    info: Mutex<Option<DeviceInfo>>,
}

impl DeviceSession<NusbTransport, TracingObserver> {
    /// Wait for a receiver and open it, logging through tracing.
    pub fn open(config: SessionConfig) -> Result<Self> {
        Self::open_with_observer(config, Arc::new(TracingObserver))
    }
}

impl<O: SnapperObserver> DeviceSession<NusbTransport, O> {
    /// Wait for a receiver and open it.
    pub fn open_with_observer(config: SessionConfig, observer: Arc<O>) -> Result<Self> {
        observer.on_event(&SnapperEvent::PhaseChanged {
            from: SnapperPhase::Idle,
            to: SnapperPhase::WaitingForDevice,
        });
        let transport = wait_for_device(&config)?;
        Ok(Self::with_transport(transport, config, observer))
    }
}

impl<T: UsbTransport, O: SnapperObserver> DeviceSession<T, O> {
    /// Wrap an already open transport.
    pub fn with_transport(transport: T, config: SessionConfig, observer: Arc<O>) -> Self {
        observer.on_event(&SnapperEvent::DeviceConnected {
            vid: transport.vendor_id(),
            pid: transport.product_id(),
        });
        Self {
            transport,
            observer,
            config,
            mode: Mutex::new(TransferMode::Idle),
            info: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn mode(&self) -> TransferMode {
        *lock(&self.mode)
    }

    /// Device info from the last successful [`refresh_info`](Self::refresh_info).
    pub fn device_info(&self) -> Option<DeviceInfo> {
        lock(&self.info).clone()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    fn ensure_connected(&self) -> Result<(), ProtocolError> {
        if self.transport.is_connected() {
            Ok(())
        } else {
            Err(ProtocolError::TransportUnavailable {
                reason: "no receiver connected".into(),
            })
        }
    }

    /// Claim the transport for a multi-step operation.
    fn begin(&self, mode: TransferMode) -> Result<ModeGuard<'_, O>, ProtocolError> {
        self.ensure_connected()?;
        let mut current = lock(&self.mode);
        if *current != TransferMode::Idle {
            return Err(ProtocolError::Busy { active: *current });
        }
        *current = mode;
        drop(current);

        self.observer.on_event(&SnapperEvent::PhaseChanged {
            from: SnapperPhase::Idle,
            to: mode.phase(),
        });
        Ok(ModeGuard {
            mode: &self.mode,
            observer: self.observer.as_ref(),
            held: mode,
        })
    }

    fn observed(&self) -> ObservableTransport<'_, T, O> {
        ObservableTransport::new(&self.transport, self.observer.as_ref())
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.observer.on_event(&SnapperEvent::Log {
            level,
            message: message.into(),
        });
    }

    /// Report a fatal error to the observer and hand it back.
    fn fail(&self, err: ProtocolError) -> ProtocolError {
        if err.invalidates_session() && !self.transport.is_connected() {
            self.observer.on_event(&SnapperEvent::DeviceDisconnected);
        }
        debug!(error = ?err, "Operation failed");
        self.observer.on_event(&SnapperEvent::Error {
            message: err.to_string(),
        });
        err
    }

    /// Send one command and read its 128-byte response, holding the mode
    /// lock so no multi-step operation can start in between.
    fn exchange(&self, command: Command) -> Result<Vec<u8>, ProtocolError> {
        self.ensure_connected()?;
        let mode = lock(&self.mode);
        if *mode != TransferMode::Idle {
            return Err(ProtocolError::Busy { active: *mode });
        }

        let transport = self.observed();
        let stage = command.name();
        transport
            .write(&command.encode())
            .map_err(|e| ProtocolError::aborted(stage, e))?;
        let response = transport
            .read(RESPONSE_SIZE)
            .map_err(|e| ProtocolError::aborted(stage, e))?;
        drop(mode);

        if response.is_empty() {
            return Err(ProtocolError::aborted(
                stage,
                TransportError::ReadFailed("empty response".into()),
            ));
        }
        Ok(response)
    }

    /// Read and cache the device info. A failed read clears the cache.
    #[instrument(skip(self))]
    pub fn refresh_info(&self) -> Result<DeviceInfo, ProtocolError> {
        let result = self
            .exchange(Command::GetInfo)
            .and_then(|frame| DeviceInfo::decode(&frame).map_err(ProtocolError::from));

        let mut cached = lock(&self.info);
        match result {
            Ok(info) => {
                info!(
                    device_id = %info.device_id_hex(),
                    firmware = %info.firmware_version,
                    snapshots = info.snapshot_count,
                    status = %info.status,
                    "Device info"
                );
                *cached = Some(info.clone());
                Ok(info)
            }
            Err(e) => {
                *cached = None;
                drop(cached);
                Err(self.fail(e))
            }
        }
    }

    /// Set the device clock.
    #[instrument(skip(self))]
    pub fn set_time(&self, now: DateTime<Utc>) -> Result<(), ProtocolError> {
        let unix_secs = device_seconds(now)?;
        self.exchange(Command::SetTime { unix_secs })
            .map_err(|e| self.fail(e))?;
        self.log(LogLevel::Info, format!("Device clock set to {unix_secs}"));
        Ok(())
    }

    /// Schedule a recording window.
    #[instrument(skip(self))]
    pub fn start_recording(&self, window: RecordingWindow) -> Result<(), ProtocolError> {
        let command = window.command()?;
        self.exchange(command).map_err(|e| self.fail(e))?;
        self.log(
            LogLevel::Info,
            format!(
                "Recording every {}s from {} to {}",
                window.interval_secs, window.start, window.end
            ),
        );
        Ok(())
    }

    /// Make the device shut down once unplugged.
    #[instrument(skip(self))]
    pub fn shutdown(&self) -> Result<(), ProtocolError> {
        self.exchange(Command::Shutdown).map_err(|e| self.fail(e))?;
        self.log(LogLevel::Info, "Device will shut down when unplugged");
        Ok(())
    }

    /// Run snapshot retrieval, passing each snapshot to `sink`.
    fn retrieve<F>(&self, mut sink: F) -> Result<usize, ProtocolError>
    where
        F: FnMut(RetrievedSnapshot) -> Result<(), ProtocolError>,
    {
        let limit = self.config.max_snapshots;
        let transport = self.observed();
        let mut machine = SnapshotRetrieval::new();
        drive(&mut machine, &transport, |snapshot| {
            if snapshot.index >= limit {
                return Err(ProtocolError::SnapshotLimit { limit });
            }
            self.observer.on_event(&SnapperEvent::SnapshotTransferred {
                count: snapshot.index + 1,
            });
            sink(snapshot)
        })?;
        Ok(machine.emitted())
    }

    /// Read every stored snapshot and hand it to `sink`. Returns the count.
    #[instrument(skip_all)]
    pub fn transfer_snapshots<F>(&self, sink: F) -> Result<usize, ProtocolError>
    where
        F: FnMut(RetrievedSnapshot) -> Result<(), ProtocolError>,
    {
        let _mode = self.begin(TransferMode::Retrieving)?;
        let count = self.retrieve(sink).map_err(|e| self.fail(e))?;
        info!(count, "Snapshots transferred");
        self.observer.on_event(&SnapperEvent::Complete);
        Ok(count)
    }

    /// Read every stored snapshot into a [`SnapshotArchive`] under `dir`.
    ///
    /// Each snapshot is written as it arrives; nothing is buffered beyond
    /// the archive's metadata. A write failure stops the transfer.
    #[instrument(skip_all, fields(dir = %dir.as_ref().display()))]
    pub fn export_snapshots(
        &self,
        dir: impl AsRef<Path>,
    ) -> Result<ArchiveSummary, ProtocolError> {
        let info = match self.device_info() {
            Some(info) => info,
            None => self.refresh_info()?,
        };
        let mut archive = SnapshotArchive::create(dir, &info).map_err(|e| self.fail(e.into()))?;
        self.transfer_snapshots(|snapshot| {
            archive.add(&snapshot)?;
            Ok(())
        })?;
        archive.finish().map_err(|e| self.fail(e.into()))
    }

    /// Read every stored snapshot and upload it while reading continues.
    ///
    /// The server-side upload is finalized exactly once after every snapshot
    /// has been attempted, or cancelled if retrieval fails or finds nothing.
    #[instrument(skip_all, fields(device_id = %request.device_id))]
    pub fn upload_snapshots<B>(
        &self,
        backend: &B,
        request: &UploadRequest,
        options: &UploadOptions,
    ) -> Result<UploadSummary, ProtocolError>
    where
        B: UploadBackend + ?Sized,
    {
        let _mode = self.begin(TransferMode::Uploading)?;
        let upload_id = backend.start_upload(request).map_err(|e| self.fail(e.into()))?;

        let queue = UploadQueue::new(self.config.retry);
        let observer = self.observer.as_ref();
        let max_workers = self.config.max_workers;

        let (retrieval, finalized) = thread::scope(|scope| {
            let uploader = scope.spawn(|| {
                queue.run(backend, observer, max_workers, |report| {
                    finalize(backend, &upload_id, options, report)
                })
            });

            let retrieval = self.retrieve(|snapshot| {
                queue
                    .enqueue(UploadTask::new(upload_id.clone(), snapshot))
                    .map_err(|task| ProtocolError::InvalidTransition {
                        state: "closed upload queue".into(),
                        event: format!("enqueue snapshot {}", task.index),
                    })
            });
            match &retrieval {
                Ok(_) => queue.close(),
                Err(_) => queue.abort(),
            }

            let finalized = uploader
                .join()
                .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
            (retrieval, finalized)
        });

        let count = retrieval.map_err(|e| self.fail(e))?;
        let (report, earliest_processing) = finalized.map_err(|e| self.fail(e))?;
        info!(
            count,
            uploaded = report.uploaded,
            failed = report.failed(),
            "Upload complete"
        );
        self.observer.on_event(&SnapperEvent::Complete);
        Ok(UploadSummary {
            upload_id,
            report,
            earliest_processing,
        })
    }

    /// Flash `binary` onto the receiver.
    ///
    /// The image is padded to the device's firmware slot and verified by CRC
    /// before it is activated. On success the device restarts, and this
    /// session must be reopened. Returns the verified CRC.
    #[instrument(skip_all, fields(len = binary.len()))]
    pub fn update_firmware(&self, binary: &[u8]) -> Result<u16, ProtocolError> {
        let info = match self.device_info() {
            Some(info) => info,
            None => self.refresh_info()?,
        };
        let (image_len, page_size) = self.firmware_geometry(&info);
        let image = FirmwareImage::new(binary, image_len, page_size).map_err(|e| self.fail(e.into()))?;

        let _mode = self.begin(TransferMode::FlashingFirmware)?;
        info!(
            image_len,
            page_size,
            pages = image.page_count(),
            crc = %format!("0x{:04X}", image.crc()),
            "Starting firmware update"
        );

        let transport = self.observed();
        let mut machine = FirmwareUpdate::new(&image);
        drive(&mut machine, &transport, |progress| {
            self.observer.on_event(&SnapperEvent::Progress {
                phase: SnapperPhase::FlashingFirmware,
                operation: "firmware page".into(),
                current: progress.sent as u64,
                total: progress.total as u64,
            });
            Ok(())
        })
        .map_err(|e| self.fail(e))?;

        // The receiver is restarting with new firmware.
        *lock(&self.info) = None;
        self.log(
            LogLevel::Info,
            format!("Firmware verified (CRC 0x{:04X}), device restarting", image.crc()),
        );
        self.observer.on_event(&SnapperEvent::Complete);
        Ok(image.crc())
    }

    /// Image and page size from the device, or the configured fallbacks.
    fn firmware_geometry(&self, info: &DeviceInfo) -> (usize, usize) {
        if info.supports_firmware_update() {
            (info.firmware_size as usize, usize::from(info.flash_page_size))
        } else {
            warn!(
                firmware_size = self.config.firmware_size,
                flash_page_size = self.config.flash_page_size,
                "Device reports no firmware geometry, using defaults"
            );
            (self.config.firmware_size, self.config.flash_page_size)
        }
    }
}

/// Upload snapshots read back from an archive, without a device.
///
/// Uses the same queue, retry policy and completion rules as
/// [`DeviceSession::upload_snapshots`]. `request.device_id` should name the
/// receiver the archive came from.
#[instrument(skip_all, fields(snapshots = snapshots.len()))]
pub fn upload_archive<B, O>(
    backend: &B,
    request: &UploadRequest,
    snapshots: Vec<RetrievedSnapshot>,
    options: &UploadOptions,
    config: &SessionConfig,
    observer: &O,
) -> Result<UploadSummary, ProtocolError>
where
    B: UploadBackend + ?Sized,
    O: SnapperObserver + ?Sized,
{
    let upload_id = backend.start_upload(request)?;
    observer.on_event(&SnapperEvent::PhaseChanged {
        from: SnapperPhase::Idle,
        to: SnapperPhase::Uploading,
    });

    let queue = UploadQueue::new(config.retry);
    let count = snapshots.len();
    for snapshot in snapshots {
        // Nothing closes the queue before the loop ends.
        if let Err(task) = queue.enqueue(UploadTask::new(upload_id.clone(), snapshot)) {
            queue.abort();
            cancel(backend, &upload_id);
            return Err(ProtocolError::InvalidTransition {
                state: "closed upload queue".into(),
                event: format!("enqueue snapshot {}", task.index),
            });
        }
    }
    queue.close();

    let finalized = queue.run(backend, observer, config.max_workers, |report| {
        finalize(backend, &upload_id, options, report)
    });
    observer.on_event(&SnapperEvent::PhaseChanged {
        from: SnapperPhase::Uploading,
        to: SnapperPhase::Idle,
    });
    let (report, earliest_processing) = finalized?;

    info!(
        count,
        uploaded = report.uploaded,
        failed = report.failed(),
        "Archive upload complete"
    );
    observer.on_event(&SnapperEvent::Complete);
    Ok(UploadSummary {
        upload_id,
        report,
        earliest_processing,
    })
}

/// Completion hook of the upload queue: runs once, after every task.
///
/// Failed snapshot uploads do not prevent finishing; the server processes
/// whatever it received.
fn finalize<B: UploadBackend + ?Sized>(
    backend: &B,
    upload_id: &UploadSessionId,
    options: &UploadOptions,
    report: UploadReport,
) -> Result<(UploadReport, Option<String>), ProtocolError> {
    let latest = match (report.aborted, report.latest) {
        (false, Some(latest)) => latest,
        (aborted, _) => {
            if aborted {
                warn!(upload_id = %upload_id, "Retrieval failed, cancelling upload");
            } else {
                info!(upload_id = %upload_id, "No snapshots to upload, cancelling upload");
            }
            cancel(backend, upload_id);
            return Ok((report, None));
        }
    };

    if let Some(location) = options.reference {
        let first = location.start.or(report.earliest).unwrap_or(latest);
        let last = location.end.unwrap_or(latest);
        for at in [first, last] {
            let point = ReferencePoint {
                at,
                lat: location.lat,
                lng: location.lng,
            };
            if let Err(e) = backend.add_reference_point(upload_id, &point) {
                cancel(backend, upload_id);
                return Err(e.into());
            }
        }
    }

    let earliest_processing = options.priority.earliest_processing(latest);
    backend.finish_upload(upload_id, &earliest_processing)?;
    info!(
        upload_id = %upload_id,
        priority = %options.priority,
        earliest_processing = %earliest_processing,
        "Upload finished"
    );
    Ok((report, Some(earliest_processing)))
}

/// Best effort; the error that led here is the one reported.
fn cancel<B: UploadBackend + ?Sized>(backend: &B, upload_id: &UploadSessionId) {
    if let Err(e) = backend.cancel_upload(upload_id) {
        warn!(upload_id = %upload_id, error = %e, "Failed to cancel upload");
    }
}

/// Poll for a receiver until `connect_timeout_secs` elapses.
pub fn wait_for_device(config: &SessionConfig) -> Result<NusbTransport> {
    info!("Waiting for device...");
    let timeout = Duration::from_secs(config.connect_timeout_secs);
    let start = Instant::now();
    let mut poll_count = 0u64;

    loop {
        poll_count += 1;

        match NusbTransport::open_matching(config.vendor_id, &config.product_match) {
            Ok(t) => {
                info!(
                    vid = format!("{:04X}", t.vendor_id()),
                    pid = format!("{:04X}", t.product_id()),
                    "Device found after {} polls",
                    poll_count
                );
                return Ok(t);
            }
            Err(TransportError::DeviceNotFound { .. }) => {
                if start.elapsed() > timeout {
                    return Err(anyhow!(
                        "Timeout waiting for device after {}s",
                        timeout.as_secs()
                    ));
                }
                thread::sleep(Duration::from_millis(250));
            }
            Err(e) => return Err(e.into()),
        }
    }
}
