//! Writes retrieved snapshots to disk.
//!
//! One directory per transfer holds a `.bin` file per snapshot named after
//! its timestamp, a `metadata.csv` index, and a JSON document embedding every
//! snapshot as base64 for tools that want a single file. The JSON document
//! can be read back with [`ImportedArchive`] and uploaded without a device.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::payload::{RetrievedSnapshot, SnapshotPayload};
use crate::protocol::constants::SNAPSHOT_SIZE;
use crate::protocol::{DeviceInfo, SnapshotMeta};

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Snapshot {index}: bad timestamp '{value}': {source}")]
    Timestamp {
        index: usize,
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("Snapshot {index}: data is not base64: {source}")]
    Base64 {
        index: usize,
        #[source]
        source: base64::DecodeError,
    },
    #[error("Snapshot {index}: {len} bytes of data, expected {}", SNAPSHOT_SIZE)]
    PayloadSize { index: usize, len: usize },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonSnapshot {
    timestamp: String,
    temperature: f64,
    battery_voltage: f64,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonDocument<'a> {
    #[serde(rename = "deviceID")]
    device_id: &'a str,
    firmware_description: &'a str,
    firmware_version: &'a str,
    snapshots: &'a [JsonSnapshot],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredSnapshot {
    timestamp: String,
    temperature: f64,
    battery_voltage: f64,
    data: String,
}

/// Only the fields needed to upload; anything else in the file is ignored.
#[derive(Debug, Deserialize)]
struct StoredDocument {
    #[serde(rename = "deviceID")]
    device_id: String,
    snapshots: Vec<StoredSnapshot>,
}

/// Where an archive ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub snapshots: usize,
    pub csv: PathBuf,
    pub json: PathBuf,
}

/// Snapshot files plus their metadata, written as snapshots arrive.
pub struct SnapshotArchive {
    dir: PathBuf,
    device_id: String,
    firmware_description: String,
    firmware_version: String,
    csv: String,
    json: Vec<JsonSnapshot>,
}

impl SnapshotArchive {
    /// Create `dir` (and parents) for snapshots from `device`.
    pub fn create(dir: impl AsRef<Path>, device: &DeviceInfo) -> Result<Self, ExportError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        info!(dir = %dir.display(), device_id = %device.device_id_hex(), "Writing snapshot archive");
        Ok(Self {
            dir,
            device_id: device.device_id_hex(),
            firmware_description: device.firmware_description.clone(),
            firmware_version: device.firmware_version.to_string(),
            csv: String::from("filename,timestamp,temperature,battery"),
            json: Vec::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.json.len()
    }

    pub fn is_empty(&self) -> bool {
        self.json.is_empty()
    }

    /// Write one snapshot's `.bin` file and record its metadata.
    pub fn add(&mut self, snapshot: &RetrievedSnapshot) -> Result<PathBuf, ExportError> {
        let meta = &snapshot.meta;
        let filename = snapshot_filename(meta.timestamp);
        let path = self.dir.join(&filename);
        fs::write(&path, snapshot.payload.as_bytes())?;
        debug!(path = %path.display(), "Snapshot written");

        let timestamp = iso_timestamp(meta.timestamp);
        // Writing to a String cannot fail.
        let _ = write!(
            self.csv,
            "\n{},{},{:.1},{:.2}",
            filename, timestamp, meta.temperature, meta.battery
        );
        self.json.push(JsonSnapshot {
            timestamp,
            temperature: meta.temperature,
            battery_voltage: meta.battery,
            data: BASE64.encode(snapshot.payload.as_bytes()),
        });
        Ok(path)
    }

    /// Write `metadata.csv` and the JSON document.
    pub fn finish(self) -> Result<ArchiveSummary, ExportError> {
        let csv = self.dir.join("metadata.csv");
        fs::write(&csv, &self.csv)?;

        let json = self.dir.join(self.json_filename());
        let document = JsonDocument {
            device_id: &self.device_id,
            firmware_description: &self.firmware_description,
            firmware_version: &self.firmware_version,
            snapshots: &self.json,
        };
        fs::write(&json, serde_json::to_string_pretty(&document)?)?;

        info!(snapshots = self.json.len(), json = %json.display(), "Archive complete");
        Ok(ArchiveSummary {
            snapshots: self.json.len(),
            csv,
            json,
        })
    }

    /// `<device id>[_<first timestamp>].json`
    fn json_filename(&self) -> String {
        match self.json.first() {
            Some(first) => {
                let compact: String = first
                    .timestamp
                    .chars()
                    .filter(|c| !matches!(c, '-' | ':' | 'Z'))
                    .map(|c| if matches!(c, 'T' | '.') { '_' } else { c })
                    .collect();
                format!("{}_{}.json", self.device_id, compact)
            }
            None => format!("{}.json", self.device_id),
        }
    }
}

/// Snapshots read back from an archive's JSON document.
#[derive(Debug, Clone)]
pub struct ImportedArchive {
    pub device_id: String,
    /// In document order, indexed from 0.
    pub snapshots: Vec<RetrievedSnapshot>,
}

impl ImportedArchive {
    /// Read the JSON document written by [`SnapshotArchive::finish`].
    pub fn read(path: impl AsRef<Path>) -> Result<Self, ExportError> {
        let path = path.as_ref();
        let archive = Self::from_json(&fs::read_to_string(path)?)?;
        info!(
            path = %path.display(),
            device_id = %archive.device_id,
            snapshots = archive.snapshots.len(),
            "Archive loaded"
        );
        Ok(archive)
    }

    /// Parse a document. Every snapshot is checked before any is returned,
    /// so a bad entry anywhere rejects the whole file.
    pub fn from_json(text: &str) -> Result<Self, ExportError> {
        let document: StoredDocument = serde_json::from_str(text)?;
        let snapshots = document
            .snapshots
            .into_iter()
            .enumerate()
            .map(|(index, stored)| stored.into_snapshot(index))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            device_id: document.device_id,
            snapshots,
        })
    }
}

impl StoredSnapshot {
    fn into_snapshot(self, index: usize) -> Result<RetrievedSnapshot, ExportError> {
        let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)
            .map_err(|source| ExportError::Timestamp {
                index,
                value: self.timestamp.clone(),
                source,
            })?
            .with_timezone(&Utc);
        let data = BASE64
            .decode(&self.data)
            .map_err(|source| ExportError::Base64 { index, source })?;
        if data.len() != SNAPSHOT_SIZE {
            return Err(ExportError::PayloadSize {
                index,
                len: data.len(),
            });
        }

        Ok(RetrievedSnapshot {
            index,
            meta: SnapshotMeta {
                valid: true,
                timestamp,
                temperature: self.temperature,
                battery: self.battery_voltage,
            },
            payload: SnapshotPayload::from_page(data),
        })
    }
}

/// `YYYYMMDD_HHMMSS_mmm.bin` in UTC.
pub fn snapshot_filename(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d_%H%M%S_%3f.bin").to_string()
}

fn iso_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::device_info::{DeviceStatus, FirmwareVersion, MotionState};
    use chrono::TimeZone;

    fn device() -> DeviceInfo {
        DeviceInfo {
            device_id: 0xABCDEF,
            firmware_description: "SnapperGPS-basic".into(),
            firmware_version: FirmwareVersion {
                major: 1,
                minor: 0,
                patch: 2,
            },
            firmware_size: 48 * 1024,
            flash_page_size: 2048,
            status: DeviceStatus::WillShutdown,
            snapshot_count: 2,
            battery_voltage: 4.1,
            time: Utc.timestamp_opt(0, 0).unwrap(),
            motion: MotionState {
                acceleration: [0, 16000, 0],
                control_registers: [0; 7],
            },
        }
    }

    fn snapshot(index: usize, millis: i64, fill: u8) -> RetrievedSnapshot {
        RetrievedSnapshot {
            index,
            meta: SnapshotMeta {
                valid: true,
                timestamp: Utc.timestamp_millis_opt(millis).unwrap(),
                temperature: 21.46,
                battery: 3.987,
            },
            payload: SnapshotPayload::from_page(vec![fill; 10]),
        }
    }

    #[test]
    fn test_filename_from_timestamp() {
        let at = Utc.timestamp_millis_opt(1_648_749_845_007).unwrap();
        assert_eq!(snapshot_filename(at), "20220331_180405_007.bin");
    }

    #[test]
    fn test_archive_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = SnapshotArchive::create(dir.path().join("out"), &device()).unwrap();

        let first = archive.add(&snapshot(0, 1_648_749_845_250, 0xAA)).unwrap();
        archive.add(&snapshot(1, 1_648_749_905_250, 0xBB)).unwrap();
        assert_eq!(archive.len(), 2);

        let bytes = fs::read(&first).unwrap();
        assert_eq!(bytes.len(), SNAPSHOT_SIZE);
        assert_eq!(bytes[0], 0xAA);

        let summary = archive.finish().unwrap();
        assert_eq!(summary.snapshots, 2);

        let csv = fs::read_to_string(&summary.csv).unwrap();
        let lines: Vec<_> = csv.lines().collect();
        assert_eq!(lines[0], "filename,timestamp,temperature,battery");
        assert_eq!(
            lines[1],
            "20220331_180405_250.bin,2022-03-31T18:04:05.250Z,21.5,3.99"
        );
        assert_eq!(lines.len(), 3);

        assert_eq!(
            summary.json.file_name().unwrap(),
            "ABCDEF_20220331_180405_250.json"
        );
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&summary.json).unwrap()).unwrap();
        assert_eq!(json["deviceID"], "ABCDEF");
        assert_eq!(json["firmwareDescription"], "SnapperGPS-basic");
        assert_eq!(json["firmwareVersion"], "1.0.2");
        assert_eq!(json["snapshots"].as_array().unwrap().len(), 2);
        assert_eq!(json["snapshots"][1]["batteryVoltage"], 3.987);

        let data = BASE64
            .decode(json["snapshots"][0]["data"].as_str().unwrap())
            .unwrap();
        assert_eq!(data, bytes);
    }

    #[test]
    fn test_empty_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = SnapshotArchive::create(dir.path(), &device()).unwrap();
        assert!(archive.is_empty());

        let summary = archive.finish().unwrap();
        assert_eq!(summary.snapshots, 0);
        assert_eq!(summary.json.file_name().unwrap(), "ABCDEF.json");
        assert_eq!(
            fs::read_to_string(summary.csv).unwrap(),
            "filename,timestamp,temperature,battery"
        );
    }

    #[test]
    fn test_json_document_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = SnapshotArchive::create(dir.path(), &device()).unwrap();
        let written = [
            snapshot(0, 1_648_749_845_250, 0xAA),
            snapshot(1, 1_648_749_905_250, 0xBB),
        ];
        for snapshot in &written {
            archive.add(snapshot).unwrap();
        }
        let summary = archive.finish().unwrap();

        let imported = ImportedArchive::read(&summary.json).unwrap();
        assert_eq!(imported.device_id, "ABCDEF");
        assert_eq!(imported.snapshots.len(), 2);
        for (read, original) in imported.snapshots.iter().zip(&written) {
            assert_eq!(read.index, original.index);
            assert_eq!(read.meta, original.meta);
            assert_eq!(read.payload, original.payload);
        }
    }

    #[test]
    fn test_document_without_device_id_is_rejected() {
        let err = ImportedArchive::from_json(r#"{"snapshots": []}"#).unwrap_err();
        assert!(matches!(err, ExportError::Json(_)), "{err}");
        assert!(err.to_string().contains("deviceID"), "{err}");
    }

    #[test]
    fn test_document_without_snapshots_is_rejected() {
        let err = ImportedArchive::from_json(r#"{"deviceID": "ABCDEF"}"#).unwrap_err();
        assert!(matches!(err, ExportError::Json(_)), "{err}");
        assert!(err.to_string().contains("snapshots"), "{err}");
    }

    fn document(timestamp: &str, data: &str) -> String {
        serde_json::json!({
            "deviceID": "ABCDEF",
            "snapshots": [{
                "timestamp": timestamp,
                "temperature": 20.0,
                "batteryVoltage": 3.9,
                "data": data,
            }]
        })
        .to_string()
    }

    #[test]
    fn test_bad_snapshot_entries_are_rejected() {
        let full = BASE64.encode(vec![0u8; SNAPSHOT_SIZE]);

        let err = ImportedArchive::from_json(&document("yesterday", &full)).unwrap_err();
        assert!(matches!(err, ExportError::Timestamp { index: 0, .. }), "{err}");

        let err =
            ImportedArchive::from_json(&document("2022-03-31T18:04:05.250Z", "!!")).unwrap_err();
        assert!(matches!(err, ExportError::Base64 { index: 0, .. }), "{err}");

        let short = BASE64.encode([0u8; 4]);
        let err =
            ImportedArchive::from_json(&document("2022-03-31T18:04:05.250Z", &short)).unwrap_err();
        assert!(matches!(err, ExportError::PayloadSize { index: 0, len: 4 }), "{err}");
    }
}
