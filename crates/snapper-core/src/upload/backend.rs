//! The backend an upload session talks to.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Days, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::payload::UploadTask;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("HTTP request to {route} failed: {source}")]
    Http {
        route: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{route} returned HTTP {status}")]
    Status { route: &'static str, status: u16 },

    #[error("Server returned an empty upload ID")]
    EmptyUploadId,

    #[error("Upload rejected: {0}")]
    Rejected(String),
}

/// Server-assigned ID grouping the snapshots of one upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadSessionId(String);

impl UploadSessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UploadSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Details sent when an upload session is opened.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadRequest {
    /// Device ID as upper-case hex.
    pub device_id: String,
    pub email: String,
    /// Maximum receiver velocity in m/s, a hint for track smoothing.
    pub max_velocity: f64,
    pub nickname: String,
    /// Opaque push subscription forwarded to the server, if any.
    pub subscription: Option<String>,
}

/// A known position at a known time, anchoring the track.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ReferencePoint {
    pub at: DateTime<Utc>,
    pub lat: f64,
    pub lng: f64,
}

/// When the server may start processing an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingPriority {
    /// As soon as possible, without waiting for navigation data.
    Immediate,
    /// From the start of the day of the latest snapshot.
    Rapid,
    /// Midday after the latest snapshot, once final navigation data exists.
    #[default]
    Delayed,
}

impl ProcessingPriority {
    /// Earliest processing date in the server's `Y-M-D HHH:00:00.0` format.
    pub fn earliest_processing(&self, latest: DateTime<Utc>) -> String {
        match self {
            ProcessingPriority::Immediate => "1970-01-01 01:01:01".to_string(),
            ProcessingPriority::Rapid => database_date(latest, 0),
            ProcessingPriority::Delayed => {
                let next_day = latest.checked_add_days(Days::new(1)).unwrap_or(latest);
                database_date(next_day, 12)
            }
        }
    }
}

impl FromStr for ProcessingPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "immediate" => Ok(ProcessingPriority::Immediate),
            "rapid" => Ok(ProcessingPriority::Rapid),
            "delayed" => Ok(ProcessingPriority::Delayed),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

impl fmt::Display for ProcessingPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessingPriority::Immediate => write!(f, "immediate"),
            ProcessingPriority::Rapid => write!(f, "rapid"),
            ProcessingPriority::Delayed => write!(f, "delayed"),
        }
    }
}

/// Unpadded date and a three-digit hour, as the server parses it.
fn database_date(date: DateTime<Utc>, hour: u32) -> String {
    format!(
        "{}-{}-{} {:03}:00:00.0",
        date.year(),
        date.month(),
        date.day(),
        hour
    )
}

/// The upload collaborator.
///
/// `upload_snapshot` is one attempt; retries belong to the caller. Workers
/// call it from several threads at once.
pub trait UploadBackend: Send + Sync {
    fn start_upload(&self, request: &UploadRequest) -> Result<UploadSessionId, UploadError>;

    fn upload_snapshot(&self, task: &UploadTask) -> Result<(), UploadError>;

    fn add_reference_point(
        &self,
        id: &UploadSessionId,
        point: &ReferencePoint,
    ) -> Result<(), UploadError>;

    /// Mark the upload complete. `earliest_processing` comes from
    /// [`ProcessingPriority::earliest_processing`].
    fn finish_upload(
        &self,
        id: &UploadSessionId,
        earliest_processing: &str,
    ) -> Result<(), UploadError>;

    /// Delete the upload and every snapshot already stored under it.
    fn cancel_upload(&self, id: &UploadSessionId) -> Result<(), UploadError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_processing_dates() {
        let latest = Utc.with_ymd_and_hms(2022, 3, 31, 18, 4, 5).unwrap();
        assert_eq!(
            ProcessingPriority::Immediate.earliest_processing(latest),
            "1970-01-01 01:01:01"
        );
        assert_eq!(
            ProcessingPriority::Rapid.earliest_processing(latest),
            "2022-3-31 000:00:00.0"
        );
        assert_eq!(
            ProcessingPriority::Delayed.earliest_processing(latest),
            "2022-4-1 012:00:00.0"
        );
    }

    #[test]
    fn test_priority_parsing() {
        assert_eq!(
            "Rapid".parse::<ProcessingPriority>(),
            Ok(ProcessingPriority::Rapid)
        );
        assert!("soon".parse::<ProcessingPriority>().is_err());
        assert_eq!(ProcessingPriority::default(), ProcessingPriority::Delayed);
        assert_eq!(ProcessingPriority::Immediate.to_string(), "immediate");
    }

    #[test]
    fn test_session_id_display() {
        let id = UploadSessionId::new("a1b2");
        assert_eq!(id.to_string(), "a1b2");
        assert_eq!(id.as_str(), "a1b2");
    }
}
