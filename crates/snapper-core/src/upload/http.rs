//! HTTP upload backend.
//!
//! Every route takes a multipart form and answers 200 on success.
//! `startUpload` returns the new upload ID as its body.

use std::time::Duration;

use reqwest::blocking::{Client, multipart::Form, multipart::Part};
use tracing::{debug, info, instrument};

use super::backend::{
    ReferencePoint, UploadBackend, UploadError, UploadRequest, UploadSessionId,
};
use crate::payload::UploadTask;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// [`UploadBackend`] over the SnapperGPS web server.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Result<Self, UploadError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|source| UploadError::Http {
                route: "client",
                source,
            })?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    fn url(&self, route: &str) -> String {
        format!("{}/{}", self.base_url, route)
    }

    /// POST `form` to `route` and return the response body.
    fn post(&self, route: &'static str, form: Form) -> Result<String, UploadError> {
        let response = self
            .client
            .post(self.url(route))
            .multipart(form)
            .send()
            .map_err(|source| UploadError::Http { route, source })?;

        let status = response.status();
        if !status.is_success() {
            return Err(UploadError::Status {
                route,
                status: status.as_u16(),
            });
        }
        response
            .text()
            .map_err(|source| UploadError::Http { route, source })
    }
}

impl UploadBackend for HttpBackend {
    #[instrument(skip(self, request), fields(device_id = %request.device_id))]
    fn start_upload(&self, request: &UploadRequest) -> Result<UploadSessionId, UploadError> {
        let form = Form::new()
            .text("deviceID", request.device_id.clone())
            .text("email", request.email.clone())
            .text("subscription", request.subscription.clone().unwrap_or_default())
            .text("maxVelocity", request.max_velocity.to_string())
            .text("nickname", request.nickname.clone());

        let body = self.post("startUpload", form)?;
        let id = body.trim();
        if id.is_empty() {
            return Err(UploadError::EmptyUploadId);
        }
        info!(upload_id = id, "Upload started");
        Ok(UploadSessionId::new(id))
    }

    #[instrument(skip(self, task), fields(upload_id = %task.upload_id, index = task.index))]
    fn upload_snapshot(&self, task: &UploadTask) -> Result<(), UploadError> {
        let data = Part::bytes(task.payload.as_bytes().to_vec())
            .file_name("snapshot.dat")
            .mime_str("application/octet-stream")
            .map_err(|source| UploadError::Http {
                route: "addSnapshot",
                source,
            })?;

        let form = Form::new()
            .part("data", data)
            .text("uploadID", task.upload_id.to_string())
            .text("datetime", iso_timestamp(task.meta.timestamp))
            .text("battery", task.meta.battery.to_string())
            .text("hxfoCount", "1")
            .text("lxfoCount", "1")
            .text("temperature", task.meta.temperature.to_string());

        self.post("addSnapshot", form)?;
        debug!("Snapshot stored");
        Ok(())
    }

    fn add_reference_point(
        &self,
        id: &UploadSessionId,
        point: &ReferencePoint,
    ) -> Result<(), UploadError> {
        let form = Form::new()
            .text("uploadID", id.to_string())
            .text("datetime", iso_timestamp(point.at))
            .text("lat", point.lat.to_string())
            .text("lng", point.lng.to_string());
        self.post("addReferencePoint", form).map(drop)
    }

    #[instrument(skip(self))]
    fn finish_upload(
        &self,
        id: &UploadSessionId,
        earliest_processing: &str,
    ) -> Result<(), UploadError> {
        let form = Form::new()
            .text("uploadID", id.to_string())
            .text("earliestProcessingDateString", earliest_processing.to_string());
        self.post("finishUpload", form)?;
        info!(upload_id = %id, "Upload finished");
        Ok(())
    }

    #[instrument(skip(self))]
    fn cancel_upload(&self, id: &UploadSessionId) -> Result<(), UploadError> {
        let form = Form::new().text("uploadID", id.to_string());
        self.post("cancelUpload", form).map(drop)
    }
}

/// `2022-03-31T18:04:05.250Z`, the form JavaScript's `toISOString` produces.
fn iso_timestamp(at: chrono::DateTime<chrono::Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
