//! Snapshot upload: the backend collaborator and the worker pool feeding it.

pub mod backend;
pub mod http;
pub mod memory;
pub mod policy;
pub mod queue;

pub use backend::{
    ProcessingPriority, ReferencePoint, UploadBackend, UploadError, UploadRequest,
    UploadSessionId,
};
pub use http::HttpBackend;
pub use memory::MemoryBackend;
pub use policy::{Exhausted, RetryPolicy};
pub use queue::{UploadQueue, UploadReport};
