//! Storage backend capability interface
//!
//! The upload pipeline only needs `upload` and `rename`; `download`,
//! `delete` and `list` complete the capability set. Backends are chosen by
//! explicit configuration through [`build_backend`].

mod local;
mod memory;

pub use local::LocalBackend;
pub use memory::MemoryBackend;

use crate::config::BackendConfig;
use crate::error::{BackendError, Result};
use crate::Options;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::sync::Arc;
use tokio::io::AsyncRead;

/// Owned byte stream returned by downloads
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Description of an object held by a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendObject {
    pub name: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Raw backend reply, exposed to callers as a readable handle
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub status: u16,
    pub body: Bytes,
}

impl BackendResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        BackendResponse {
            status,
            body: body.into(),
        }
    }

    /// JSON reply describing `object`
    pub fn for_object(status: u16, object: &BackendObject) -> std::result::Result<Self, BackendError> {
        let body = serde_json::to_vec(object)?;
        Ok(BackendResponse::new(status, body))
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }

    pub fn into_reader(self) -> Cursor<Bytes> {
        Cursor::new(self.body)
    }
}

/// Durable storage capability
///
/// `rename` must behave like staging promotion: renaming onto a name that
/// already holds identical bytes succeeds and drops the source, renaming
/// onto different bytes fails with `BackendError::Conflict`, and repeating
/// a finished rename succeeds.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Service name recorded in commit locations
    fn name(&self) -> &str;

    /// Consume `stream` to its end and store it under `name`
    async fn upload(
        &self,
        stream: &mut (dyn AsyncRead + Send + Unpin),
        name: &str,
        options: &Options,
    ) -> std::result::Result<BackendResponse, BackendError>;

    async fn rename(&self, from: &str, to: &str) -> std::result::Result<BackendResponse, BackendError>;

    async fn download(&self, name: &str) -> std::result::Result<BoxReader, BackendError>;

    async fn delete(&self, name: &str) -> std::result::Result<(), BackendError>;

    async fn list(&self, prefix: &str) -> std::result::Result<Vec<BackendObject>, BackendError>;

    async fn contains(&self, name: &str) -> std::result::Result<bool, BackendError>;
}

/// Construct the backend selected in configuration
pub fn build_backend(config: &BackendConfig) -> Result<Arc<dyn StorageBackend>> {
    match config {
        BackendConfig::Memory => Ok(Arc::new(MemoryBackend::new())),
        BackendConfig::Local { root } => Ok(Arc::new(LocalBackend::new(root)?)),
    }
}

/// Reject names that could escape a backend's namespace
pub(crate) fn validate_name(name: &str) -> std::result::Result<(), BackendError> {
    if name.is_empty()
        || name.len() > 255
        || name.contains('/')
        || name.contains('\\')
        || name.starts_with('.')
    {
        return Err(BackendError::Request {
            status: 400,
            message: format!("invalid object name '{}'", name),
        });
    }
    Ok(())
}
