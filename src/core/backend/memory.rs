//! In-process backend

use super::{validate_name, BackendObject, BackendResponse, BoxReader, StorageBackend};
use crate::error::BackendError;
use crate::Options;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    modified: DateTime<Utc>,
}

impl StoredObject {
    fn describe(&self, name: &str) -> BackendObject {
        BackendObject {
            name: name.to_string(),
            size: self.data.len() as u64,
            modified: self.modified,
        }
    }
}

/// Backend holding objects in a shared map
///
/// Clones share the same objects.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Object bytes, if present
    pub fn get(&self, name: &str) -> Option<Bytes> {
        self.objects.read().get(name).map(|o| o.data.clone())
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.objects.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upload(
        &self,
        stream: &mut (dyn AsyncRead + Send + Unpin),
        name: &str,
        _options: &Options,
    ) -> Result<BackendResponse, BackendError> {
        validate_name(name)?;

        let mut data = Vec::new();
        stream.read_to_end(&mut data).await?;

        let object = StoredObject {
            data: Bytes::from(data),
            modified: Utc::now(),
        };
        let described = object.describe(name);
        self.objects.write().insert(name.to_string(), object);

        debug!(name, size = described.size, "stored object in memory");
        BackendResponse::for_object(201, &described)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<BackendResponse, BackendError> {
        validate_name(from)?;
        validate_name(to)?;

        let mut objects = self.objects.write();
        let source = objects.get(from).cloned();
        let existing = objects.get(to).cloned();

        match (source, existing) {
            (Some(source), Some(existing)) => {
                if source.data != existing.data {
                    return Err(BackendError::Conflict(to.to_string()));
                }
                objects.remove(from);
                BackendResponse::for_object(200, &existing.describe(to))
            }
            (Some(source), None) => {
                objects.remove(from);
                let described = source.describe(to);
                objects.insert(to.to_string(), source);
                BackendResponse::for_object(201, &described)
            }
            (None, Some(existing)) => BackendResponse::for_object(200, &existing.describe(to)),
            (None, None) => Err(BackendError::NotFound(from.to_string())),
        }
    }

    async fn download(&self, name: &str) -> Result<BoxReader, BackendError> {
        let data = self
            .get(name)
            .ok_or_else(|| BackendError::NotFound(name.to_string()))?;
        Ok(Box::new(Cursor::new(data)))
    }

    async fn delete(&self, name: &str) -> Result<(), BackendError> {
        self.objects
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| BackendError::NotFound(name.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BackendObject>, BackendError> {
        let objects = self.objects.read();
        let mut listed: Vec<BackendObject> = objects
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, object)| object.describe(name))
            .collect();
        listed.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listed)
    }

    async fn contains(&self, name: &str) -> Result<bool, BackendError> {
        Ok(self.objects.read().contains_key(name))
    }
}
