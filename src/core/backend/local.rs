//! Directory-backed backend
//!
//! Objects are plain files directly under the root directory. Uploads are
//! written to a hidden `.<name>.partial` file and renamed into place once
//! the stream ends.

use super::{validate_name, BackendObject, BackendResponse, BoxReader, StorageBackend};
use crate::core::staging::{link_into_place, remove_if_exists, LinkError, PromoteOutcome};
use crate::error::{BackendError, Result, StowageError};
use crate::Options;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(|e| {
            StowageError::Configuration(format!(
                "cannot create backend root {}: {}",
                root.display(),
                e
            ))
        })?;
        info!(root = %root.display(), "local backend ready");
        Ok(LocalBackend { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    async fn describe(&self, name: &str) -> std::result::Result<BackendObject, BackendError> {
        let meta = tokio::fs::metadata(self.object_path(name))
            .await
            .map_err(|e| not_found_or_io(e, name))?;
        let modified: DateTime<Utc> = meta.modified().map(DateTime::from).unwrap_or_else(|_| Utc::now());
        Ok(BackendObject {
            name: name.to_string(),
            size: meta.len(),
            modified,
        })
    }
}

fn not_found_or_io(e: io::Error, name: &str) -> BackendError {
    if e.kind() == io::ErrorKind::NotFound {
        BackendError::NotFound(name.to_string())
    } else {
        BackendError::Io(e)
    }
}

/// Stream into `partial`, make it durable, then move it onto `target`
async fn write_then_rename(
    stream: &mut (dyn AsyncRead + Send + Unpin),
    partial: &Path,
    target: &Path,
) -> io::Result<u64> {
    let mut file = tokio::fs::File::create(partial).await?;
    let copied = tokio::io::copy(stream, &mut file).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(partial, target).await?;
    Ok(copied)
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn upload(
        &self,
        stream: &mut (dyn AsyncRead + Send + Unpin),
        name: &str,
        _options: &Options,
    ) -> std::result::Result<BackendResponse, BackendError> {
        validate_name(name)?;
        let partial = self.root.join(format!(".{}.partial", name));

        let copied = match write_then_rename(stream, &partial, &self.object_path(name)).await {
            Ok(n) => n,
            Err(e) => {
                if let Err(cleanup) = remove_if_exists(&partial).await {
                    warn!(partial = %partial.display(), error = %cleanup, "could not remove partial upload");
                }
                return Err(BackendError::Io(e));
            }
        };
        debug!(name, size = copied, "stored object on disk");

        let object = self.describe(name).await?;
        BackendResponse::for_object(201, &object)
    }

    async fn rename(&self, from: &str, to: &str) -> std::result::Result<BackendResponse, BackendError> {
        validate_name(from)?;
        validate_name(to)?;

        let outcome = link_into_place(&self.object_path(from), &self.object_path(to))
            .await
            .map_err(|e| match e {
                LinkError::Mismatch => BackendError::Conflict(to.to_string()),
                LinkError::Io(e) => not_found_or_io(e, from),
            })?;

        let status = match outcome {
            PromoteOutcome::Promoted => 201,
            PromoteOutcome::Deduplicated | PromoteOutcome::AlreadyPromoted => 200,
        };
        let object = self.describe(to).await?;
        BackendResponse::for_object(status, &object)
    }

    async fn download(&self, name: &str) -> std::result::Result<BoxReader, BackendError> {
        validate_name(name)?;
        let file = tokio::fs::File::open(self.object_path(name))
            .await
            .map_err(|e| not_found_or_io(e, name))?;
        Ok(Box::new(file))
    }

    async fn delete(&self, name: &str) -> std::result::Result<(), BackendError> {
        validate_name(name)?;
        if remove_if_exists(&self.object_path(name)).await? {
            Ok(())
        } else {
            Err(BackendError::NotFound(name.to_string()))
        }
    }

    async fn list(&self, prefix: &str) -> std::result::Result<Vec<BackendObject>, BackendError> {
        let mut listed = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') || !name.starts_with(prefix) {
                continue;
            }
            listed.push(self.describe(&name).await?);
        }
        listed.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listed)
    }

    async fn contains(&self, name: &str) -> std::result::Result<bool, BackendError> {
        validate_name(name)?;
        Ok(tokio::fs::try_exists(self.object_path(name)).await?)
    }
}
