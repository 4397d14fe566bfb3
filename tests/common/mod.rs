//! Shared fixtures for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use stowage::{
    BackendError, BackendObject, BackendResponse, BoxReader, CommitRecord, ContentStore,
    Location, MemoryBackend, MetadataError, MetadataService, Options, PromotionConfig, RawEntry,
    StagingStore, StorageBackend,
};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt};

pub fn staging(dir: &TempDir) -> StagingStore {
    StagingStore::new(dir.path().join("pending"), dir.path().join("complete")).unwrap()
}

pub fn store(
    dir: &TempDir,
    backend: Arc<dyn StorageBackend>,
    metadata: Arc<RecordingMetadata>,
) -> ContentStore {
    ContentStore::builder()
        .backend(backend)
        .staging(staging(dir))
        .metadata(metadata)
        .promotion(PromotionConfig {
            retries: 2,
            backoff_ms: 1,
        })
        .build()
        .unwrap()
}

pub async fn read_all(mut reader: BoxReader) -> Vec<u8> {
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    out
}

/// Every file under `dir`, recursively
pub fn files_under(dir: &std::path::Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(next) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&next) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                found.push(path);
            }
        }
    }
    found.sort();
    found
}

/// In-memory metadata service that records every commit
///
/// When `observe` is set, each commit checks that the object is already
/// present in both the backend and the staging area.
#[derive(Default)]
pub struct RecordingMetadata {
    commits: Mutex<Vec<CommitRecord>>,
    locations: Mutex<HashMap<String, Location>>,
    listing: Mutex<Vec<RawEntry>>,
    failures_left: AtomicUsize,
    observe: Option<(Arc<dyn StorageBackend>, StagingStore)>,
    committed_visible: Mutex<Vec<bool>>,
}

impl RecordingMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observing(backend: Arc<dyn StorageBackend>, staging: StagingStore) -> Self {
        RecordingMetadata {
            observe: Some((backend, staging)),
            ..Self::default()
        }
    }

    /// Fail the next `n` commits with a 503
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Index `path` at `location` without going through a commit
    pub fn index(&self, path: &str, location: Location) {
        self.locations.lock().insert(path.to_string(), location);
    }

    pub fn set_listing(&self, entries: Vec<RawEntry>) {
        *self.listing.lock() = entries;
    }

    pub fn commits(&self) -> Vec<CommitRecord> {
        self.commits.lock().clone()
    }

    /// One flag per commit: was the object in both stores when it arrived
    pub fn committed_visible(&self) -> Vec<bool> {
        self.committed_visible.lock().clone()
    }
}

#[async_trait]
impl MetadataService for RecordingMetadata {
    async fn resolve(&self, path: &str, _options: &Options) -> Result<Location, MetadataError> {
        self.locations
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| MetadataError::Status {
                status: 404,
                body: format!("{} is not indexed", path),
            })
    }

    async fn commit(&self, record: &CommitRecord) -> Result<(), MetadataError> {
        if let Some((backend, staging)) = &self.observe {
            let address = record.content_address();
            let in_backend = backend.contains(address.as_str()).await.unwrap_or(false);
            let in_staging = staging.contains(address).await.unwrap_or(false);
            self.committed_visible.lock().push(in_backend && in_staging);
        }

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(MetadataError::Unavailable("metadata service is down".to_string()));
        }

        self.locations
            .lock()
            .insert(record.metadata.path.clone(), record.location.clone());
        self.commits.lock().push(record.clone());
        Ok(())
    }

    async fn list(&self, _path: &str, _options: &Options) -> Result<Vec<RawEntry>, MetadataError> {
        Ok(self.listing.lock().clone())
    }
}

type RenameHook = Box<dyn Fn() + Send + Sync>;

/// Memory backend with injectable rename failures
pub struct FlakyBackend {
    pub inner: MemoryBackend,
    fail_rename: AtomicBool,
    after_rename: Option<RenameHook>,
}

impl FlakyBackend {
    pub fn new(inner: MemoryBackend) -> Self {
        FlakyBackend {
            inner,
            fail_rename: AtomicBool::new(false),
            after_rename: None,
        }
    }

    /// Run `hook` after every successful rename
    pub fn with_rename_hook(inner: MemoryBackend, hook: impl Fn() + Send + Sync + 'static) -> Self {
        FlakyBackend {
            inner,
            fail_rename: AtomicBool::new(false),
            after_rename: Some(Box::new(hook)),
        }
    }

    pub fn fail_renames(&self, fail: bool) {
        self.fail_rename.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl StorageBackend for FlakyBackend {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn upload(
        &self,
        stream: &mut (dyn AsyncRead + Send + Unpin),
        name: &str,
        options: &Options,
    ) -> Result<BackendResponse, BackendError> {
        self.inner.upload(stream, name, options).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<BackendResponse, BackendError> {
        if self.fail_rename.load(Ordering::SeqCst) {
            return Err(BackendError::Request {
                status: 503,
                message: "rename unavailable".to_string(),
            });
        }
        let response = self.inner.rename(from, to).await?;
        if let Some(hook) = &self.after_rename {
            hook();
        }
        Ok(response)
    }

    async fn download(&self, name: &str) -> Result<BoxReader, BackendError> {
        self.inner.download(name).await
    }

    async fn delete(&self, name: &str) -> Result<(), BackendError> {
        self.inner.delete(name).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BackendObject>, BackendError> {
        self.inner.list(prefix).await
    }

    async fn contains(&self, name: &str) -> Result<bool, BackendError> {
        self.inner.contains(name).await
    }
}
