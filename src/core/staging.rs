//! Two-namespace staging area
//!
//! Bytes land in the **pending** namespace under a random [`TempId`] while an
//! upload streams, then get promoted into the **complete** namespace under
//! their [`ContentAddress`]:
//!
//! ```text
//! <pending_dir>/<uuid>
//! <complete_dir>/<hex[0..2]>/<hex[2..4]>/<hex>
//! ```
//!
//! Promotion is a hard link followed by removal of the pending name. The
//! link fails atomically when the address already exists, so concurrent
//! promotions of identical content have exactly one winner and never
//! overwrite each other. Both directories must live on the same filesystem.

use crate::core::digest::ContentAddress;
use crate::core::fanout::ChunkSink;
use crate::error::{Result, StowageError};
use std::fmt;
use std::future::{poll_fn, Future};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncReadExt, AsyncWrite};
use tracing::{debug, info, warn};
use uuid::Uuid;

const COMPARE_CHUNK: usize = 64 * 1024;

/// Random identifier of an in-flight upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TempId(Uuid);

impl TempId {
    pub fn new() -> Self {
        TempId(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(TempId)
            .map_err(|e| StowageError::Configuration(format!("invalid pending id '{}': {}", s, e)))
    }
}

impl Default for TempId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TempId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Result of a successful promotion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromoteOutcome {
    /// The pending object now lives at the address
    Promoted,
    /// Identical bytes were already stored; the pending copy was dropped
    Deduplicated,
    /// Nothing pending and the address exists: an earlier attempt finished
    AlreadyPromoted,
}

type Sealing = Pin<Box<dyn Future<Output = io::Result<()>> + Send>>;

/// Writable pending object, attached to the fan-out stream as a sink
///
/// Writes go through `tokio::fs`, so a sink waiting on disk suspends the
/// upload instead of the executor thread.
pub struct PendingObject {
    temp_id: TempId,
    path: PathBuf,
    file: Option<tokio::fs::File>,
    sealing: Option<Sealing>,
    written: u64,
}

impl PendingObject {
    fn new(temp_id: TempId, path: PathBuf, file: tokio::fs::File) -> Self {
        PendingObject {
            temp_id,
            path,
            file: Some(file),
            sealing: None,
            written: 0,
        }
    }

    pub fn temp_id(&self) -> TempId {
        self.temp_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written through this handle
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Append bytes outside of a fan-out stream
    pub async fn append(&mut self, mut bytes: &[u8]) -> io::Result<()> {
        while !bytes.is_empty() {
            let n = poll_fn(|cx| self.poll_write_chunk(cx, bytes)).await?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            bytes = &bytes[n..];
        }
        Ok(())
    }

    /// Flush, fsync and close; further appends fail
    pub async fn seal(&mut self) -> io::Result<()> {
        poll_fn(|cx| self.poll_finish(cx)).await
    }
}

impl ChunkSink for PendingObject {
    fn poll_write_chunk(&mut self, cx: &mut Context<'_>, chunk: &[u8]) -> Poll<io::Result<usize>> {
        let Some(file) = self.file.as_mut() else {
            return Poll::Ready(Err(io::Error::other(format!(
                "pending object {} already sealed",
                self.temp_id
            ))));
        };
        let n = ready!(Pin::new(file).poll_write(cx, chunk))?;
        self.written += n as u64;
        Poll::Ready(Ok(n))
    }

    fn poll_finish(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Some(file) = self.file.as_mut() {
            // Surfaces errors of writes still in flight
            ready!(Pin::new(file).poll_flush(cx))?;
            if let Some(file) = self.file.take() {
                self.sealing = Some(Box::pin(async move { file.sync_all().await }));
            }
        }
        let Some(sealing) = self.sealing.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let result = ready!(sealing.as_mut().poll(cx));
        self.sealing = None;
        if result.is_ok() {
            debug!(temp_id = %self.temp_id, bytes = self.written, "pending object sealed");
        }
        Poll::Ready(result)
    }
}

/// Staging area with pending and complete namespaces
#[derive(Debug, Clone)]
pub struct StagingStore {
    pending_dir: PathBuf,
    complete_dir: PathBuf,
}

impl StagingStore {
    /// Open (creating if needed) the two namespace directories
    pub fn new(pending_dir: impl AsRef<Path>, complete_dir: impl AsRef<Path>) -> Result<Self> {
        let pending_dir = pending_dir.as_ref().to_path_buf();
        let complete_dir = complete_dir.as_ref().to_path_buf();

        if pending_dir == complete_dir {
            return Err(StowageError::Configuration(
                "pending and complete namespaces must be distinct directories".to_string(),
            ));
        }
        for dir in [&pending_dir, &complete_dir] {
            std::fs::create_dir_all(dir).map_err(|e| {
                StowageError::Resource(format!("cannot create {}: {}", dir.display(), e))
            })?;
        }

        info!(
            pending = %pending_dir.display(),
            complete = %complete_dir.display(),
            "staging store ready"
        );
        Ok(StagingStore {
            pending_dir,
            complete_dir,
        })
    }

    pub fn pending_dir(&self) -> &Path {
        &self.pending_dir
    }

    pub fn complete_dir(&self) -> &Path {
        &self.complete_dir
    }

    pub fn pending_path(&self, temp_id: &TempId) -> PathBuf {
        self.pending_dir.join(temp_id.to_string())
    }

    pub fn complete_path(&self, address: &ContentAddress) -> PathBuf {
        let (a, b) = address.shards();
        self.complete_dir.join(a).join(b).join(address.as_str())
    }

    /// Allocate a fresh pending object
    pub async fn create_pending(&self) -> Result<PendingObject> {
        let temp_id = TempId::new();
        let path = self.pending_path(&temp_id);

        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| {
                StowageError::Resource(format!("cannot create {}: {}", path.display(), e))
            })?;

        debug!(temp_id = %temp_id, path = %path.display(), "created pending object");
        Ok(PendingObject::new(temp_id, path, file))
    }

    /// Reopen an existing pending object for appending
    pub async fn open_pending(&self, temp_id: &TempId) -> Result<PendingObject> {
        let path = self.pending_path(temp_id);
        let file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StowageError::Resource(format!("cannot open {}: {}", path.display(), e)))?;
        Ok(PendingObject::new(*temp_id, path, file))
    }

    /// Append bytes to an existing pending object and seal it again
    ///
    /// Out-of-band path for callers holding only a [`TempId`]; streaming
    /// uploads append through the [`PendingObject`] sink directly.
    pub async fn write(&self, temp_id: &TempId, bytes: &[u8]) -> Result<()> {
        let mut pending = self.open_pending(temp_id).await?;
        pending.append(bytes).await?;
        pending.seal().await?;
        Ok(())
    }

    /// Promote a pending object to its content address
    ///
    /// Safe to retry: repeating a promotion that already happened reports
    /// `AlreadyPromoted` or `Deduplicated` instead of failing.
    ///
    /// # Errors
    ///
    /// `Conflict` if the address holds different bytes; the pending object
    /// is kept for inspection in that case.
    pub async fn promote(&self, temp_id: &TempId, address: &ContentAddress) -> Result<PromoteOutcome> {
        let pending = self.pending_path(temp_id);
        let complete = self.complete_path(address);

        let outcome = link_into_place(&pending, &complete)
            .await
            .map_err(|e| match e {
                LinkError::Mismatch => StowageError::Conflict {
                    address: address.to_string(),
                    reason: format!("staged bytes of {} differ from stored object", temp_id),
                },
                LinkError::Io(e) => StowageError::Resource(format!(
                    "promoting {} to {}: {}",
                    temp_id, address, e
                )),
            })?;

        match outcome {
            PromoteOutcome::Promoted => info!(temp_id = %temp_id, address = %address, "promoted staged object"),
            PromoteOutcome::Deduplicated => info!(temp_id = %temp_id, address = %address, "dedup hit, dropped pending copy"),
            PromoteOutcome::AlreadyPromoted => debug!(temp_id = %temp_id, address = %address, "promotion already complete"),
        }
        Ok(outcome)
    }

    /// Drop a pending object; returns whether anything was removed
    pub async fn discard(&self, temp_id: &TempId) -> Result<bool> {
        let removed = remove_if_exists(&self.pending_path(temp_id)).await?;
        if removed {
            debug!(temp_id = %temp_id, "discarded pending object");
        }
        Ok(removed)
    }

    pub async fn contains(&self, address: &ContentAddress) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.complete_path(address)).await?)
    }

    /// Read a committed object back in full
    pub async fn read(&self, address: &ContentAddress) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(self.complete_path(address)).await?)
    }

    /// Pending objects currently on disk, for an external reaper
    pub async fn pending_ids(&self) -> Result<Vec<TempId>> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.pending_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            match name.to_str().map(TempId::parse) {
                Some(Ok(id)) => ids.push(id),
                _ => warn!(entry = ?name, "ignoring foreign file in pending namespace"),
            }
        }
        Ok(ids)
    }
}

pub(crate) enum LinkError {
    /// Destination exists with different bytes
    Mismatch,
    Io(io::Error),
}

impl From<io::Error> for LinkError {
    fn from(e: io::Error) -> Self {
        LinkError::Io(e)
    }
}

/// Expose `from` at `to` without ever clobbering `to`, then drop `from`.
pub(crate) async fn link_into_place(
    from: &Path,
    to: &Path,
) -> std::result::Result<PromoteOutcome, LinkError> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    match tokio::fs::hard_link(from, to).await {
        Ok(()) => {
            remove_if_exists(from).await?;
            Ok(PromoteOutcome::Promoted)
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            if files_identical(from, to).await? {
                remove_if_exists(from).await?;
                Ok(PromoteOutcome::Deduplicated)
            } else {
                Err(LinkError::Mismatch)
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let from_exists = tokio::fs::try_exists(from).await?;
            if !from_exists && tokio::fs::try_exists(to).await? {
                Ok(PromoteOutcome::AlreadyPromoted)
            } else {
                Err(LinkError::Io(e))
            }
        }
        Err(e) => Err(LinkError::Io(e)),
    }
}

pub(crate) async fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Byte-for-byte comparison of two files
pub(crate) async fn files_identical(a: &Path, b: &Path) -> io::Result<bool> {
    let (meta_a, meta_b) = (tokio::fs::metadata(a).await?, tokio::fs::metadata(b).await?);
    if meta_a.len() != meta_b.len() {
        return Ok(false);
    }

    let mut file_a = tokio::fs::File::open(a).await?;
    let mut file_b = tokio::fs::File::open(b).await?;
    let mut buf_a = vec![0u8; COMPARE_CHUNK];
    let mut buf_b = vec![0u8; COMPARE_CHUNK];

    loop {
        let n_a = read_full(&mut file_a, &mut buf_a).await?;
        let n_b = read_full(&mut file_b, &mut buf_b).await?;
        if n_a != n_b || buf_a[..n_a] != buf_b[..n_b] {
            return Ok(false);
        }
        if n_a == 0 {
            return Ok(true);
        }
    }
}

async fn read_full(file: &mut tokio::fs::File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::digest::{digest_hex, HashAlgorithm};
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> StagingStore {
        StagingStore::new(dir.path().join("pending"), dir.path().join("complete")).unwrap()
    }

    fn address_of(data: &[u8]) -> ContentAddress {
        ContentAddress::new(digest_hex(HashAlgorithm::Sha256, data)).unwrap()
    }

    async fn stage(store: &StagingStore, data: &[u8]) -> TempId {
        let mut pending = store.create_pending().await.unwrap();
        pending.append(data).await.unwrap();
        pending.seal().await.unwrap();
        pending.temp_id()
    }

    #[test]
    fn test_namespaces_must_differ() {
        let dir = TempDir::new().unwrap();
        let err = StagingStore::new(dir.path(), dir.path()).unwrap_err();
        assert!(matches!(err, StowageError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_promote_moves_object() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let temp_id = stage(&store, b"hello").await;
        let address = address_of(b"hello");

        assert!(!store.contains(&address).await.unwrap());
        let outcome = store.promote(&temp_id, &address).await.unwrap();

        assert_eq!(outcome, PromoteOutcome::Promoted);
        assert!(store.contains(&address).await.unwrap());
        assert!(!store.pending_path(&temp_id).exists());
        assert_eq!(store.read(&address).await.unwrap(), b"hello");
        assert!(store
            .complete_path(&address)
            .starts_with(dir.path().join("complete").join("2c").join("f2")));
    }

    #[tokio::test]
    async fn test_promote_identical_content_deduplicates() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let address = address_of(b"same bytes");

        let first = stage(&store, b"same bytes").await;
        let second = stage(&store, b"same bytes").await;

        assert_eq!(store.promote(&first, &address).await.unwrap(), PromoteOutcome::Promoted);
        assert_eq!(
            store.promote(&second, &address).await.unwrap(),
            PromoteOutcome::Deduplicated
        );
        assert!(!store.pending_path(&second).exists());
        assert_eq!(store.read(&address).await.unwrap(), b"same bytes");
    }

    #[tokio::test]
    async fn test_promote_mismatch_conflicts_without_overwrite() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let address = address_of(b"original");

        let original = stage(&store, b"original").await;
        store.promote(&original, &address).await.unwrap();

        let impostor = stage(&store, b"tampered").await;
        let err = store.promote(&impostor, &address).await.unwrap_err();

        assert!(matches!(err, StowageError::Conflict { .. }));
        assert_eq!(store.read(&address).await.unwrap(), b"original");
        assert!(store.pending_path(&impostor).exists());
    }

    #[tokio::test]
    async fn test_promote_is_retry_safe() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let temp_id = stage(&store, b"retry me").await;
        let address = address_of(b"retry me");

        store.promote(&temp_id, &address).await.unwrap();
        assert_eq!(
            store.promote(&temp_id, &address).await.unwrap(),
            PromoteOutcome::AlreadyPromoted
        );
    }

    #[tokio::test]
    async fn test_promote_missing_pending_fails() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let err = store
            .promote(&TempId::new(), &address_of(b"never staged"))
            .await
            .unwrap_err();
        assert!(matches!(err, StowageError::Resource(_)));
    }

    #[tokio::test]
    async fn test_incremental_write_and_discard() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let mut pending = store.create_pending().await.unwrap();
        pending.seal().await.unwrap();
        let temp_id = pending.temp_id();
        drop(pending);

        store.write(&temp_id, b"part one, ").await.unwrap();
        store.write(&temp_id, b"part two").await.unwrap();
        assert_eq!(
            tokio::fs::read(store.pending_path(&temp_id)).await.unwrap(),
            b"part one, part two"
        );

        assert_eq!(store.pending_ids().await.unwrap(), vec![temp_id]);
        assert!(store.discard(&temp_id).await.unwrap());
        assert!(!store.discard(&temp_id).await.unwrap());
        assert!(store.pending_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_after_finish_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut pending = store.create_pending().await.unwrap();
        pending.append(b"abc").await.unwrap();
        pending.seal().await.unwrap();
        pending.seal().await.unwrap();

        assert_eq!(pending.written(), 3);
        assert!(pending.append(b"late").await.is_err());
        assert_eq!(tokio::fs::read(pending.path()).await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_pending_object_as_fan_out_sink() {
        use crate::core::fanout::{FanOutReader, Sink};

        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let pending = store.create_pending().await.unwrap();
        let path = pending.path().to_path_buf();
        let data = vec![42u8; 200 * 1024];

        let mut reader = FanOutReader::new(&data[..]);
        reader.attach_digest(HashAlgorithm::Sha256).unwrap();
        reader.attach("file", Sink::writer(pending)).unwrap();

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();

        assert_eq!(out, data);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), data);
        assert_eq!(
            reader.digest("sha256").unwrap(),
            digest_hex(HashAlgorithm::Sha256, &data)
        );
    }

    #[tokio::test]
    async fn test_open_missing_pending_is_resource_error() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let err = store.write(&TempId::new(), b"orphan").await.unwrap_err();
        assert!(matches!(err, StowageError::Resource(_)));
    }

    #[tokio::test]
    async fn test_create_pending_without_namespace_is_resource_error() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        std::fs::remove_dir_all(store.pending_dir()).unwrap();

        match store.create_pending().await {
            Err(StowageError::Resource(msg)) => assert!(msg.contains("cannot create")),
            Err(other) => panic!("unexpected error: {:?}", other),
            Ok(_) => panic!("pending object created without a namespace"),
        }
    }

    #[tokio::test]
    async fn test_files_identical() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let c = dir.path().join("c");
        let big = vec![7u8; COMPARE_CHUNK * 2 + 17];
        let mut other = big.clone();
        *other.last_mut().unwrap() = 8;

        tokio::fs::write(&a, &big).await.unwrap();
        tokio::fs::write(&b, &big).await.unwrap();
        tokio::fs::write(&c, &other).await.unwrap();

        assert!(files_identical(&a, &b).await.unwrap());
        assert!(!files_identical(&a, &c).await.unwrap());
    }
}
