//! Content store: the upload/commit pipeline
//!
//! An upload runs strictly in this order:
//!
//! 1. stream the payload to the backend under a temporary name, fanning
//!    every chunk out to the digest accumulators and the staging file
//! 2. derive the content address from the primary digest
//! 3. rename the backend object to the address
//! 4. promote the staged copy to the address (retried, idempotent)
//! 5. send the commit record to the metadata service
//!
//! Failures before step 3 completes abort the upload and clean up both
//! temporary copies. A failure in step 4 leaves a recoverable
//! [`StowageError::PartialCommit`]. A failure in step 5 never rolls back
//! storage; it is returned as a [`MetadataDesyncWarning`] alongside the
//! successful receipt.

use crate::config::{HashingConfig, PromotionConfig, StowageConfig};
use crate::core::backend::{build_backend, BackendResponse, BoxReader, StorageBackend};
use crate::core::desync::{DesyncLog, MetadataDesyncWarning};
use crate::core::digest::{ContentAddress, DigestSet, HashAlgorithm};
use crate::core::fanout::{FanOutReader, Sink};
use crate::core::listing::ListingEntry;
use crate::core::metadata::{
    AuthContext, CommitMetadata, CommitRecord, HttpMetadataService, Identity, Location,
    MetadataService,
};
use crate::core::staging::{PendingObject, PromoteOutcome, StagingStore, TempId};
use crate::error::{BackendError, Result, StowageError};
use crate::Options;
use bytes::Bytes;
use chrono::Utc;
use std::io::Cursor;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::{debug, error, info, warn};

/// Name of the staging sink on the fan-out stream
const STAGING_SINK: &str = "file";

/// Per-call upload state; never persisted
struct UploadIntent<'a> {
    temp_id: TempId,
    backend: &'a str,
    path: &'a str,
}

/// Successful upload
#[derive(Debug)]
pub struct UploadReceipt {
    /// Backend reply to the upload request
    pub response: BackendResponse,
    /// Record that was (or should have been) sent to the metadata service
    pub record: CommitRecord,
    /// How the staged copy reached its address
    pub outcome: PromoteOutcome,
    /// Set when storage committed but the metadata service was not told
    pub warning: Option<MetadataDesyncWarning>,
}

impl UploadReceipt {
    pub fn address(&self) -> &ContentAddress {
        self.record.content_address()
    }

    pub fn size(&self) -> u64 {
        self.record.metadata.size
    }

    pub fn hashes(&self) -> &DigestSet {
        &self.record.metadata.hashes
    }

    pub fn is_deduplicated(&self) -> bool {
        self.outcome != PromoteOutcome::Promoted
    }

    /// Readable handle over the backend's upload response
    pub fn into_reader(self) -> Cursor<Bytes> {
        self.response.into_reader()
    }
}

/// Outcome of [`ContentStore::replay_desynced`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub delivered: usize,
    pub requeued: usize,
}

/// Content-addressed storage adapter
pub struct ContentStore {
    backend: Arc<dyn StorageBackend>,
    staging: StagingStore,
    metadata: Arc<dyn MetadataService>,
    auth: AuthContext,
    identity: Identity,
    algorithms: Vec<HashAlgorithm>,
    primary: HashAlgorithm,
    promotion: PromotionConfig,
    desync: DesyncLog,
}

impl ContentStore {
    pub fn builder() -> ContentStoreBuilder {
        ContentStoreBuilder::new()
    }

    /// Wire up the configured backend, staging area and HTTP metadata service
    pub fn from_config(config: &StowageConfig, auth: AuthContext, identity: Identity) -> Result<Self> {
        config.validate()?;
        let backend = build_backend(&config.backend)?;
        let staging = StagingStore::new(&config.staging.pending_dir, &config.staging.complete_dir)?;
        let metadata = HttpMetadataService::new(&config.metadata)?;

        ContentStore::builder()
            .backend(backend)
            .staging(staging)
            .metadata(Arc::new(metadata))
            .auth(auth)
            .identity(identity)
            .hashing(config.hashing.clone())
            .promotion(config.promotion.clone())
            .desync_capacity(config.desync_capacity)
            .build()
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn staging(&self) -> &StagingStore {
        &self.staging
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn primary_algorithm(&self) -> HashAlgorithm {
        self.primary
    }

    pub fn desync_log(&self) -> &DesyncLog {
        &self.desync
    }

    /// Stream `stream` into content-addressed storage
    ///
    /// # Errors
    ///
    /// - `Upload` for any failure before the backend promotion completes
    /// - `Conflict` when the address already holds different bytes
    /// - `PartialCommit` when the backend promoted but the staged copy
    ///   could not be, even after retries
    pub async fn upload<R>(&self, stream: R, path: &str, options: &Options) -> Result<UploadReceipt>
    where
        R: AsyncRead + Send + Unpin,
    {
        let pending = self
            .staging
            .create_pending()
            .await
            .map_err(StowageError::into_upload)?;
        let intent = UploadIntent {
            temp_id: pending.temp_id(),
            backend: self.backend.name(),
            path,
        };
        let temp_name = intent.temp_id.to_string();
        info!(temp_id = %temp_name, path, backend = intent.backend, "upload started");

        let mut stream = FanOutReader::new(stream);
        if let Err(e) = self.attach_sinks(&mut stream, pending) {
            drop(stream);
            self.abort(&intent).await;
            return Err(e.into_upload());
        }

        let response = match self.backend.upload(&mut stream, &temp_name, options).await {
            Ok(response) => response,
            Err(e) => {
                drop(stream);
                self.abort(&intent).await;
                return Err(StowageError::Upload {
                    status: e.status(),
                    message: format!("backend upload failed: {}", e),
                });
            }
        };

        let size = stream.bytes_read();
        let sealed = stream
            .digests()
            .and_then(|digests| digests.address(self.primary).map(|address| (digests, address)));
        // Closes the staging file before promotion
        drop(stream);
        let (digests, address) = match sealed {
            Ok(sealed) => sealed,
            Err(e) => {
                self.abort(&intent).await;
                return Err(e.into_upload());
            }
        };
        debug!(temp_id = %temp_name, address = %address, size, "digests finalized");

        if let Err(e) = self.backend.rename(&temp_name, address.as_str()).await {
            self.abort(&intent).await;
            return Err(match e {
                BackendError::Conflict(_) => StowageError::Conflict {
                    address: address.to_string(),
                    reason: "backend already holds different bytes".to_string(),
                },
                other => StowageError::Upload {
                    status: other.status(),
                    message: format!("backend promotion failed: {}", other),
                },
            });
        }

        let outcome = self.promote_local(&intent.temp_id, &address).await?;

        let record = CommitRecord {
            auth: self.auth.clone(),
            identity: self.identity.clone(),
            location: Location {
                service: intent.backend.to_string(),
                path: address.to_string(),
            },
            metadata: CommitMetadata {
                path: intent.path.to_string(),
                content_address: address.clone(),
                size,
                hashes: digests,
                committed_at: Utc::now(),
            },
        };

        let warning = match self.metadata.commit(&record).await {
            Ok(()) => None,
            Err(e) => {
                let warning = MetadataDesyncWarning::new(record.clone(), e.to_string());
                self.desync.record(warning.clone());
                Some(warning)
            }
        };

        info!(
            address = %address,
            size,
            deduplicated = outcome != PromoteOutcome::Promoted,
            indexed = warning.is_none(),
            "upload committed"
        );
        Ok(UploadReceipt {
            response,
            record,
            outcome,
            warning,
        })
    }

    /// Finish a local promotion left behind by `PartialCommit`
    pub async fn resume_promotion(
        &self,
        temp_id: &TempId,
        address: &ContentAddress,
    ) -> Result<PromoteOutcome> {
        self.staging.promote(temp_id, address).await
    }

    /// Resolve `path` through the metadata service and stream it from the backend
    pub async fn download(&self, path: &str, options: &Options) -> Result<BoxReader> {
        let location = self
            .metadata
            .resolve(path, options)
            .await
            .map_err(|e| StowageError::Download {
                status: e.status(),
                message: format!("cannot resolve {}: {}", path, e),
            })?;
        debug!(path, service = %location.service, object = %location.path, "resolved download");

        if location.service != self.backend.name() {
            warn!(path, service = %location.service, backend = self.backend.name(), "location belongs to another backend");
            return Err(StowageError::Download {
                status: 400,
                message: format!(
                    "{} is stored by '{}', not by the '{}' backend",
                    path,
                    location.service,
                    self.backend.name()
                ),
            });
        }

        self.backend
            .download(&location.path)
            .await
            .map_err(|e| StowageError::Download {
                status: e.status(),
                message: e.to_string(),
            })
    }

    /// Always refused: backend and metadata removal are not coordinated yet
    pub async fn delete(&self, path: &str, _options: &Options) -> Result<()> {
        warn!(path, "delete requested but not supported");
        Err(StowageError::Delete {
            status: 501,
            message: format!(
                "cannot delete {}: backend and metadata deletion are not coordinated",
                path
            ),
        })
    }

    /// Normalized listing of `path`
    pub async fn metadata(&self, path: &str, options: &Options) -> Result<Vec<ListingEntry>> {
        let raw = self.metadata.list(path, options).await?;
        Ok(raw
            .into_iter()
            .map(|entry| ListingEntry::from_raw(&self.identity.provider, entry))
            .collect())
    }

    /// Resend every undelivered commit record; failures are queued again
    pub async fn replay_desynced(&self) -> ReplayReport {
        let mut report = ReplayReport::default();
        for warning in self.desync.drain() {
            match self.metadata.commit(&warning.record).await {
                Ok(()) => {
                    info!(address = %warning.record.content_address(), "replayed commit record");
                    report.delivered += 1;
                }
                Err(e) => {
                    self.desync
                        .record(MetadataDesyncWarning::new(warning.record, e.to_string()));
                    report.requeued += 1;
                }
            }
        }
        report
    }

    fn attach_sinks<R>(&self, stream: &mut FanOutReader<R>, pending: PendingObject) -> Result<()> {
        for algorithm in &self.algorithms {
            stream.attach_digest(*algorithm)?;
        }
        stream.attach(STAGING_SINK, Sink::writer(pending))
    }

    async fn promote_local(&self, temp_id: &TempId, address: &ContentAddress) -> Result<PromoteOutcome> {
        let mut attempt: u32 = 0;
        loop {
            match self.staging.promote(temp_id, address).await {
                Ok(outcome) => return Ok(outcome),
                Err(e @ StowageError::Conflict { .. }) => {
                    error!(temp_id = %temp_id, address = %address, "staged copy conflicts with stored object");
                    return Err(e);
                }
                Err(e) if attempt < self.promotion.retries => {
                    attempt += 1;
                    warn!(temp_id = %temp_id, address = %address, attempt, error = %e, "local promotion failed, retrying");
                    tokio::time::sleep(self.promotion.backoff() * attempt).await;
                }
                Err(e) => {
                    error!(temp_id = %temp_id, address = %address, error = %e, "local promotion failed, backend already committed");
                    return Err(StowageError::PartialCommit {
                        address: address.to_string(),
                        temp_id: temp_id.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    /// Best-effort cleanup of both temporary copies
    async fn abort(&self, intent: &UploadIntent<'_>) {
        let temp_name = intent.temp_id.to_string();
        if let Err(e) = self.staging.discard(&intent.temp_id).await {
            warn!(temp_id = %temp_name, error = %e, "could not discard pending object");
        }
        match self.backend.delete(&temp_name).await {
            Ok(()) | Err(BackendError::NotFound(_)) => {}
            Err(e) => warn!(temp_id = %temp_name, error = %e, "could not remove backend temp object"),
        }
        info!(temp_id = %temp_name, path = intent.path, "upload aborted");
    }
}

/// Builder for [`ContentStore`]
pub struct ContentStoreBuilder {
    backend: Option<Arc<dyn StorageBackend>>,
    staging: Option<StagingStore>,
    metadata: Option<Arc<dyn MetadataService>>,
    auth: AuthContext,
    identity: Option<Identity>,
    hashing: HashingConfig,
    promotion: PromotionConfig,
    desync_capacity: usize,
}

impl ContentStoreBuilder {
    pub fn new() -> Self {
        ContentStoreBuilder {
            backend: None,
            staging: None,
            metadata: None,
            auth: AuthContext::default(),
            identity: None,
            hashing: HashingConfig::default(),
            promotion: PromotionConfig::default(),
            desync_capacity: 1024,
        }
    }

    pub fn backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn staging(mut self, staging: StagingStore) -> Self {
        self.staging = Some(staging);
        self
    }

    pub fn metadata(mut self, metadata: Arc<dyn MetadataService>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn auth(mut self, auth: AuthContext) -> Self {
        self.auth = auth;
        self
    }

    /// An empty provider is filled in with the backend's name
    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn hashing(mut self, hashing: HashingConfig) -> Self {
        self.hashing = hashing;
        self
    }

    pub fn promotion(mut self, promotion: PromotionConfig) -> Self {
        self.promotion = promotion;
        self
    }

    pub fn desync_capacity(mut self, capacity: usize) -> Self {
        self.desync_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<ContentStore> {
        let backend = self
            .backend
            .ok_or_else(|| StowageError::Configuration("a storage backend is required".to_string()))?;
        let staging = self
            .staging
            .ok_or_else(|| StowageError::Configuration("a staging store is required".to_string()))?;
        let metadata = self.metadata.ok_or_else(|| {
            StowageError::Configuration("a metadata service is required".to_string())
        })?;

        if self.hashing.algorithms.is_empty() {
            return Err(StowageError::Configuration(
                "at least one hash algorithm is required".to_string(),
            ));
        }
        let primary = self.hashing.primary()?;

        let mut algorithms = self.hashing.algorithms;
        algorithms.sort();
        algorithms.dedup();

        let mut identity = self.identity.unwrap_or_default();
        if identity.provider.is_empty() {
            identity.provider = backend.name().to_string();
        }

        Ok(ContentStore {
            backend,
            staging,
            metadata,
            auth: self.auth,
            identity,
            algorithms,
            primary,
            promotion: self.promotion,
            desync: DesyncLog::new(self.desync_capacity),
        })
    }
}

impl Default for ContentStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}
