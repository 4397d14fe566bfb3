//! # Stowage - Content-Addressed Storage Adapter
//!
//! `stowage` streams uploads into a storage backend under a temporary name,
//! fingerprints them on the way through, and then commits them under their
//! content address:
//!
//! - **Single-pass hashing**: every chunk is fanned out to MD5, SHA-1 and
//!   SHA-256 accumulators and a local staging file as it streams past
//! - **Two-phase promotion**: the backend object is renamed first, then the
//!   staged copy, so nothing is reachable under an address until both hold it
//! - **Deduplication**: identical content uploaded twice lands once
//! - **Metadata notification**: committed objects are reported to an HTTP
//!   metadata service; failed notifications are kept for replay
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stowage::{AuthContext, ContentStore, Identity, Options, Result, StowageConfig};
//!
//! # async fn run() -> Result<()> {
//! let config = StowageConfig::load("stowage.toml")?;
//! let store = ContentStore::from_config(&config, AuthContext::default(), Identity::default())?;
//!
//! let receipt = store
//!     .upload(&b"hello"[..], "/greetings/hello.txt", &Options::new())
//!     .await?;
//! println!("stored at {}", receipt.address());
//! # Ok(())
//! # }
//! ```
//!
//! ## Custom Wiring
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use stowage::{
//!     ContentStore, HttpMetadataService, MemoryBackend, Result, StagingStore, StowageConfig,
//! };
//!
//! # fn run(config: &StowageConfig) -> Result<()> {
//! let store = ContentStore::builder()
//!     .backend(Arc::new(MemoryBackend::new()))
//!     .staging(StagingStore::new("/tmp/stowage/pending", "/tmp/stowage/complete")?)
//!     .metadata(Arc::new(HttpMetadataService::new(&config.metadata)?))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod store;

use std::collections::BTreeMap;

/// Caller-supplied, backend-specific upload and lookup options
pub type Options = BTreeMap<String, String>;

pub use crate::config::{
    BackendConfig, HashingConfig, MetadataConfig, PromotionConfig, StagingConfig, StowageConfig,
};
pub use crate::core::{
    backend::{BackendObject, BackendResponse, BoxReader, LocalBackend, MemoryBackend, StorageBackend},
    desync::{DesyncLog, MetadataDesyncWarning},
    digest::{digest_hex, ContentAddress, DigestSet, HashAlgorithm, Hasher},
    fanout::{ChunkSink, FanOutReader, Sink},
    listing::{EntryKind, ListingEntry, RawEntry},
    metadata::{
        AuthContext, CommitMetadata, CommitRecord, HttpMetadataService, Identity, Location,
        MetadataService,
    },
    staging::{PendingObject, PromoteOutcome, StagingStore, TempId},
};
pub use crate::error::{BackendError, MetadataError, Result, StowageError};
pub use crate::store::{ContentStore, ContentStoreBuilder, ReplayReport, UploadReceipt};
