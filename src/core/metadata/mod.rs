//! Metadata service collaborator
//!
//! The metadata service indexes committed objects. It is contacted three
//! ways: to resolve a virtual path into a backend location before a
//! download, to receive a [`CommitRecord`] after a successful promotion,
//! and to list entries under a path.

mod http;

pub use http::HttpMetadataService;

use crate::core::digest::{ContentAddress, DigestSet};
use crate::core::listing::RawEntry;
use crate::error::MetadataError;
use crate::Options;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where an object lives inside a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Backend service name
    pub service: String,
    /// Object name inside that backend
    pub path: String,
}

/// Credentials forwarded to the metadata service on commit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthContext {
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Identity the upload is performed for
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Name of the backend this identity stores into
    pub provider: String,
    /// Owning node or project, when the metadata service scopes by one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
}

/// Object facts carried by a commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMetadata {
    /// Caller-visible virtual path
    pub path: String,
    pub content_address: ContentAddress,
    pub size: u64,
    pub hashes: DigestSet,
    pub committed_at: DateTime<Utc>,
}

/// Notification sent after both promotions succeed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub auth: AuthContext,
    pub identity: Identity,
    pub location: Location,
    pub metadata: CommitMetadata,
}

impl CommitRecord {
    pub fn content_address(&self) -> &ContentAddress {
        &self.metadata.content_address
    }
}

#[async_trait]
pub trait MetadataService: Send + Sync {
    /// Resolve a virtual path to the backend location of its bytes
    async fn resolve(&self, path: &str, options: &Options) -> Result<Location, MetadataError>;

    /// Record a committed object
    async fn commit(&self, record: &CommitRecord) -> Result<(), MetadataError>;

    /// Raw entries under a virtual path
    async fn list(&self, path: &str, options: &Options) -> Result<Vec<RawEntry>, MetadataError>;
}
