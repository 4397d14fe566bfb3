//! Error types for stowage operations

use thiserror::Error;

/// Stowage operation result type
pub type Result<T> = std::result::Result<T, StowageError>;

/// Errors surfaced to callers of the upload/download/delete/metadata operations
#[derive(Error, Debug)]
pub enum StowageError {
    /// Resolving or fetching an object failed
    #[error("Download failed (status {status}): {message}")]
    Download { status: u16, message: String },

    /// Upload aborted before the object was committed
    #[error("Upload failed (status {status}): {message}")]
    Upload { status: u16, message: String },

    /// Delete is refused or failed
    #[error("Delete failed (status {status}): {message}")]
    Delete { status: u16, message: String },

    /// Misuse of the pipeline or invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Digest requested before the stream was exhausted
    #[error("Digest not ready: {0}")]
    NotReady(String),

    /// Staging area unreachable or unwritable
    #[error("Staging area unavailable: {0}")]
    Resource(String),

    /// Content address already holds different bytes
    #[error("Content address conflict at {address}: {reason}")]
    Conflict { address: String, reason: String },

    /// Malformed content address
    #[error("Invalid content address: {0}")]
    InvalidAddress(String),

    /// Backend promoted the object but the local mirror is still pending
    #[error("Partial commit of {address} (pending {temp_id}): {reason}")]
    PartialCommit {
        address: String,
        temp_id: String,
        reason: String,
    },

    /// Metadata service failure outside the upload commit path
    #[error("Metadata service error: {0}")]
    Metadata(#[from] MetadataError),

    /// Backend failure outside the upload path
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// Config file parse error
    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StowageError {
    /// Status code reported to callers (HTTP semantics)
    pub fn status(&self) -> u16 {
        match self {
            StowageError::Download { status, .. }
            | StowageError::Upload { status, .. }
            | StowageError::Delete { status, .. } => *status,
            StowageError::Configuration(_) | StowageError::InvalidAddress(_) => 400,
            StowageError::Conflict { .. } => 409,
            StowageError::NotReady(_) => 425,
            StowageError::Resource(_) => 503,
            StowageError::Backend(e) => e.status(),
            StowageError::Metadata(e) => e.status(),
            StowageError::PartialCommit { .. } | StowageError::Toml(_) | StowageError::Io(_) => {
                500
            }
        }
    }

    /// Collapse any pre-commit failure into an `Upload` error.
    ///
    /// Conflicts keep their own kind.
    pub(crate) fn into_upload(self) -> StowageError {
        match self {
            StowageError::Conflict { .. } | StowageError::Upload { .. } => self,
            other => StowageError::Upload {
                status: other.status(),
                message: other.to_string(),
            },
        }
    }
}

/// Errors reported by a storage backend
#[derive(Error, Debug)]
pub enum BackendError {
    /// Object does not exist
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Destination already holds different content
    #[error("Object already exists with different content: {0}")]
    Conflict(String),

    /// Backend rejected the request
    #[error("Backend request failed (status {status}): {message}")]
    Request { status: u16, message: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Reply body could not be encoded
    #[error("Cannot encode backend reply: {0}")]
    Encode(#[from] serde_json::Error),
}

impl BackendError {
    pub fn status(&self) -> u16 {
        match self {
            BackendError::NotFound(_) => 404,
            BackendError::Conflict(_) => 409,
            BackendError::Request { status, .. } => *status,
            BackendError::Io(_) | BackendError::Encode(_) => 500,
        }
    }
}

/// Errors reported by the metadata service
#[derive(Error, Debug)]
pub enum MetadataError {
    /// Transport failure, including timeouts
    #[error("Metadata request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Callback answered with a non-success status
    #[error("Metadata callback returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Service could not be reached or refused the call
    #[error("Metadata service unavailable: {0}")]
    Unavailable(String),
}

impl MetadataError {
    pub fn status(&self) -> u16 {
        match self {
            MetadataError::Http(e) if e.is_timeout() => 504,
            MetadataError::Http(e) => e.status().map(|s| s.as_u16()).unwrap_or(502),
            MetadataError::Status { status, .. } => *status,
            MetadataError::Unavailable(_) => 503,
        }
    }
}
