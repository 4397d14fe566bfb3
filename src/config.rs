//! Stowage configuration
//!
//! Loaded from TOML:
//!
//! ```toml
//! [staging]
//! pending_dir = "/var/lib/stowage/pending"
//! complete_dir = "/var/lib/stowage/complete"
//!
//! [hashing]
//! algorithms = ["md5", "sha1", "sha256"]
//! primary = "sha256"
//!
//! [backend]
//! kind = "local"
//! root = "/var/lib/stowage/objects"
//!
//! [metadata]
//! crud_callback = "https://files.example.org/api/v1/hooks/crud"
//! metadata_callback = "https://files.example.org/api/v1/hooks/metadata"
//! timeout_secs = 30
//!
//! [promotion]
//! retries = 3
//! backoff_ms = 50
//! ```

use crate::core::digest::HashAlgorithm;
use crate::error::{Result, StowageError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StowageConfig {
    pub staging: StagingConfig,

    #[serde(default)]
    pub hashing: HashingConfig,

    pub backend: BackendConfig,

    pub metadata: MetadataConfig,

    #[serde(default)]
    pub promotion: PromotionConfig,

    /// Maximum undelivered commit records kept for replay
    #[serde(default = "default_desync_capacity")]
    pub desync_capacity: usize,
}

/// The two staging namespaces; must share a filesystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingConfig {
    pub pending_dir: PathBuf,
    pub complete_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashingConfig {
    #[serde(default = "default_algorithms")]
    pub algorithms: Vec<HashAlgorithm>,

    /// Content-address algorithm; strongest of `algorithms` when unset
    #[serde(default)]
    pub primary: Option<HashAlgorithm>,
}

impl HashingConfig {
    /// Resolved content-address algorithm
    pub fn primary(&self) -> Result<HashAlgorithm> {
        let primary = match self.primary {
            Some(p) => p,
            None => HashAlgorithm::strongest(&self.algorithms).ok_or_else(|| {
                StowageError::Configuration("at least one hash algorithm is required".to_string())
            })?,
        };
        if !self.algorithms.contains(&primary) {
            return Err(StowageError::Configuration(format!(
                "primary algorithm {} is not in the configured algorithms",
                primary
            )));
        }
        Ok(primary)
    }
}

impl Default for HashingConfig {
    fn default() -> Self {
        HashingConfig {
            algorithms: default_algorithms(),
            primary: None,
        }
    }
}

/// Backend selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    Memory,
    Local { root: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataConfig {
    pub crud_callback: String,
    pub metadata_callback: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Local promotion retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionConfig {
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl PromotionConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl Default for PromotionConfig {
    fn default() -> Self {
        PromotionConfig {
            retries: default_retries(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

fn default_algorithms() -> Vec<HashAlgorithm> {
    HashAlgorithm::ALL.to_vec()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_retries() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    50
}

fn default_desync_capacity() -> usize {
    1024
}

impl StowageConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: StowageConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            StowageError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hashing.algorithms.is_empty() {
            return Err(StowageError::Configuration(
                "hashing.algorithms must not be empty".to_string(),
            ));
        }
        self.hashing.primary()?;

        if self.staging.pending_dir == self.staging.complete_dir {
            return Err(StowageError::Configuration(
                "staging.pending_dir and staging.complete_dir must differ".to_string(),
            ));
        }

        if self.metadata.crud_callback.trim().is_empty()
            || self.metadata.metadata_callback.trim().is_empty()
        {
            return Err(StowageError::Configuration(
                "metadata callbacks must be set".to_string(),
            ));
        }
        if self.metadata.timeout_secs == 0 {
            return Err(StowageError::Configuration(
                "metadata.timeout_secs must be positive".to_string(),
            ));
        }

        if self.desync_capacity == 0 {
            return Err(StowageError::Configuration(
                "desync_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
