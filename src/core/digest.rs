//! Streaming digest accumulators and content addresses
//!
//! Every upload is hashed with a configurable set of algorithms in a single
//! pass. One of them, the primary algorithm, names the committed object.

use crate::error::{Result, StowageError};
use md5::Md5;
use serde::{Deserialize, Deserializer, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Supported digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    /// Every supported algorithm, weakest first
    pub const ALL: [HashAlgorithm; 3] = [HashAlgorithm::Md5, HashAlgorithm::Sha1, HashAlgorithm::Sha256];

    /// Canonical lowercase name
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
        }
    }

    /// Digest length in bytes
    pub fn digest_len(&self) -> usize {
        match self {
            HashAlgorithm::Md5 => 16,
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
        }
    }

    /// Pick the longest digest, used as the default content-address algorithm
    pub fn strongest(algorithms: &[HashAlgorithm]) -> Option<HashAlgorithm> {
        algorithms.iter().copied().max_by_key(|a| a.digest_len())
    }

    pub fn hasher(&self) -> Hasher {
        Hasher::new(*self)
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = StowageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "md5" => Ok(HashAlgorithm::Md5),
            "sha1" | "sha-1" => Ok(HashAlgorithm::Sha1),
            "sha256" | "sha-256" => Ok(HashAlgorithm::Sha256),
            _ => Err(StowageError::Configuration(format!(
                "Unknown hash algorithm '{}'. Valid options: md5, sha1, sha256",
                s
            ))),
        }
    }
}

enum HasherState {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
}

/// Incremental hasher for one algorithm
pub struct Hasher {
    algorithm: HashAlgorithm,
    state: HasherState,
}

impl Hasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let state = match algorithm {
            HashAlgorithm::Md5 => HasherState::Md5(Md5::new()),
            HashAlgorithm::Sha1 => HasherState::Sha1(Sha1::new()),
            HashAlgorithm::Sha256 => HasherState::Sha256(Sha256::new()),
        };
        Hasher { algorithm, state }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            HasherState::Md5(h) => h.update(data),
            HasherState::Sha1(h) => h.update(data),
            HasherState::Sha256(h) => h.update(data),
        }
    }

    /// Consume the hasher and return the lowercase hex digest
    pub fn finalize_hex(self) -> String {
        match self.state {
            HasherState::Md5(h) => hex::encode(h.finalize()),
            HasherState::Sha1(h) => hex::encode(h.finalize()),
            HasherState::Sha256(h) => hex::encode(h.finalize()),
        }
    }
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hasher")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// Hash a complete buffer in one call
pub fn digest_hex(algorithm: HashAlgorithm, data: &[u8]) -> String {
    let mut hasher = algorithm.hasher();
    hasher.update(data);
    hasher.finalize_hex()
}

/// Permanent, content-derived name of a committed object
///
/// # Rules
/// - Lowercase hex digits only
/// - Even length between 32 and 128 characters (16 to 64 digest bytes)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ContentAddress(String);

impl ContentAddress {
    const MIN_LEN: usize = 32;
    const MAX_LEN: usize = 128;

    pub fn new(address: impl Into<String>) -> Result<Self> {
        let address = address.into();
        Self::validate(&address)?;
        Ok(ContentAddress(address))
    }

    fn validate(address: &str) -> Result<()> {
        if address.len() < Self::MIN_LEN || address.len() > Self::MAX_LEN {
            return Err(StowageError::InvalidAddress(format!(
                "address must be {}-{} hex characters, got {}",
                Self::MIN_LEN,
                Self::MAX_LEN,
                address.len()
            )));
        }
        if address.len() % 2 != 0 {
            return Err(StowageError::InvalidAddress(
                "address must have an even number of hex characters".to_string(),
            ));
        }
        if !address
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(StowageError::InvalidAddress(format!(
                "address '{}' must be lowercase hex",
                address
            )));
        }
        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Two-level fan-out prefix, e.g. `("2c", "f2")`
    pub fn shards(&self) -> (&str, &str) {
        (&self.0[0..2], &self.0[2..4])
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ContentAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for ContentAddress {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ContentAddress::new(s).map_err(serde::de::Error::custom)
    }
}

/// Finalized digests of one stream, keyed by algorithm
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DigestSet(BTreeMap<HashAlgorithm, String>);

impl DigestSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, algorithm: HashAlgorithm, hex_digest: String) {
        self.0.insert(algorithm, hex_digest);
    }

    pub fn get(&self, algorithm: HashAlgorithm) -> Option<&str> {
        self.0.get(&algorithm).map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (HashAlgorithm, &str)> {
        self.0.iter().map(|(a, d)| (*a, d.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Content address derived from the given algorithm's digest
    pub fn address(&self, primary: HashAlgorithm) -> Result<ContentAddress> {
        let digest = self.get(primary).ok_or_else(|| {
            StowageError::Configuration(format!("primary digest {} was not computed", primary))
        })?;
        ContentAddress::new(digest)
    }
}
