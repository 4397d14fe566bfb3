//! Normalized directory listings
//!
//! Maps the metadata service's raw entries into one shape regardless of
//! backend. Every entry is exactly one of file or folder.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Entry as returned by the metadata callback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEntry {
    pub path: String,
    pub is_dir: bool,
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub modified: Option<String>,
    /// Backend-specific fields passed through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Folder,
}

/// Normalized listing entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingEntry {
    pub provider: String,
    pub kind: EntryKind,
    pub name: String,
    pub path: String,
    pub size: u64,
    pub modified: Option<String>,
    pub extra: Map<String, Value>,
}

impl ListingEntry {
    pub fn from_raw(provider: &str, raw: RawEntry) -> Self {
        let kind = if raw.is_dir {
            EntryKind::Folder
        } else {
            EntryKind::File
        };
        ListingEntry {
            provider: provider.to_string(),
            kind,
            name: entry_name(&raw.path).to_string(),
            path: raw.path,
            size: raw.bytes,
            modified: raw.modified,
            extra: raw.extra,
        }
    }

    pub fn is_folder(&self) -> bool {
        self.kind == EntryKind::Folder
    }
}

/// Final path component; folders may carry a trailing slash
fn entry_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}
