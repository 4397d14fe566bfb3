//! Metadata desync tracking
//!
//! When an object is durably committed but the metadata service could not
//! be told, the commit still succeeds. The undelivered [`CommitRecord`] is
//! kept here so it can be replayed or reconciled out of band.
//!
//! The log is bounded; once full, the oldest warning is dropped and
//! counted.

use crate::core::metadata::CommitRecord;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, warn};

/// Committed object whose metadata notification failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetadataDesyncWarning {
    pub record: CommitRecord,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

impl MetadataDesyncWarning {
    pub fn new(record: CommitRecord, reason: impl Into<String>) -> Self {
        MetadataDesyncWarning {
            record,
            reason: reason.into(),
            recorded_at: Utc::now(),
        }
    }
}

/// Bounded, thread-safe log of desync warnings
#[derive(Debug)]
pub struct DesyncLog {
    entries: Mutex<VecDeque<MetadataDesyncWarning>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl DesyncLog {
    pub fn new(capacity: usize) -> Self {
        DesyncLog {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn record(&self, warning: MetadataDesyncWarning) {
        warn!(
            address = %warning.record.content_address(),
            reason = %warning.reason,
            "metadata desync: object committed but not indexed"
        );

        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            if let Some(evicted) = entries.pop_front() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                error!(
                    address = %evicted.record.content_address(),
                    "desync log full, dropping oldest warning"
                );
            }
        }
        entries.push_back(warning);
    }

    /// Take every pending warning, oldest first
    pub fn drain(&self) -> Vec<MetadataDesyncWarning> {
        self.entries.lock().drain(..).collect()
    }

    pub fn snapshot(&self) -> Vec<MetadataDesyncWarning> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Warnings evicted because the log was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for DesyncLog {
    fn default() -> Self {
        Self::new(1024)
    }
}
