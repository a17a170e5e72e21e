//! Quota-aware persistence of canonical records.
//!
//! Records are kept under one base key in a capacity-limited [`LocalStore`].
//! When the serialized set outgrows the store the [`StorageManager`] walks a
//! one-way ladder of representations (see [`StorageMode`]), recording every
//! step as a [`ModeTransition`].

mod codec;
mod manager;
mod memory;
mod sqlite;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::record::CanonicalRecord;

pub use codec::{compress, expand, EssentialRecord};
pub use manager::{
    EnvelopePayload, RemotePointer, StorageEnvelope, StorageManager, StorageOptions, StorageStatus,
    StoredRecords,
};
pub use memory::{MemoryRemote, MemoryStore};
pub use sqlite::{SqliteRemote, SqliteStore, REMOTE_DB_FILE};

pub const DEFAULT_STORAGE_KEY: &str = "gradeimport-grades";
/// Estimated payload size above which NORMAL gives way to COMPRESSED.
pub const COMPRESS_THRESHOLD_BYTES: usize = 1024 * 1024;
pub const DEFAULT_LOCAL_BUDGET_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageMode {
    #[default]
    Normal,
    Compressed,
    Remote,
    Essential,
}

impl StorageMode {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageMode::Normal => "NORMAL",
            StorageMode::Compressed => "COMPRESSED",
            StorageMode::Remote => "REMOTE",
            StorageMode::Essential => "ESSENTIAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "NORMAL" => Some(StorageMode::Normal),
            "COMPRESSED" => Some(StorageMode::Compressed),
            "REMOTE" => Some(StorageMode::Remote),
            "ESSENTIAL" => Some(StorageMode::Essential),
            _ => None,
        }
    }

    /// The ladder only moves forward.
    pub fn escalate_to(self, to: StorageMode) -> Option<StorageMode> {
        (to > self).then_some(to)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeTransition {
    pub from: StorageMode,
    pub to: StorageMode,
    /// Size of the payload that triggered the step.
    pub bytes: usize,
    pub reason: String,
}

/// Key/value store with a byte budget.
pub trait LocalStore: Send {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Fails with [`StoreError::CapacityExceeded`] when the write would exceed
    /// the budget; the previous value stays in place.
    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError>;

    fn remove(&mut self, key: &str) -> Result<(), StoreError>;

    fn used_bytes(&self) -> Result<usize, StoreError>;

    fn budget_bytes(&self) -> usize;
}

/// Durable store without a practical size limit.
pub trait RemoteStore: Send {
    /// Upserts `records` by id as one unit.
    fn migrate_batch(&mut self, collection: &str, records: &[CanonicalRecord]) -> Result<(), StoreError>;

    fn read_all(&self, collection: &str) -> Result<Vec<CanonicalRecord>, StoreError>;

    fn ids(&self, collection: &str) -> Result<HashSet<String>, StoreError> {
        Ok(self.read_all(collection)?.into_iter().map(|r| r.id).collect())
    }

    fn count(&self, collection: &str) -> Result<usize, StoreError> {
        Ok(self.ids(collection)?.len())
    }
}

/// Storage keys derived from one base key.
#[derive(Debug, Clone)]
pub struct StorageKeys {
    pub records: String,
    pub compressed: String,
    pub essential: String,
    pub mode: String,
    pub count: String,
    pub migrated_at: String,
}

impl StorageKeys {
    pub fn new(base: &str) -> Self {
        Self {
            records: base.to_string(),
            compressed: format!("{base}-compressed"),
            essential: format!("{base}-essential"),
            mode: format!("{base}-mode"),
            count: format!("{base}-count"),
            migrated_at: format!("{base}-migrated-at"),
        }
    }

    pub fn all(&self) -> [&str; 6] {
        [
            self.records.as_str(),
            self.compressed.as_str(),
            self.essential.as_str(),
            self.mode.as_str(),
            self.count.as_str(),
            self.migrated_at.as_str(),
        ]
    }
}

/// Bytes a key/value pair is charged against a budget.
pub(crate) fn entry_cost(key: &str, value: &str) -> usize {
    key.len() + value.len()
}
