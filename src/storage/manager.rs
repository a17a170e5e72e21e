use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::batch::{Batch, BatchAck, BatchBackend, KnownIds, MAX_BATCH_SIZE};
use crate::error::{BackendError, StoreError};
use crate::record::CanonicalRecord;

use super::codec::{compress, expand, EssentialRecord};
use super::{
    entry_cost, LocalStore, ModeTransition, RemoteStore, StorageKeys, StorageMode,
    COMPRESS_THRESHOLD_BYTES, DEFAULT_STORAGE_KEY,
};

#[derive(Debug, Clone)]
pub struct StorageOptions {
    pub key: String,
    pub compress_threshold_bytes: usize,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            key: DEFAULT_STORAGE_KEY.to_string(),
            compress_threshold_bytes: COMPRESS_THRESHOLD_BYTES,
        }
    }
}

/// What is persisted under a key, as found on disk.
#[derive(Debug, Clone)]
pub struct StorageEnvelope {
    pub mode: StorageMode,
    pub payload: EnvelopePayload,
}

#[derive(Debug, Clone)]
pub enum EnvelopePayload {
    Empty,
    Records(Vec<CanonicalRecord>),
    /// Held remotely; only the count stays local.
    Remote(RemotePointer),
    /// Reduced records, plus whatever had been migrated before the fallback.
    Essential {
        records: Vec<EssentialRecord>,
        remote: Option<RemotePointer>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePointer {
    pub count: usize,
    pub migrated_at: Option<String>,
}

/// Everything stored under a key, split by how much of each record survived.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecords {
    pub mode: StorageMode,
    pub full: Vec<CanonicalRecord>,
    pub essential: Vec<EssentialRecord>,
    /// Migrated records that could not be read back from the remote store.
    pub remote_unread: usize,
}

impl StoredRecords {
    pub fn len(&self) -> usize {
        self.full.len() + self.essential.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn detail_lost(&self) -> bool {
        !self.essential.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStatus {
    pub key: String,
    pub mode: StorageMode,
    pub count: usize,
    pub used_bytes: usize,
    pub budget_bytes: usize,
    pub remote_configured: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub migrated_at: Option<String>,
}

enum Step {
    Stored,
    Escalate {
        to: StorageMode,
        bytes: usize,
        reason: String,
    },
}

/// Runs the NORMAL -> COMPRESSED -> REMOTE -> ESSENTIAL ladder over a local
/// store and an optional remote one.
pub struct StorageManager {
    local: Box<dyn LocalStore>,
    remote: Option<Box<dyn RemoteStore>>,
    keys: StorageKeys,
    collection: String,
    threshold: usize,
    mode: StorageMode,
    /// Every record written through this manager plus what was loaded locally.
    records: Vec<CanonicalRecord>,
    index: HashMap<String, usize>,
    /// Reduced records found on open in ESSENTIAL mode.
    essentials: Vec<EssentialRecord>,
    /// Records held by the remote store once anything was migrated.
    remote_count: usize,
    migrated: bool,
    transitions: Vec<ModeTransition>,
    /// Transitions not yet handed out through `take_transitions`.
    pending: Vec<ModeTransition>,
}

impl StorageManager {
    /// Loads whatever is stored under the key. Locally held data is
    /// re-evaluated from NORMAL; REMOTE and ESSENTIAL are resumed as is.
    pub fn open(
        local: Box<dyn LocalStore>,
        remote: Option<Box<dyn RemoteStore>>,
        options: StorageOptions,
    ) -> Result<Self, StoreError> {
        let keys = StorageKeys::new(&options.key);
        let mut m = Self {
            local,
            remote,
            collection: options.key,
            keys,
            threshold: options.compress_threshold_bytes,
            mode: StorageMode::Normal,
            records: Vec::new(),
            index: HashMap::new(),
            essentials: Vec::new(),
            remote_count: 0,
            migrated: false,
            transitions: Vec::new(),
            pending: Vec::new(),
        };

        let envelope = m.envelope()?;
        match envelope.payload {
            EnvelopePayload::Empty => {}
            EnvelopePayload::Records(rs) => m.load(rs),
            EnvelopePayload::Remote(pointer) => {
                m.mode = StorageMode::Remote;
                m.remote_count = pointer.count;
                m.migrated = true;
            }
            EnvelopePayload::Essential { records, remote } => {
                m.mode = StorageMode::Essential;
                m.essentials = records;
                if let Some(pointer) = remote {
                    m.remote_count = pointer.count;
                    m.migrated = true;
                }
            }
        }
        tracing::debug!(
            key = %m.collection,
            stored = envelope.mode.as_str(),
            start = m.mode.as_str(),
            records = m.records.len() + m.essentials.len(),
            remote = m.remote_count,
            "storage opened"
        );
        Ok(m)
    }

    fn load(&mut self, records: Vec<CanonicalRecord>) {
        for r in records {
            self.upsert(r);
        }
    }

    fn upsert(&mut self, r: CanonicalRecord) {
        match self.index.get(&r.id) {
            Some(&i) => self.records[i] = r,
            None => {
                self.index.insert(r.id.clone(), self.records.len());
                self.records.push(r);
            }
        }
    }

    pub fn mode(&self) -> StorageMode {
        self.mode
    }

    pub fn transitions(&self) -> &[ModeTransition] {
        &self.transitions
    }

    pub fn local(&self) -> &dyn LocalStore {
        self.local.as_ref()
    }

    /// Reads the persisted mode flag and its payload.
    pub fn envelope(&self) -> Result<StorageEnvelope, StoreError> {
        let flag = self.local.get(&self.keys.mode)?;
        let mode = match flag.as_deref().map(StorageMode::parse) {
            None => StorageMode::Normal,
            Some(Some(m)) => m,
            Some(None) => {
                return Err(StoreError::Corrupt {
                    key: self.keys.mode.clone(),
                    message: format!("unknown mode flag {:?}", flag),
                })
            }
        };
        let corrupt = |key: &str, e: serde_json::Error| StoreError::Corrupt {
            key: key.to_string(),
            message: e.to_string(),
        };
        let payload = match mode {
            StorageMode::Normal => match self.local.get(&self.keys.records)? {
                Some(text) => EnvelopePayload::Records(
                    serde_json::from_str(&text).map_err(|e| corrupt(&self.keys.records, e))?,
                ),
                None => EnvelopePayload::Empty,
            },
            StorageMode::Compressed => match self.local.get(&self.keys.compressed)? {
                Some(text) => EnvelopePayload::Records(expand(&self.keys.compressed, &text)?),
                None => EnvelopePayload::Empty,
            },
            StorageMode::Remote => EnvelopePayload::Remote(RemotePointer {
                count: self.stored_count()?,
                migrated_at: self.local.get(&self.keys.migrated_at)?,
            }),
            StorageMode::Essential => {
                let records: Vec<EssentialRecord> = match self.local.get(&self.keys.essential)? {
                    Some(text) => serde_json::from_str(&text).map_err(|e| corrupt(&self.keys.essential, e))?,
                    None => Vec::new(),
                };
                // The count covers both sides; the migration stamp marks a remote part.
                let remote = match self.local.get(&self.keys.migrated_at)? {
                    Some(at) => Some(RemotePointer {
                        count: self.stored_count()?.saturating_sub(records.len()),
                        migrated_at: Some(at),
                    }),
                    None => None,
                };
                if records.is_empty() && remote.is_none() {
                    EnvelopePayload::Empty
                } else {
                    EnvelopePayload::Essential { records, remote }
                }
            }
        };
        Ok(StorageEnvelope { mode, payload })
    }

    fn stored_count(&self) -> Result<usize, StoreError> {
        Ok(self
            .local
            .get(&self.keys.count)?
            .and_then(|c| c.parse().ok())
            .unwrap_or(0))
    }

    /// Every stored record, from whichever mode holds it. Records reduced to
    /// ESSENTIAL stay reduced; a migrated record is reported once, in full.
    pub fn read_all(&self) -> Result<StoredRecords, StoreError> {
        let envelope = self.envelope()?;
        let mut out = StoredRecords {
            mode: envelope.mode,
            ..StoredRecords::default()
        };
        let pointer = match envelope.payload {
            EnvelopePayload::Empty => None,
            EnvelopePayload::Records(rs) => {
                out.full = rs;
                None
            }
            EnvelopePayload::Remote(pointer) => Some(pointer),
            EnvelopePayload::Essential { records, remote } => {
                out.essential = records;
                remote
            }
        };
        if let Some(pointer) = pointer {
            match self.remote.as_ref().map(|r| r.read_all(&self.collection)) {
                Some(Ok(rs)) => out.full = rs,
                Some(Err(e)) => {
                    tracing::warn!(key = %self.collection, error = %e, "migrated records not readable");
                    out.remote_unread = pointer.count;
                }
                None => {
                    tracing::warn!(key = %self.collection, "migrated records but no remote store configured");
                    out.remote_unread = pointer.count;
                }
            }
        }
        if !out.full.is_empty() && !out.essential.is_empty() {
            let migrated = out.full.iter().map(|r| r.id.as_str()).collect::<HashSet<_>>();
            out.essential.retain(|e| !migrated.contains(e.id.as_str()));
        }
        Ok(out)
    }

    pub fn status(&self) -> Result<StorageStatus, StoreError> {
        let envelope = self.envelope()?;
        let (count, migrated_at) = match envelope.payload {
            EnvelopePayload::Empty => (0, None),
            EnvelopePayload::Records(rs) => (rs.len(), None),
            EnvelopePayload::Remote(p) => (p.count, p.migrated_at),
            EnvelopePayload::Essential { records, remote } => match remote {
                Some(p) => (records.len() + p.count, p.migrated_at),
                None => (records.len(), None),
            },
        };
        Ok(StorageStatus {
            key: self.collection.clone(),
            mode: envelope.mode,
            count,
            used_bytes: self.local.used_bytes()?,
            budget_bytes: self.local.budget_bytes(),
            remote_configured: self.remote.is_some(),
            migrated_at,
        })
    }

    /// Drops every local key so the next run starts from NORMAL. Remote data is kept.
    pub fn reset(&mut self) -> Result<(), StoreError> {
        for k in self.keys.all() {
            self.local.remove(k)?;
        }
        self.mode = StorageMode::Normal;
        self.records.clear();
        self.index.clear();
        self.essentials.clear();
        self.remote_count = 0;
        self.migrated = false;
        tracing::info!(key = %self.collection, "storage reset");
        Ok(())
    }

    /// Ids stored locally and, once anything was migrated, remotely. An
    /// unreadable remote side is reported, not raised.
    pub fn ids(&self) -> KnownIds {
        let mut ids = self.index.keys().cloned().collect::<HashSet<_>>();
        ids.extend(self.essentials.iter().map(|e| e.id.clone()));
        let mut incomplete = None;
        if self.migrated {
            let remote_ids = match &self.remote {
                Some(r) => r.ids(&self.collection).map_err(|e| e.to_string()),
                None => Err("no remote store configured".to_string()),
            };
            match remote_ids {
                Ok(remote_ids) => ids.extend(remote_ids),
                Err(reason) => {
                    tracing::warn!(key = %self.collection, reason = %reason, "duplicate check limited to local records");
                    incomplete = Some(format!(
                        "{} migrated records were not checked for duplicates: {}",
                        self.remote_count, reason
                    ));
                }
            }
        }
        KnownIds { ids, incomplete }
    }

    fn escalate(&mut self, to: StorageMode, bytes: usize, reason: String) -> Option<ModeTransition> {
        let to = self.mode.escalate_to(to)?;
        tracing::warn!(
            from = self.mode.as_str(),
            to = to.as_str(),
            bytes,
            reason = %reason,
            "storage mode escalated"
        );
        let t = ModeTransition {
            from: self.mode,
            to,
            bytes,
            reason,
        };
        self.mode = to;
        self.transitions.push(t.clone());
        self.pending.push(t.clone());
        Some(t)
    }

    /// Writes `value` under `key` along with the mode and count flags, then
    /// drops the keys in `drop`. Nothing is touched unless the end state fits
    /// the budget, so a refused write leaves the previous payload intact.
    fn swap_in(&mut self, key: &str, value: &str, count: usize, drop: &[&str]) -> Result<(), StoreError> {
        let count_text = count.to_string();
        let writes = [
            (key, value),
            (self.keys.mode.as_str(), self.mode.as_str()),
            (self.keys.count.as_str(), count_text.as_str()),
        ];
        let mut freed = 0usize;
        for k in drop.iter().copied().chain(writes.iter().map(|(k, _)| *k)) {
            if let Some(v) = self.local.get(k)? {
                freed += entry_cost(k, &v);
            }
        }
        let needed = writes.iter().map(|(k, v)| entry_cost(k, v)).sum::<usize>();
        let used = self.local.used_bytes()?.saturating_sub(freed);
        let budget = self.local.budget_bytes();
        if used + needed > budget {
            return Err(StoreError::CapacityExceeded {
                needed,
                available: budget.saturating_sub(used),
            });
        }
        for k in drop {
            self.local.remove(k)?;
        }
        for (k, v) in writes {
            self.local.set(k, v)?;
        }
        Ok(())
    }

    fn write_normal(&mut self, set: &[CanonicalRecord]) -> Result<Step, StoreError> {
        let json = serde_json::to_string(set).map_err(|e| StoreError::Backend(e.to_string()))?;
        let bytes = json.len();
        if bytes > self.threshold {
            return Ok(Step::Escalate {
                to: StorageMode::Compressed,
                bytes,
                reason: format!("estimated {} bytes above {} byte threshold", bytes, self.threshold),
            });
        }
        let keys = self.keys.clone();
        let drop = [keys.compressed.as_str(), keys.essential.as_str()];
        match self.swap_in(&keys.records, &json, set.len(), &drop) {
            Ok(()) => Ok(Step::Stored),
            Err(e @ StoreError::CapacityExceeded { .. }) => Ok(Step::Escalate {
                to: StorageMode::Compressed,
                bytes,
                reason: e.to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    fn write_compressed(&mut self, set: &[CanonicalRecord]) -> Result<Step, StoreError> {
        let payload = compress(set)?;
        let bytes = payload.len();
        let keys = self.keys.clone();
        let drop = [keys.records.as_str(), keys.essential.as_str()];
        match self.swap_in(&keys.compressed, &payload, set.len(), &drop) {
            Ok(()) => Ok(Step::Stored),
            Err(e @ StoreError::CapacityExceeded { .. }) => Ok(Step::Escalate {
                to: StorageMode::Remote,
                bytes,
                reason: e.to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    fn write_remote(&mut self, set: &[CanonicalRecord], fresh: &[CanonicalRecord]) -> Result<Step, StoreError> {
        // First migration moves the full set; after that only the new batch.
        let to_send = if self.migrated { fresh } else { set };
        let bytes = serde_json::to_string(to_send).map(|s| s.len()).unwrap_or(0);
        let Some(remote) = self.remote.as_mut() else {
            return Ok(Step::Escalate {
                to: StorageMode::Essential,
                bytes,
                reason: "no remote store configured".into(),
            });
        };
        for chunk in to_send.chunks(MAX_BATCH_SIZE) {
            if let Err(e) = remote.migrate_batch(&self.collection, chunk) {
                return Ok(Step::Escalate {
                    to: StorageMode::Essential,
                    bytes,
                    reason: format!("migration failed: {}", e),
                });
            }
        }
        let count = match remote.count(&self.collection) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "remote count unavailable; estimating");
                self.remote_count + to_send.len()
            }
        };
        let keys = self.keys.clone();
        let migrated_at = chrono::Utc::now().to_rfc3339();
        self.swap_in(
            &keys.migrated_at,
            &migrated_at,
            count,
            &[keys.records.as_str(), keys.compressed.as_str(), keys.essential.as_str()],
        )?;
        self.migrated = true;
        self.remote_count = count;
        tracing::info!(records = to_send.len(), total = count, "records migrated to remote store");
        Ok(Step::Stored)
    }

    /// Keeps the migration stamp, so records already on the remote side stay
    /// reachable through the envelope.
    fn write_essential(&mut self, set: &[CanonicalRecord]) -> Result<Step, BackendError> {
        let mut essentials = self.essentials.clone();
        let mut at = essentials
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.clone(), i))
            .collect::<HashMap<_, _>>();
        for e in set.iter().map(EssentialRecord::from) {
            match at.get(&e.id) {
                Some(&i) => essentials[i] = e,
                None => {
                    at.insert(e.id.clone(), essentials.len());
                    essentials.push(e);
                }
            }
        }
        let payload = serde_json::to_string(&essentials).map_err(|e| BackendError::Fatal(e.to_string()))?;
        let count = essentials.len() + self.remote_count;
        let keys = self.keys.clone();
        let drop = [keys.records.as_str(), keys.compressed.as_str()];
        self.swap_in(&keys.essential, &payload, count, &drop)
            .map_err(|e| match e {
                StoreError::CapacityExceeded { .. } => {
                    BackendError::Exhausted(format!("essential payload of {} bytes: {}", payload.len(), e))
                }
                other => BackendError::from(other),
            })?;
        self.essentials = essentials;
        Ok(Step::Stored)
    }
}

impl BatchBackend for StorageManager {
    fn write_batch(&mut self, batch: &Batch) -> Result<BatchAck, BackendError> {
        let mut merged = self.records.clone();
        let mut index = self.index.clone();
        for r in &batch.records {
            match index.get(&r.id) {
                Some(&i) => merged[i] = r.clone(),
                None => {
                    index.insert(r.id.clone(), merged.len());
                    merged.push(r.clone());
                }
            }
        }

        loop {
            let step = match self.mode {
                StorageMode::Normal => self.write_normal(&merged)?,
                StorageMode::Compressed => self.write_compressed(&merged)?,
                StorageMode::Remote => self.write_remote(&merged, &batch.records)?,
                StorageMode::Essential => self.write_essential(&merged)?,
            };
            match step {
                Step::Stored => break,
                Step::Escalate { to, bytes, reason } => match self.escalate(to, bytes, reason) {
                    Some(_) => {}
                    None => {
                        return Err(BackendError::Fatal(format!(
                            "refusing to move storage from {} to {}",
                            self.mode.as_str(),
                            to.as_str()
                        )))
                    }
                },
            }
        }

        self.records = merged;
        self.index = index;
        Ok(BatchAck {
            written: batch.records.len(),
            mode: self.mode,
        })
    }

    fn existing_ids(&self) -> KnownIds {
        self.ids()
    }

    fn mode(&self) -> StorageMode {
        self.mode
    }

    fn take_transitions(&mut self) -> Vec<ModeTransition> {
        std::mem::take(&mut self.pending)
    }
}
