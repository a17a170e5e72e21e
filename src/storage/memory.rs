use std::collections::{BTreeMap, HashMap};

use crate::error::StoreError;
use crate::record::CanonicalRecord;

use super::{entry_cost, LocalStore, RemoteStore};

/// In-process [`LocalStore`] with a fixed byte budget.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    entries: HashMap<String, String>,
    budget: usize,
}

impl MemoryStore {
    pub fn with_budget(budget: usize) -> Self {
        Self {
            entries: HashMap::new(),
            budget,
        }
    }

    pub fn keys(&self) -> Vec<String> {
        let mut k = self.entries.keys().cloned().collect::<Vec<_>>();
        k.sort();
        k
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        let current = self.entries.get(key).map(|v| entry_cost(key, v)).unwrap_or(0);
        let used = self.used_bytes()? - current;
        let needed = entry_cost(key, value);
        if used + needed > self.budget {
            return Err(StoreError::CapacityExceeded {
                needed,
                available: self.budget.saturating_sub(used),
            });
        }
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    fn used_bytes(&self) -> Result<usize, StoreError> {
        Ok(self.entries.iter().map(|(k, v)| entry_cost(k, v)).sum())
    }

    fn budget_bytes(&self) -> usize {
        self.budget
    }
}

/// In-process [`RemoteStore`]. An unreachable instance refuses every call.
#[derive(Debug, Clone)]
pub struct MemoryRemote {
    collections: HashMap<String, BTreeMap<String, CanonicalRecord>>,
    reachable: bool,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            collections: HashMap::new(),
            reachable: true,
        }
    }

    pub fn unreachable() -> Self {
        Self {
            collections: HashMap::new(),
            reachable: false,
        }
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.reachable {
            Ok(())
        } else {
            Err(StoreError::RemoteUnavailable("remote store is unreachable".into()))
        }
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteStore for MemoryRemote {
    fn migrate_batch(&mut self, collection: &str, records: &[CanonicalRecord]) -> Result<(), StoreError> {
        self.check()?;
        let col = self.collections.entry(collection.to_string()).or_default();
        for r in records {
            col.insert(r.id.clone(), r.clone());
        }
        Ok(())
    }

    fn read_all(&self, collection: &str) -> Result<Vec<CanonicalRecord>, StoreError> {
        self.check()?;
        Ok(self
            .collections
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default())
    }
}
