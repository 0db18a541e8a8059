//! In-memory entry storage backend.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::RwLock;

use burrow_types::{Dn, Entry, EntryId};
use tracing::debug;

use crate::error::StoreError;
use crate::traits::EntryStore;

#[derive(Default)]
struct Inner {
    entries: BTreeMap<EntryId, Entry>,
    by_dn: HashMap<Dn, EntryId>,
}

/// In-memory entry store backed by a `RwLock` over an ID map and a DN index.
///
/// Useful for tests, for replaying reconstructed operations into an empty
/// store, and for the offline tooling which loads and saves JSON snapshots.
#[derive(Default)]
pub struct MemoryEntryStore {
    inner: RwLock<Inner>,
}

impl MemoryEntryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a list of entries.
    pub fn from_entries(entries: impl IntoIterator<Item = Entry>) -> Result<Self, StoreError> {
        let store = Self::new();
        for entry in entries {
            store.put(entry)?;
        }
        Ok(store)
    }

    /// Load a store from a JSON snapshot written by [`save_snapshot`](Self::save_snapshot).
    pub fn load_snapshot(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let content = std::fs::read(path.as_ref())?;
        let entries: Vec<Entry> = serde_json::from_slice(&content)?;
        debug!(
            path = %path.as_ref().display(),
            entries = entries.len(),
            "loaded entry snapshot"
        );
        Self::from_entries(entries)
    }

    /// Write every entry to `path` as a JSON array, ordered by ID.
    pub fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let entries = self.entries();
        let json = serde_json::to_vec_pretty(&entries)?;
        std::fs::write(path.as_ref(), json)?;
        debug!(
            path = %path.as_ref().display(),
            entries = entries.len(),
            "saved entry snapshot"
        );
        Ok(())
    }

    /// Clone out every entry, ordered by ID.
    pub fn entries(&self) -> Vec<Entry> {
        let inner = self.inner.read().expect("lock poisoned");
        inner.entries.values().cloned().collect()
    }
}

impl EntryStore for MemoryEntryStore {
    fn get(&self, dn: &Dn) -> Result<Option<Entry>, StoreError> {
        let inner = self.inner.read().expect("lock poisoned");
        Ok(inner
            .by_dn
            .get(dn)
            .and_then(|id| inner.entries.get(id))
            .cloned())
    }

    fn get_by_id(&self, id: &EntryId) -> Result<Option<Entry>, StoreError> {
        let inner = self.inner.read().expect("lock poisoned");
        Ok(inner.entries.get(id).cloned())
    }

    fn put(&self, entry: Entry) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("lock poisoned");

        if let Some(holder) = inner.by_dn.get(&entry.dn)
            && *holder != entry.id
        {
            return Err(StoreError::AlreadyExists(entry.dn.clone()));
        }

        // Drop the old DN mapping when the entry was renamed.
        let old_dn = inner
            .entries
            .get(&entry.id)
            .map(|old| old.dn.clone())
            .filter(|old| *old != entry.dn);
        if let Some(old) = old_dn {
            inner.by_dn.remove(&old);
        }

        debug!(dn = %entry.dn, id = %entry.id, "storing entry");
        inner.by_dn.insert(entry.dn.clone(), entry.id);
        inner.entries.insert(entry.id, entry);
        Ok(())
    }

    fn remove(&self, id: &EntryId) -> Result<Option<Entry>, StoreError> {
        let mut inner = self.inner.write().expect("lock poisoned");
        let removed = inner.entries.remove(id);
        if let Some(entry) = &removed {
            inner.by_dn.remove(&entry.dn);
            debug!(dn = %entry.dn, %id, "removed entry");
        }
        Ok(removed)
    }

    fn list_ids(&self) -> Result<Vec<EntryId>, StoreError> {
        let inner = self.inner.read().expect("lock poisoned");
        Ok(inner.entries.keys().copied().collect())
    }

    fn len(&self) -> Result<usize, StoreError> {
        let inner = self.inner.read().expect("lock poisoned");
        Ok(inner.entries.len())
    }
}
