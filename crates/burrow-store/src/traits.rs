//! Core trait for entry storage.

use burrow_types::{Dn, Entry, EntryId};

use crate::error::StoreError;

/// Trait for storing and retrieving directory entries.
///
/// All implementations must be `Send + Sync` so replication workers and the
/// purge task can share one store handle. Callers serialize access to a
/// single entry through [`EntryLocks`](crate::EntryLocks); the store itself
/// only guarantees that each call is atomic.
pub trait EntryStore: Send + Sync {
    /// Look up an entry by its current DN.
    fn get(&self, dn: &Dn) -> Result<Option<Entry>, StoreError>;

    /// Look up an entry by its stable ID.
    fn get_by_id(&self, id: &EntryId) -> Result<Option<Entry>, StoreError>;

    /// Insert or replace an entry, keyed by its ID.
    ///
    /// If the DN changed since the last `put`, the DN index follows. Fails
    /// with [`StoreError::AlreadyExists`] if a different entry holds the DN.
    fn put(&self, entry: Entry) -> Result<(), StoreError>;

    /// Remove an entry. Returns it if it existed.
    fn remove(&self, id: &EntryId) -> Result<Option<Entry>, StoreError>;

    /// All entry IDs, in ascending order.
    fn list_ids(&self) -> Result<Vec<EntryId>, StoreError>;

    /// Number of stored entries.
    fn len(&self) -> Result<usize, StoreError>;

    /// Whether the store holds no entries.
    fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}
