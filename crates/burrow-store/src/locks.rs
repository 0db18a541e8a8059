//! Per-entry exclusive locks.
//!
//! Entries are independent conflict domains: holding the lock for one entry
//! never blocks work on another, and no operation takes two entry locks.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex};

use burrow_types::EntryId;
use tracing::trace;

/// Lock table keyed by [`EntryId`].
///
/// Holders of an [`EntryGuard`] have exclusive access to that entry's live
/// attributes and historical attribute until the guard drops.
#[derive(Default)]
pub struct EntryLocks {
    held: Mutex<HashSet<EntryId>>,
    released: Condvar,
}

impl EntryLocks {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the entry's lock is free, then take it.
    pub fn lock(&self, id: EntryId) -> EntryGuard<'_> {
        let mut held = self.held.lock().expect("lock table poisoned");
        while held.contains(&id) {
            held = self.released.wait(held).expect("lock table poisoned");
        }
        held.insert(id);
        trace!(%id, "entry lock acquired");
        EntryGuard { locks: self, id }
    }

    /// Take the entry's lock if it is free.
    pub fn try_lock(&self, id: EntryId) -> Option<EntryGuard<'_>> {
        let mut held = self.held.lock().expect("lock table poisoned");
        if !held.insert(id) {
            return None;
        }
        Some(EntryGuard { locks: self, id })
    }

    /// Number of entries currently locked.
    pub fn held_count(&self) -> usize {
        self.held.lock().expect("lock table poisoned").len()
    }

    fn release(&self, id: &EntryId) {
        let mut held = self.held.lock().expect("lock table poisoned");
        held.remove(id);
        self.released.notify_all();
        trace!(%id, "entry lock released");
    }
}

/// Exclusive hold on one entry. Released on drop.
pub struct EntryGuard<'a> {
    locks: &'a EntryLocks,
    id: EntryId,
}

impl EntryGuard<'_> {
    /// The locked entry.
    pub fn id(&self) -> EntryId {
        self.id
    }
}

impl Drop for EntryGuard<'_> {
    fn drop(&mut self) {
        self.locks.release(&self.id);
    }
}
