//! Entry storage trait and the in-memory backend.
//!
//! Durable storage is someone else's job; this crate defines the seam the
//! replication core talks to:
//!
//! - [`EntryStore`]: get/put/remove entries by DN or [`EntryId`](burrow_types::EntryId).
//! - [`MemoryEntryStore`]: `RwLock`-backed maps with JSON snapshots.
//! - [`EntryLocks`]: per-entry exclusive locks serializing
//!   decode → resolve → mutate → encode → persist.

mod error;
mod locks;
mod memory_store;
mod traits;

pub use error::StoreError;
pub use locks::{EntryGuard, EntryLocks};
pub use memory_store::MemoryEntryStore;
pub use traits::EntryStore;
