//! Error types for entry storage operations.

use burrow_types::{Dn, EntryId};

/// Errors that can occur during entry storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No entry with this ID.
    #[error("entry not found: {0}")]
    NotFound(EntryId),

    /// Another entry already holds this DN.
    #[error("DN already in use: {0}")]
    AlreadyExists(Dn),

    /// An I/O error occurred.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A snapshot could not be encoded or decoded.
    #[error("snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),
}
