//! Error types for purge passes.

/// Errors that abort a purge pass.
///
/// Failures confined to one entry do not abort the pass; they are reported
/// in [`PurgeReport::skipped`](crate::PurgeReport::skipped).
#[derive(Debug, thiserror::Error)]
pub enum PurgeError {
    /// The entry store could not be listed.
    #[error("store error: {0}")]
    Store(#[from] burrow_store::StoreError),
}
