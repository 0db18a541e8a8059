//! Error types for the historical crate.

use burrow_store::StoreError;
use burrow_types::Dn;

use crate::replay::UpdateMsg;

/// Errors that can occur while reading, resolving or replaying history.
#[derive(Debug, thiserror::Error)]
pub enum HistoricalError {
    /// A value of the historical attribute is malformed or truncated.
    #[error("cannot decode historical value {token:?}: {reason}")]
    Decode {
        /// The offending attribute value, lossily rendered as text.
        token: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The entry storage backend failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// No entry with this DN.
    #[error("no such entry: {0}")]
    NoSuchEntry(Dn),

    /// An entry with this DN already exists.
    #[error("entry already exists: {0}")]
    EntryExists(Dn),

    /// The parent of the entry to add does not exist.
    #[error("parent entry does not exist: {0}")]
    NoSuchParent(Dn),

    /// A modify-DN request names an RDN the entry cannot take.
    #[error("invalid rename of {dn}: {reason}")]
    InvalidRename {
        /// The entry being renamed.
        dn: Dn,
        /// Why the rename was rejected.
        reason: String,
    },

    /// Conflict resolution rejected the change.
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// A local modify was abandoned by its client. The changes committed
    /// before that are persisted and carried by `update`, which must still
    /// be sent to the peers. `update` is `None` when nothing was committed.
    #[error("modify of {dn} abandoned after {committed} committed change(s)")]
    Abandoned {
        /// The entry being modified.
        dn: Dn,
        /// Number of per-value changes committed.
        committed: usize,
        /// Replication message for the committed changes.
        update: Option<Box<UpdateMsg>>,
    },

    /// An update message could not be encoded or decoded.
    #[error("message serialization error: {0}")]
    Serialization(String),
}

impl HistoricalError {
    pub(crate) fn decode(token: &[u8], reason: impl Into<String>) -> Self {
        Self::Decode {
            token: String::from_utf8_lossy(token).into_owned(),
            reason: reason.into(),
        }
    }
}

impl From<postcard::Error> for HistoricalError {
    fn from(e: postcard::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Errors raised by [`ConflictResolver`](crate::ConflictResolver).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// The modification is malformed or targets an attribute it may not touch.
    #[error("invalid modification of {attr}: {reason}")]
    InvalidModification {
        /// The attribute description as given.
        attr: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The client abandoned the request. Changes committed before the
    /// abandon was observed are kept.
    #[error("operation abandoned after {committed} committed change(s)")]
    Abandoned {
        /// Number of per-value changes committed before the abandon.
        committed: usize,
    },
}
