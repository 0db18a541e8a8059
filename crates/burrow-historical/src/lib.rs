//! Historical conflict resolution for multi-master directory replication.
//!
//! Every entry carries its own change history in the `ds-sync-hist`
//! attribute: when each value was added or deleted, when each attribute was
//! last replaced, and when the entry was created and renamed. Replicas use
//! that history to resolve concurrent modifications identically regardless
//! of delivery order ([`ConflictResolver`]), to rebuild the operations that
//! produced an entry ([`generate_fake_operations`]), and to drop facts
//! older than the retention window ([`EntryHistorical::encode_and_purge`]).

mod attribute;
mod domain;
mod encoding;
mod error;
mod historical;
mod replay;
mod resolver;

#[cfg(test)]
mod tests;

pub use attribute::{AttributeHistory, HistoricalValue, ValueOpKind};
pub use domain::{IgnoreReason, ReplayOutcome, ReplicationDomain};
pub use encoding::{HistoricalToken, TokenKind};
pub use error::{HistoricalError, ResolveError};
pub use historical::EntryHistorical;
pub use replay::{
    FakeOperation, Replay, ReplayAnomaly, UpdateMsg, UpdatePayload, generate_fake_operations,
};
pub use resolver::{
    Abandon, AbandonFlag, ConflictResolver, Decision, ModifyOutcome, NeverAbandon,
    ReplicatedModification, ReplicatedOp, committed_prefix,
};
