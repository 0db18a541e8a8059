//! Reconstruction of replayable operations from an entry's history.
//!
//! When a peer has to be brought up to date and the change log no longer
//! covers an entry, the entry's own history is turned back into a sequence
//! of [`FakeOperation`]s. Replaying them in CSN order against an empty
//! store reproduces an equivalent entry.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use burrow_types::{
    AttributeDescription, AttributeSchema, Csn, Dn, Entry, EntryId, Modification,
    ModificationKind, Rdn,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::attribute::ValueOpKind;
use crate::error::HistoricalError;
use crate::historical::EntryHistorical;

type Result<T> = std::result::Result<T, HistoricalError>;

// ---------------------------------------------------------------------------
// Update messages
// ---------------------------------------------------------------------------

/// A replicated change as exchanged between replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMsg {
    /// CSN of the change.
    pub csn: Csn,
    /// DN of the target entry when the change was made.
    pub dn: Dn,
    /// Stable identifier of the target entry.
    pub entry_id: EntryId,
    /// What changed.
    pub payload: UpdatePayload,
}

/// Operation-specific part of an [`UpdateMsg`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdatePayload {
    /// Entry creation.
    Add {
        /// Identifier of the parent, if the entry is not a suffix.
        parent_id: Option<EntryId>,
        /// User attributes of the new entry.
        attributes: BTreeMap<AttributeDescription, Vec<Bytes>>,
    },
    /// Attribute modifications.
    Modify {
        /// Modifications in request order.
        modifications: Vec<Modification>,
    },
    /// Rename or move.
    ModifyDn {
        /// New leaf RDN.
        new_rdn: Rdn,
        /// Whether the old RDN value is removed from the entry.
        delete_old_rdn: bool,
        /// New parent DN, `None` to stay under the current parent.
        new_superior: Option<Dn>,
        /// Identifier of the new parent, when known.
        new_superior_id: Option<EntryId>,
    },
    /// Entry deletion.
    Delete,
}

impl UpdateMsg {
    /// Encode with postcard.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Decode from postcard bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(postcard::from_bytes(bytes)?)
    }

    /// Short name of the operation, for logs.
    pub fn kind(&self) -> &'static str {
        match self.payload {
            UpdatePayload::Add { .. } => "add",
            UpdatePayload::Modify { .. } => "modify",
            UpdatePayload::ModifyDn { .. } => "moddn",
            UpdatePayload::Delete => "delete",
        }
    }
}

// ---------------------------------------------------------------------------
// Fake operations
// ---------------------------------------------------------------------------

/// An operation rebuilt from history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeOperation {
    /// Re-create the entry with its current user attributes.
    Add {
        csn: Csn,
        entry_id: EntryId,
        parent_id: Option<EntryId>,
        dn: Dn,
        attributes: BTreeMap<AttributeDescription, Vec<Bytes>>,
    },
    /// Re-apply all attribute facts sharing one CSN.
    Modify {
        csn: Csn,
        entry_id: EntryId,
        dn: Dn,
        modifications: Vec<Modification>,
    },
    /// Re-apply the latest rename.
    ModifyDn {
        csn: Csn,
        entry_id: EntryId,
        dn: Dn,
        new_rdn: Rdn,
        new_superior: Option<Dn>,
        new_superior_id: Option<EntryId>,
    },
    /// Delete the entry.
    Delete {
        csn: Csn,
        entry_id: EntryId,
        dn: Dn,
    },
}

impl FakeOperation {
    /// CSN the operation replays at.
    pub fn csn(&self) -> Csn {
        match self {
            Self::Add { csn, .. }
            | Self::Modify { csn, .. }
            | Self::ModifyDn { csn, .. }
            | Self::Delete { csn, .. } => *csn,
        }
    }

    /// Target entry.
    pub fn entry_id(&self) -> EntryId {
        match self {
            Self::Add { entry_id, .. }
            | Self::Modify { entry_id, .. }
            | Self::ModifyDn { entry_id, .. }
            | Self::Delete { entry_id, .. } => *entry_id,
        }
    }

    /// Build the replication message carrying this operation.
    pub fn generate_message(&self) -> UpdateMsg {
        match self {
            Self::Add {
                csn,
                entry_id,
                parent_id,
                dn,
                attributes,
            } => UpdateMsg {
                csn: *csn,
                dn: dn.clone(),
                entry_id: *entry_id,
                payload: UpdatePayload::Add {
                    parent_id: *parent_id,
                    attributes: attributes.clone(),
                },
            },
            Self::Modify {
                csn,
                entry_id,
                dn,
                modifications,
            } => UpdateMsg {
                csn: *csn,
                dn: dn.clone(),
                entry_id: *entry_id,
                payload: UpdatePayload::Modify {
                    modifications: modifications.clone(),
                },
            },
            Self::ModifyDn {
                csn,
                entry_id,
                dn,
                new_rdn,
                new_superior,
                new_superior_id,
            } => UpdateMsg {
                csn: *csn,
                dn: dn.clone(),
                entry_id: *entry_id,
                payload: UpdatePayload::ModifyDn {
                    new_rdn: new_rdn.clone(),
                    delete_old_rdn: true,
                    new_superior: new_superior.clone(),
                    new_superior_id: *new_superior_id,
                },
            },
            Self::Delete { csn, entry_id, dn } => UpdateMsg {
                csn: *csn,
                dn: dn.clone(),
                entry_id: *entry_id,
                payload: UpdatePayload::Delete,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Replay reconstruction
// ---------------------------------------------------------------------------

/// An inconsistency between an entry's history and its live state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayAnomaly {
    /// The history has no creation fact, so no add could be rebuilt.
    MissingCreation,
    /// A value whose latest fact is a delete is still present.
    DeletedValuePresent {
        attr: AttributeDescription,
        value: Bytes,
        csn: Csn,
    },
    /// A value whose latest fact is an add, not overridden by a replace, is
    /// absent. On a single-valued attribute only the earliest such add is
    /// expected to be held.
    AddedValueMissing {
        attr: AttributeDescription,
        value: Bytes,
        csn: Csn,
    },
}

impl fmt::Display for ReplayAnomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingCreation => write!(f, "history has no creation fact"),
            Self::DeletedValuePresent { attr, value, csn } => write!(
                f,
                "{attr} value {:?} deleted at {csn} is still present",
                String::from_utf8_lossy(value)
            ),
            Self::AddedValueMissing { attr, value, csn } => write!(
                f,
                "{attr} value {:?} added at {csn} is missing",
                String::from_utf8_lossy(value)
            ),
        }
    }
}

/// Operations rebuilt from one entry, with any anomalies found on the way.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Replay {
    /// Operations in CSN order.
    pub operations: Vec<FakeOperation>,
    /// Inconsistencies between history and live state.
    pub anomalies: Vec<ReplayAnomaly>,
}

/// Rebuild the operations that produced `entry`.
///
/// Yields one add at the creation CSN carrying the entry's current user
/// attributes, one modify per distinct attribute-fact CSN, and a rename at
/// the latest rename CSN targeting the entry's current name. Facts a replace
/// overrode, and adds that lost on a single-valued attribute, are rebuilt
/// too so the replayed history matches. Inconsistent facts are reported as
/// anomalies, never fabricated into operations.
pub fn generate_fake_operations(
    entry: &Entry,
    parent_id: Option<EntryId>,
    schema: &dyn AttributeSchema,
) -> Result<Replay> {
    let hist = EntryHistorical::new_instance_from_entry(entry)?;
    let mut replay = Replay::default();

    match hist.entry_add_csn() {
        Some(csn) => replay.operations.push(FakeOperation::Add {
            csn,
            entry_id: entry.id,
            parent_id,
            dn: entry.dn.clone(),
            attributes: entry
                .user_attributes()
                .map(|(attr, values)| (attr.clone(), values.clone()))
                .collect(),
        }),
        None => replay.anomalies.push(ReplayAnomaly::MissingCreation),
    }

    let mut by_csn: BTreeMap<Csn, Vec<Modification>> = BTreeMap::new();
    for (attr, history) in hist.attributes() {
        let replace = history.last_replace();

        if let Some(csn) = replace {
            let values: Vec<Bytes> = history
                .values()
                .iter()
                .filter(|v| v.csn == csn && v.kind == ValueOpKind::Add)
                .map(|v| v.value.clone())
                .collect();
            let kind = if values.is_empty() {
                ModificationKind::Delete
            } else {
                ModificationKind::Replace
            };
            by_csn.entry(csn).or_default().push(Modification {
                attr: attr.clone(),
                kind,
                values,
            });
        }

        // A single-valued attribute holds one of its asserted values, which
        // need not be the earliest if an older unrecorded value sits there.
        let single = schema.is_single_valued(attr);
        let earliest = history.asserted().next().map(|v| v.value.clone());
        let vacant = entry.values(attr).is_empty();
        for record in history.values() {
            let live = entry.has_value(attr, &record.value);
            let expected = history.asserts(&record.value)
                && (!single || (vacant && earliest.as_ref() == Some(&record.value)));
            match record.kind {
                ValueOpKind::Add if expected && !live => {
                    replay.anomalies.push(ReplayAnomaly::AddedValueMissing {
                        attr: attr.clone(),
                        value: record.value.clone(),
                        csn: record.csn,
                    })
                }
                ValueOpKind::Delete if live => {
                    replay.anomalies.push(ReplayAnomaly::DeletedValuePresent {
                        attr: attr.clone(),
                        value: record.value.clone(),
                        csn: record.csn,
                    })
                }
                _ => {}
            }

            if record.kind == ValueOpKind::Add && Some(record.csn) == replace {
                continue;
            }
            let kind = match record.kind {
                ValueOpKind::Add => ModificationKind::Add,
                ValueOpKind::Delete => ModificationKind::Delete,
            };
            by_csn.entry(record.csn).or_default().push(Modification {
                attr: attr.clone(),
                kind,
                values: vec![record.value.clone()],
            });
        }
    }

    for (csn, modifications) in by_csn {
        replay.operations.push(FakeOperation::Modify {
            csn,
            entry_id: entry.id,
            dn: entry.dn.clone(),
            modifications,
        });
    }

    if let Some(csn) = hist.entry_rename_csn() {
        match entry.dn.rdn() {
            Some(rdn) => replay.operations.push(FakeOperation::ModifyDn {
                csn,
                entry_id: entry.id,
                dn: entry.dn.clone(),
                new_rdn: rdn.clone(),
                new_superior: entry.dn.parent(),
                new_superior_id: parent_id,
            }),
            None => warn!(entry_id = %entry.id, "rename fact on the root entry ignored"),
        }
    }

    replay.operations.sort_by_key(FakeOperation::csn);

    for anomaly in &replay.anomalies {
        warn!(dn = %entry.dn, %anomaly, "history inconsistent with entry");
    }
    debug!(
        dn = %entry.dn,
        operations = replay.operations.len(),
        anomalies = replay.anomalies.len(),
        "rebuilt operations from history"
    );

    Ok(replay)
}
