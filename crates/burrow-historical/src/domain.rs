//! A replication domain: one replica's view of a subtree.
//!
//! The domain owns the handles every write path needs (entry store, entry
//! locks, logical clock, schema) and is passed explicitly to callers. Local
//! client operations are stamped with a fresh CSN, resolved, persisted with
//! their history, and returned as [`UpdateMsg`]s for the peers. Messages
//! from peers go through [`ReplicationDomain::replay`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use burrow_store::{EntryLocks, EntryStore};
use burrow_types::{
    AttributeDescription, AttributeSchema, Csn, Dn, Entry, EntryId, LogicalClock, Modification,
    Rdn, ReplicaId,
};
use tracing::{debug, info, warn};

use crate::encoding::ENTRY_SLOT;
use crate::error::{HistoricalError, ResolveError};
use crate::historical::EntryHistorical;
use crate::replay::{self, Replay, UpdateMsg, UpdatePayload};
use crate::resolver::{Abandon, ConflictResolver, ModifyOutcome, NeverAbandon, committed_prefix};

type Result<T> = std::result::Result<T, HistoricalError>;

/// Result of replaying a message from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// The message was processed. For a modify, per-value decisions are
    /// tallied in the outcome.
    Applied(ModifyOutcome),
    /// The message changed nothing.
    Ignored(IgnoreReason),
}

/// Why a replayed message changed nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The entry already exists.
    Duplicate,
    /// The target entry is gone.
    NoSuchEntry,
    /// Another entry already holds the DN.
    NamingConflict,
    /// A newer change of the same kind is already recorded.
    Stale,
}

/// One replica of a replicated subtree.
pub struct ReplicationDomain {
    base_dn: Dn,
    store: Arc<dyn EntryStore>,
    locks: Arc<EntryLocks>,
    clock: LogicalClock,
    resolver: ConflictResolver,
    purge_delay: Option<Duration>,
}

impl std::fmt::Debug for ReplicationDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationDomain")
            .field("base_dn", &self.base_dn)
            .field("replica_id", &self.clock.replica_id())
            .field("purge_delay", &self.purge_delay)
            .finish_non_exhaustive()
    }
}

impl ReplicationDomain {
    /// Create a domain rooted at `base_dn`, issuing CSNs from `clock`.
    pub fn new(
        base_dn: Dn,
        clock: LogicalClock,
        store: Arc<dyn EntryStore>,
        locks: Arc<EntryLocks>,
        schema: Arc<dyn AttributeSchema>,
    ) -> Self {
        Self {
            base_dn,
            store,
            locks,
            clock,
            resolver: ConflictResolver::new(schema),
            purge_delay: None,
        }
    }

    /// Retain history for `delay`. Older facts are dropped whenever an
    /// entry is written.
    pub fn with_purge_delay(mut self, delay: Duration) -> Self {
        self.purge_delay = Some(delay);
        self
    }

    /// Suffix DN of this domain.
    pub fn base_dn(&self) -> &Dn {
        &self.base_dn
    }

    /// This replica's id.
    pub fn replica_id(&self) -> ReplicaId {
        self.clock.replica_id()
    }

    /// The entry store.
    pub fn store(&self) -> &Arc<dyn EntryStore> {
        &self.store
    }

    /// The entry lock table.
    pub fn locks(&self) -> &Arc<EntryLocks> {
        &self.locks
    }

    /// The logical clock.
    pub fn clock(&self) -> &LogicalClock {
        &self.clock
    }

    /// The conflict resolver.
    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Fetch an entry by DN.
    pub fn entry(&self, dn: &Dn) -> Result<Option<Entry>> {
        Ok(self.store.get(dn)?)
    }

    /// Decode the history of the entry at `dn`.
    pub fn historical(&self, dn: &Dn) -> Result<EntryHistorical> {
        let entry = self
            .store
            .get(dn)?
            .ok_or_else(|| HistoricalError::NoSuchEntry(dn.clone()))?;
        EntryHistorical::new_instance_from_entry(&entry)
    }

    /// Rebuild replayable operations for the entry at `dn`.
    pub fn generate_fake_operations(&self, dn: &Dn) -> Result<Replay> {
        let entry = self
            .store
            .get(dn)?
            .ok_or_else(|| HistoricalError::NoSuchEntry(dn.clone()))?;
        let parent_id = self.parent_id(&entry.dn)?;
        replay::generate_fake_operations(&entry, parent_id, self.resolver.schema())
    }

    // -----------------------------------------------------------------------
    // Local operations
    // -----------------------------------------------------------------------

    /// Create an entry at `dn` with the given user attributes.
    pub fn add(
        &self,
        dn: &Dn,
        attributes: BTreeMap<AttributeDescription, Vec<Bytes>>,
    ) -> Result<UpdateMsg> {
        if let Some(attr) = attributes.keys().find(|a| a.is_historical()) {
            return Err(ResolveError::InvalidModification {
                attr: attr.to_string(),
                reason: "the historical attribute is maintained by the server".into(),
            }
            .into());
        }
        if let Some(attr) = attributes.keys().find(|a| a.name() == ENTRY_SLOT) {
            return Err(ResolveError::InvalidModification {
                attr: attr.to_string(),
                reason: "the name is reserved for entry facts".into(),
            }
            .into());
        }

        let parent_id = self.resolve_parent(dn)?;
        let csn = self.clock.next();
        let entry_id = EntryId::generate(dn, &csn);

        let _guard = self.locks.lock(entry_id);
        if self.store.get(dn)?.is_some() {
            return Err(HistoricalError::EntryExists(dn.clone()));
        }
        self.create_entry(dn.clone(), entry_id, &attributes, csn)?;

        debug!(dn = %dn, csn = ?csn, "added entry");
        Ok(UpdateMsg {
            csn,
            dn: dn.clone(),
            entry_id,
            payload: UpdatePayload::Add {
                parent_id,
                attributes,
            },
        })
    }

    /// Apply a modify request to the entry at `dn`.
    ///
    /// If `abandon` fires mid-request, the changes committed so far are
    /// persisted and [`HistoricalError::Abandoned`] is returned carrying
    /// the message that replicates them.
    pub fn modify(
        &self,
        dn: &Dn,
        modifications: &[Modification],
        abandon: &dyn Abandon,
    ) -> Result<UpdateMsg> {
        let (_guard, mut entry) = self.lock_by_dn(dn)?;
        let mut hist = EntryHistorical::new_instance_from_entry(&entry)?;
        let csn = self.clock.next();

        let result = self.resolver.apply_modifications(
            &mut entry,
            &mut hist,
            modifications,
            csn,
            abandon,
        );
        let committed = match result {
            Ok(_) => modifications.to_vec(),
            Err(ResolveError::Abandoned { committed }) => {
                let update = if committed > 0 {
                    let entry_id = entry.id;
                    self.persist(entry, hist)?;
                    let prefix = committed_prefix(modifications, committed);
                    Some(Box::new(modify_msg(csn, dn, entry_id, prefix)))
                } else {
                    None
                };
                info!(dn = %dn, committed, "modify abandoned by client");
                return Err(HistoricalError::Abandoned {
                    dn: dn.clone(),
                    committed,
                    update,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let entry_id = entry.id;
        self.persist(entry, hist)?;
        Ok(modify_msg(csn, dn, entry_id, committed))
    }

    /// Rename or move the entry at `dn`.
    pub fn modify_dn(
        &self,
        dn: &Dn,
        new_rdn: Rdn,
        delete_old_rdn: bool,
        new_superior: Option<&Dn>,
    ) -> Result<UpdateMsg> {
        let new_superior_id = match new_superior {
            Some(parent) => Some(
                self.store
                    .get(parent)?
                    .ok_or_else(|| HistoricalError::NoSuchParent(parent.clone()))?
                    .id,
            ),
            None => None,
        };

        let (_guard, mut entry) = self.lock_by_dn(dn)?;
        let parent = match new_superior {
            Some(parent) => parent.clone(),
            None => dn.parent().ok_or_else(|| HistoricalError::InvalidRename {
                dn: dn.clone(),
                reason: "the root entry cannot be renamed".into(),
            })?,
        };
        let new_dn = parent.child(new_rdn.clone());
        if new_dn.is_descendant_of(dn) {
            return Err(HistoricalError::InvalidRename {
                dn: dn.clone(),
                reason: "an entry cannot move below itself".into(),
            });
        }
        if new_dn != entry.dn && self.store.get(&new_dn)?.is_some() {
            return Err(HistoricalError::EntryExists(new_dn));
        }

        let mut hist = EntryHistorical::new_instance_from_entry(&entry)?;
        let csn = self.clock.next();
        rename(&mut entry, new_dn, &new_rdn, delete_old_rdn);
        hist.record_rename(csn);

        let entry_id = entry.id;
        self.persist(entry, hist)?;
        Ok(UpdateMsg {
            csn,
            dn: dn.clone(),
            entry_id,
            payload: UpdatePayload::ModifyDn {
                new_rdn,
                delete_old_rdn,
                new_superior: new_superior.cloned(),
                new_superior_id,
            },
        })
    }

    /// Delete the entry at `dn`.
    pub fn delete(&self, dn: &Dn) -> Result<UpdateMsg> {
        let (_guard, entry) = self.lock_by_dn(dn)?;
        let csn = self.clock.next();
        self.store.remove(&entry.id)?;
        debug!(dn = %dn, csn = ?csn, "deleted entry");
        Ok(UpdateMsg {
            csn,
            dn: dn.clone(),
            entry_id: entry.id,
            payload: UpdatePayload::Delete,
        })
    }

    // -----------------------------------------------------------------------
    // Replication
    // -----------------------------------------------------------------------

    /// Apply a message produced by a peer (or rebuilt from history).
    ///
    /// The local clock witnesses the message CSN first, so changes issued
    /// here afterwards order after it.
    pub fn replay(&self, msg: &UpdateMsg) -> Result<ReplayOutcome> {
        self.clock.adjust(&msg.csn);

        let outcome = match &msg.payload {
            UpdatePayload::Add {
                parent_id,
                attributes,
            } => self.replay_add(msg, *parent_id, attributes)?,
            UpdatePayload::Modify { modifications } => self.replay_modify(msg, modifications)?,
            UpdatePayload::ModifyDn {
                new_rdn,
                delete_old_rdn,
                new_superior,
                new_superior_id,
            } => self.replay_modify_dn(
                msg,
                new_rdn,
                *delete_old_rdn,
                new_superior.as_ref(),
                *new_superior_id,
            )?,
            UpdatePayload::Delete => self.replay_delete(msg)?,
        };

        debug!(
            replica = %self.replica_id(),
            kind = msg.kind(),
            dn = %msg.dn,
            csn = ?msg.csn,
            ?outcome,
            "replayed update"
        );
        Ok(outcome)
    }

    fn replay_add(
        &self,
        msg: &UpdateMsg,
        parent_id: Option<EntryId>,
        attributes: &BTreeMap<AttributeDescription, Vec<Bytes>>,
    ) -> Result<ReplayOutcome> {
        let _guard = self.locks.lock(msg.entry_id);
        if self.store.get_by_id(&msg.entry_id)?.is_some() {
            return Ok(ReplayOutcome::Ignored(IgnoreReason::Duplicate));
        }

        // The parent may have been renamed since the message was made.
        let dn = match parent_id.map(|id| self.store.get_by_id(&id)).transpose()? {
            Some(Some(parent)) => match msg.dn.rdn() {
                Some(rdn) => parent.dn.child(rdn.clone()),
                None => msg.dn.clone(),
            },
            _ => {
                self.resolve_parent(&msg.dn)?;
                msg.dn.clone()
            }
        };

        if self.store.get(&dn)?.is_some() {
            warn!(dn = %dn, csn = ?msg.csn, "replayed add collides with an existing entry");
            return Ok(ReplayOutcome::Ignored(IgnoreReason::NamingConflict));
        }

        self.create_entry(dn, msg.entry_id, attributes, msg.csn)?;
        Ok(ReplayOutcome::Applied(ModifyOutcome::default()))
    }

    fn replay_modify(&self, msg: &UpdateMsg, modifications: &[Modification]) -> Result<ReplayOutcome> {
        let _guard = self.locks.lock(msg.entry_id);
        let Some(mut entry) = self.store.get_by_id(&msg.entry_id)? else {
            return Ok(ReplayOutcome::Ignored(IgnoreReason::NoSuchEntry));
        };

        let mut hist = EntryHistorical::new_instance_from_entry(&entry)?;
        let outcome = self.resolver.apply_modifications(
            &mut entry,
            &mut hist,
            modifications,
            msg.csn,
            &NeverAbandon,
        )?;
        self.persist(entry, hist)?;
        Ok(ReplayOutcome::Applied(outcome))
    }

    fn replay_modify_dn(
        &self,
        msg: &UpdateMsg,
        new_rdn: &Rdn,
        delete_old_rdn: bool,
        new_superior: Option<&Dn>,
        new_superior_id: Option<EntryId>,
    ) -> Result<ReplayOutcome> {
        let _guard = self.locks.lock(msg.entry_id);
        let Some(mut entry) = self.store.get_by_id(&msg.entry_id)? else {
            return Ok(ReplayOutcome::Ignored(IgnoreReason::NoSuchEntry));
        };

        let mut hist = EntryHistorical::new_instance_from_entry(&entry)?;
        if hist.entry_rename_csn().is_some_and(|c| c >= msg.csn) {
            return Ok(ReplayOutcome::Ignored(IgnoreReason::Stale));
        }

        let superior = match new_superior_id.map(|id| self.store.get_by_id(&id)).transpose()? {
            Some(Some(parent)) => Some(parent.dn),
            _ => new_superior.cloned(),
        };
        let parent = match superior.or_else(|| entry.dn.parent()) {
            Some(parent) => parent,
            None => return Ok(ReplayOutcome::Ignored(IgnoreReason::NoSuchEntry)),
        };
        let new_dn = parent.child(new_rdn.clone());
        if new_dn != entry.dn && self.store.get(&new_dn)?.is_some() {
            warn!(dn = %new_dn, csn = ?msg.csn, "replayed rename collides with an existing entry");
            return Ok(ReplayOutcome::Ignored(IgnoreReason::NamingConflict));
        }

        rename(&mut entry, new_dn, new_rdn, delete_old_rdn);
        hist.record_rename(msg.csn);
        self.persist(entry, hist)?;
        Ok(ReplayOutcome::Applied(ModifyOutcome::default()))
    }

    fn replay_delete(&self, msg: &UpdateMsg) -> Result<ReplayOutcome> {
        let _guard = self.locks.lock(msg.entry_id);
        if self.store.get_by_id(&msg.entry_id)?.is_none() {
            return Ok(ReplayOutcome::Ignored(IgnoreReason::NoSuchEntry));
        }
        self.store.remove(&msg.entry_id)?;
        Ok(ReplayOutcome::Applied(ModifyOutcome::default()))
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Look up `dn`, lock it, and re-read it under the lock.
    fn lock_by_dn(&self, dn: &Dn) -> Result<(burrow_store::EntryGuard<'_>, Entry)> {
        let id = self
            .store
            .get(dn)?
            .ok_or_else(|| HistoricalError::NoSuchEntry(dn.clone()))?
            .id;
        let guard = self.locks.lock(id);
        match self.store.get_by_id(&id)? {
            Some(entry) if entry.dn == *dn => Ok((guard, entry)),
            _ => Err(HistoricalError::NoSuchEntry(dn.clone())),
        }
    }

    /// Check that `dn` may be created here and return its parent's id.
    fn resolve_parent(&self, dn: &Dn) -> Result<Option<EntryId>> {
        if *dn == self.base_dn {
            return Ok(None);
        }
        if !dn.is_descendant_of(&self.base_dn) {
            return Err(HistoricalError::NoSuchParent(
                dn.parent().unwrap_or_default(),
            ));
        }
        let parent = dn.parent().unwrap_or_default();
        match self.store.get(&parent)? {
            Some(p) => Ok(Some(p.id)),
            None => Err(HistoricalError::NoSuchParent(parent)),
        }
    }

    fn parent_id(&self, dn: &Dn) -> Result<Option<EntryId>> {
        if *dn == self.base_dn {
            return Ok(None);
        }
        match dn.parent() {
            Some(parent) => Ok(self.store.get(&parent)?.map(|p| p.id)),
            None => Ok(None),
        }
    }

    fn create_entry(
        &self,
        dn: Dn,
        entry_id: EntryId,
        attributes: &BTreeMap<AttributeDescription, Vec<Bytes>>,
        csn: Csn,
    ) -> Result<()> {
        let mut entry = Entry::new(dn, entry_id);
        for (attr, values) in attributes {
            if attr.is_historical() {
                continue;
            }
            entry.replace_values(attr, values.clone());
        }
        if let Some(rdn) = entry.dn.rdn().cloned() {
            entry.add_value(
                &AttributeDescription::new(rdn.attr()),
                Bytes::copy_from_slice(rdn.value().as_bytes()),
            );
        }
        self.persist(entry, EntryHistorical::for_new_entry(csn))
    }

    /// Encode `hist` (purging expired facts) into `entry` and store it.
    fn persist(&self, mut entry: Entry, mut hist: EntryHistorical) -> Result<()> {
        if let Some(delay) = self.purge_delay {
            hist.set_purge_delay(delay);
        }
        let encoded = hist.encode_and_purge_at(self.clock.now_ms());
        if hist.last_purged_values_count() > 0 {
            info!(
                dn = %entry.dn,
                purged = hist.last_purged_values_count(),
                "purged expired history while writing entry"
            );
        }
        EntryHistorical::store_encoded(&mut entry, encoded);
        self.store.put(entry)?;
        Ok(())
    }
}

fn modify_msg(csn: Csn, dn: &Dn, entry_id: EntryId, modifications: Vec<Modification>) -> UpdateMsg {
    UpdateMsg {
        csn,
        dn: dn.clone(),
        entry_id,
        payload: UpdatePayload::Modify { modifications },
    }
}

/// Move `entry` to `new_dn`, keeping the RDN attribute values in step.
///
/// Naming-attribute changes are not recorded as attribute history.
fn rename(entry: &mut Entry, new_dn: Dn, new_rdn: &Rdn, delete_old_rdn: bool) {
    let old_rdn = entry.dn.rdn().cloned();
    entry.dn = new_dn;

    let new_attr = AttributeDescription::new(new_rdn.attr());
    if !entry
        .values(&new_attr)
        .iter()
        .any(|v| v.eq_ignore_ascii_case(new_rdn.value().as_bytes()))
    {
        entry.add_value(&new_attr, Bytes::copy_from_slice(new_rdn.value().as_bytes()));
    }

    if delete_old_rdn
        && let Some(old) = old_rdn
        && old != *new_rdn
    {
        let old_attr = AttributeDescription::new(old.attr());
        let stale: Vec<Bytes> = entry
            .values(&old_attr)
            .iter()
            .filter(|v| v.eq_ignore_ascii_case(old.value().as_bytes()))
            .cloned()
            .collect();
        for value in stale {
            entry.remove_value(&old_attr, &value);
        }
    }
}
