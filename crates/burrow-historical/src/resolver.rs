//! Conflict resolution for concurrent modifications.
//!
//! Every incoming fact is merged into the attribute history, and the
//! attribute's values are then read back from that history. Replicas that
//! have seen the same modifications therefore hold the same history and
//! the same values, whatever order the modifications arrived in.
//!
//! | Incoming                  | Stored fact            | Decision                                  |
//! |---------------------------|------------------------|-------------------------------------------|
//! | replace / delete-all @t   | last replace @r        | apply iff `t >= r` (`=` is the same request) |
//! | delete value @t           | value added @a         | apply iff `t > a`                         |
//! | add value @t (multi)      | value fact @v          | apply unless `v >= t` or replace `> t`    |
//! | add value @t (single)     | other values added @h  | hold the add with the smallest CSN        |
//!
//! An add that loses on a single-valued attribute stays recorded. It takes
//! over if the winning value is deleted later.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use burrow_types::{AttributeDescription, AttributeSchema, Csn, Entry, Modification, ModificationKind};
use tracing::{debug, trace};

use crate::attribute::{AttributeHistory, ValueOpKind};
use crate::encoding::ENTRY_SLOT;
use crate::error::ResolveError;
use crate::historical::EntryHistorical;

type Result<T> = std::result::Result<T, ResolveError>;

/// A per-value operation tagged with the CSN of the change it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicatedOp {
    /// Add one value.
    Add(Bytes),
    /// Delete one value, or the whole attribute when `None`.
    Delete(Option<Bytes>),
    /// Replace all values (empty removes the attribute).
    Replace(Vec<Bytes>),
}

/// One replicated modification of one attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatedModification {
    /// Target attribute.
    pub attr: AttributeDescription,
    /// The operation.
    pub op: ReplicatedOp,
    /// CSN of the originating change.
    pub csn: Csn,
}

impl ReplicatedModification {
    /// Build a modification.
    pub fn new(attr: AttributeDescription, op: ReplicatedOp, csn: Csn) -> Self {
        Self { attr, op, csn }
    }
}

/// Outcome of resolving one modification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The modification was applied as given.
    Apply,
    /// The modification lost to a newer fact and left the live values as
    /// they were. It may still be recorded in the history.
    Ignore,
    /// The modification was applied by replacing the attribute with this value.
    ApplyWithValue(Bytes),
}

/// Tally of decisions for one modify request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModifyOutcome {
    /// Per-value changes applied.
    pub applied: usize,
    /// Per-value changes ignored.
    pub ignored: usize,
}

/// Cooperative cancellation checked between per-value changes.
pub trait Abandon {
    /// Whether the request should stop.
    fn is_abandoned(&self) -> bool;
}

/// Never abandons. Replication replays always run to completion.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverAbandon;

impl Abandon for NeverAbandon {
    fn is_abandoned(&self) -> bool {
        false
    }
}

/// Shared flag a client connection can raise to abandon its request.
#[derive(Debug, Clone, Default)]
pub struct AbandonFlag(Arc<AtomicBool>);

impl AbandonFlag {
    /// A flag that is not raised.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag.
    pub fn abandon(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl Abandon for AbandonFlag {
    fn is_abandoned(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Decides and applies modifications against an entry and its history.
#[derive(Clone)]
pub struct ConflictResolver {
    schema: Arc<dyn AttributeSchema>,
}

impl std::fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictResolver").finish_non_exhaustive()
    }
}

impl ConflictResolver {
    /// Create a resolver for the given schema.
    pub fn new(schema: Arc<dyn AttributeSchema>) -> Self {
        Self { schema }
    }

    /// The schema decisions are made against.
    pub fn schema(&self) -> &dyn AttributeSchema {
        self.schema.as_ref()
    }

    /// Whether `attr` is single-valued in this resolver's schema.
    pub fn is_single_valued(&self, attr: &AttributeDescription) -> bool {
        self.schema.is_single_valued(attr)
    }

    /// Resolve one modification, mutate `entry` and `hist` accordingly, and
    /// report the decision.
    pub fn resolve(
        &self,
        entry: &mut Entry,
        hist: &mut EntryHistorical,
        m: &ReplicatedModification,
    ) -> Result<Decision> {
        check_target(&m.attr)?;
        let single = self.schema.is_single_valued(&m.attr);

        let decision = match &m.op {
            ReplicatedOp::Replace(values) => {
                if single && values.len() > 1 {
                    return Err(invalid(&m.attr, "multiple values for a single-valued attribute"));
                }
                resolve_replace(entry, hist, &m.attr, values, m.csn, single)
            }
            ReplicatedOp::Delete(None) => resolve_replace(entry, hist, &m.attr, &[], m.csn, single),
            ReplicatedOp::Delete(Some(value)) => {
                resolve_delete_value(entry, hist, &m.attr, value, m.csn, single)
            }
            ReplicatedOp::Add(value) if single => {
                resolve_single_add(entry, hist, &m.attr, value, m.csn)
            }
            ReplicatedOp::Add(value) => resolve_multi_add(entry, hist, &m.attr, value, m.csn),
        };

        trace!(attr = %m.attr, csn = ?m.csn, ?decision, "resolved modification");
        Ok(decision)
    }

    /// Apply a whole modify request made at `csn`.
    ///
    /// The request is validated up front and rejected as a whole if any
    /// modification is invalid. The abandon check runs before each
    /// per-value change; changes committed before it fired are kept and
    /// [`committed_prefix`] names them.
    pub fn apply_modifications(
        &self,
        entry: &mut Entry,
        hist: &mut EntryHistorical,
        mods: &[Modification],
        csn: Csn,
        abandon: &dyn Abandon,
    ) -> Result<ModifyOutcome> {
        for m in mods {
            self.validate(m)?;
        }

        let mut outcome = ModifyOutcome::default();
        for m in mods {
            for op in expand(m) {
                if abandon.is_abandoned() {
                    let committed = outcome.applied + outcome.ignored;
                    debug!(dn = %entry.dn, committed, "modify abandoned");
                    return Err(ResolveError::Abandoned { committed });
                }

                let rm = ReplicatedModification::new(m.attr.clone(), op, csn);
                match self.resolve(entry, hist, &rm)? {
                    Decision::Ignore => outcome.ignored += 1,
                    Decision::Apply | Decision::ApplyWithValue(_) => outcome.applied += 1,
                }
            }
        }

        debug!(
            dn = %entry.dn,
            csn = ?csn,
            applied = outcome.applied,
            ignored = outcome.ignored,
            "applied modify request"
        );
        Ok(outcome)
    }

    fn validate(&self, m: &Modification) -> Result<()> {
        check_target(&m.attr)?;
        let single = self.schema.is_single_valued(&m.attr);
        match m.kind {
            ModificationKind::Add if m.values.is_empty() => {
                Err(invalid(&m.attr, "add without a value"))
            }
            ModificationKind::Add | ModificationKind::Replace if single && m.values.len() > 1 => {
                Err(invalid(&m.attr, "multiple values for a single-valued attribute"))
            }
            _ => Ok(()),
        }
    }
}

/// Split a request-level modification into per-value operations.
fn expand(m: &Modification) -> Vec<ReplicatedOp> {
    match m.kind {
        ModificationKind::Replace => vec![ReplicatedOp::Replace(m.values.clone())],
        ModificationKind::Delete if m.values.is_empty() => vec![ReplicatedOp::Delete(None)],
        ModificationKind::Delete => m
            .values
            .iter()
            .map(|v| ReplicatedOp::Delete(Some(v.clone())))
            .collect(),
        ModificationKind::Add => m.values.iter().map(|v| ReplicatedOp::Add(v.clone())).collect(),
    }
}

/// The part of `mods` covered by the first `committed` per-value changes,
/// as reported by [`ResolveError::Abandoned`].
pub fn committed_prefix(mods: &[Modification], committed: usize) -> Vec<Modification> {
    let mut left = committed;
    let mut prefix = Vec::new();
    for m in mods {
        if left == 0 {
            break;
        }
        let ops = expand(m).len();
        if ops <= left {
            prefix.push(m.clone());
            left -= ops;
        } else {
            prefix.push(Modification {
                attr: m.attr.clone(),
                kind: m.kind,
                values: m.values[..left].to_vec(),
            });
            left = 0;
        }
    }
    prefix
}

fn check_target(attr: &AttributeDescription) -> Result<()> {
    if attr.name().is_empty() {
        return Err(invalid(attr, "empty attribute name"));
    }
    if attr.is_historical() {
        return Err(invalid(attr, "the historical attribute is maintained by the server"));
    }
    if attr.name() == ENTRY_SLOT {
        return Err(invalid(attr, "the name is reserved for entry facts"));
    }
    Ok(())
}

fn invalid(attr: &AttributeDescription, reason: &str) -> ResolveError {
    ResolveError::InvalidModification {
        attr: attr.to_string(),
        reason: reason.to_string(),
    }
}

fn dominated_by_replace(history: &AttributeHistory, csn: Csn) -> bool {
    history.last_replace().is_some_and(|r| r > csn)
}

/// Record a value fact made at `csn`. Returns `false` if a newer fact, or an
/// identical one, already exists.
fn record(history: &mut AttributeHistory, value: &Bytes, kind: ValueOpKind, csn: Csn) -> bool {
    history.record_value_op(value.clone(), kind, csn)
        || history.supersede_within_change(value.clone(), kind, csn)
}

/// Held values without a fact of their own. They predate everything the
/// history records and survive until the next replace.
fn unrecorded(entry: &Entry, history: &AttributeHistory, attr: &AttributeDescription) -> Vec<Bytes> {
    entry
        .values(attr)
        .iter()
        .filter(|v| history.value_record(v).is_none())
        .cloned()
        .collect()
}

/// Recompute a single-valued attribute: an unrecorded held value keeps its
/// place, otherwise the asserted add with the smallest CSN holds it.
fn settle_single(entry: &mut Entry, history: &AttributeHistory, attr: &AttributeDescription) {
    let held = unrecorded(entry, history, attr).into_iter().next();
    let winner = held.or_else(|| history.asserted().next().map(|v| v.value.clone()));
    entry.replace_values(attr, winner.into_iter().collect());
}

/// Recompute a multi-valued attribute after its replace watermark moved.
fn settle_multi(entry: &mut Entry, history: &AttributeHistory, attr: &AttributeDescription) {
    let mut values = unrecorded(entry, history, attr);
    values.extend(history.asserted().map(|v| v.value.clone()));
    entry.replace_values(attr, values);
}

fn resolve_replace(
    entry: &mut Entry,
    hist: &mut EntryHistorical,
    attr: &AttributeDescription,
    values: &[Bytes],
    csn: Csn,
    single: bool,
) -> Decision {
    let history = hist.attribute_mut(attr);
    let raised = history.record_replace(csn);

    if history.last_replace() != Some(csn) {
        // A newer replace overrides this one; keep its values as facts.
        for value in values {
            history.record_value_op(value.clone(), ValueOpKind::Add, csn);
        }
        return Decision::Ignore;
    }

    let mut changed = raised;
    if raised {
        for stale in unrecorded(entry, history, attr) {
            entry.remove_value(attr, &stale);
        }
    }

    // Earlier steps of the same request may have asserted other values.
    let earlier: Vec<Bytes> = history
        .values()
        .iter()
        .filter(|v| v.csn == csn && v.kind == ValueOpKind::Add && !values.contains(&v.value))
        .map(|v| v.value.clone())
        .collect();
    for value in earlier {
        changed |= history.supersede_within_change(value, ValueOpKind::Delete, csn);
    }
    for value in values {
        changed |= record(history, value, ValueOpKind::Add, csn);
    }

    if single {
        settle_single(entry, history, attr);
    } else {
        settle_multi(entry, history, attr);
    }
    if changed { Decision::Apply } else { Decision::Ignore }
}

fn resolve_delete_value(
    entry: &mut Entry,
    hist: &mut EntryHistorical,
    attr: &AttributeDescription,
    value: &Bytes,
    csn: Csn,
    single: bool,
) -> Decision {
    let before_creation = hist.entry_add_csn().is_some_and(|added| added >= csn);
    let history = hist.attribute_mut(attr);
    if before_creation && history.value_record(value).is_none() {
        return Decision::Ignore;
    }
    if !record(history, value, ValueOpKind::Delete, csn) {
        return Decision::Ignore;
    }

    if single {
        settle_single(entry, history, attr);
    } else {
        entry.remove_value(attr, value);
    }
    if dominated_by_replace(history, csn) {
        Decision::Ignore
    } else {
        Decision::Apply
    }
}

fn resolve_multi_add(
    entry: &mut Entry,
    hist: &mut EntryHistorical,
    attr: &AttributeDescription,
    value: &Bytes,
    csn: Csn,
) -> Decision {
    let history = hist.attribute_mut(attr);
    if !record(history, value, ValueOpKind::Add, csn) {
        return Decision::Ignore;
    }
    if history.asserts(value) {
        entry.add_value(attr, value.clone());
        Decision::Apply
    } else {
        entry.remove_value(attr, value);
        Decision::Ignore
    }
}

/// First writer wins: of the adds since the last replace, the one with the
/// smallest CSN holds the attribute. Losing adds stay recorded.
fn resolve_single_add(
    entry: &mut Entry,
    hist: &mut EntryHistorical,
    attr: &AttributeDescription,
    value: &Bytes,
    csn: Csn,
) -> Decision {
    let history = hist.attribute_mut(attr);
    if !record(history, value, ValueOpKind::Add, csn) {
        return Decision::Ignore;
    }

    let before = entry.values(attr).first().cloned();
    settle_single(entry, history, attr);
    match (before, entry.values(attr).first()) {
        (_, Some(held)) if held != value => {
            trace!(attr = %attr, csn = ?csn, "add recorded behind an earlier value");
            Decision::Ignore
        }
        (Some(previous), Some(_)) if previous != *value => {
            debug!(attr = %attr, csn = ?csn, "earlier add displaced held value");
            Decision::ApplyWithValue(value.clone())
        }
        (_, Some(_)) => Decision::Apply,
        (_, None) => Decision::Ignore,
    }
}
