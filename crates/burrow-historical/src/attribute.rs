//! Per-attribute change history.
//!
//! An [`AttributeHistory`] remembers, for one attribute description, the CSN
//! of the last whole-attribute replace (or delete) and the most recent fact
//! about each distinct value. Facts a later replace overrides stay recorded
//! until they are purged, so two replicas that saw the same changes hold
//! the same history whatever the delivery order.

use bytes::Bytes;
use burrow_types::Csn;
use serde::{Deserialize, Serialize};

/// Whether a value fact records an addition or a deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueOpKind {
    /// The value was added (or asserted by a replace).
    Add,
    /// The value was deleted.
    Delete,
}

/// The most recent fact about one value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricalValue {
    /// The attribute value.
    pub value: Bytes,
    /// Add or delete.
    pub kind: ValueOpKind,
    /// When it happened.
    pub csn: Csn,
}

/// History of one attribute description.
///
/// Holds at most one [`HistoricalValue`] per distinct value; iteration is
/// in CSN order (value bytes break ties).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AttributeHistory {
    last_replace: Option<Csn>,
    values: Vec<HistoricalValue>,
}

impl AttributeHistory {
    /// An empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// CSN of the last replace or whole-attribute delete.
    pub fn last_replace(&self) -> Option<Csn> {
        self.last_replace
    }

    /// Value facts in CSN order.
    pub fn values(&self) -> &[HistoricalValue] {
        &self.values
    }

    /// The fact recorded for `value`, if any.
    pub fn value_record(&self, value: &[u8]) -> Option<&HistoricalValue> {
        self.values.iter().find(|v| v.value.as_ref() == value)
    }

    /// Whether nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.last_replace.is_none() && self.values.is_empty()
    }

    /// The newest CSN anywhere in this history.
    pub fn latest_csn(&self) -> Option<Csn> {
        let newest_value = self.values.last().map(|v| v.csn);
        newest_value.max(self.last_replace)
    }

    /// Raise the replace watermark to `csn`. Returns `false` if an equal or
    /// newer replace is already recorded.
    pub fn record_replace(&mut self, csn: Csn) -> bool {
        match self.last_replace {
            Some(existing) if existing >= csn => false,
            _ => {
                self.last_replace = Some(csn);
                true
            }
        }
    }

    /// Record a fact about `value`.
    ///
    /// Inserts only if no fact for the same value carries an equal or newer
    /// CSN; an older fact is replaced. Returns whether anything changed.
    pub fn record_value_op(&mut self, value: Bytes, kind: ValueOpKind, csn: Csn) -> bool {
        if let Some(existing) = self.value_record(&value)
            && existing.csn >= csn
        {
            return false;
        }
        self.insert(HistoricalValue { value, kind, csn });
        true
    }

    /// Overwrite the fact for `value` made by the same change.
    ///
    /// Operations inside one modify request share a CSN and apply in
    /// request order, so a later step may flip the kind recorded by an
    /// earlier one. Returns `false` if the recorded fact is from another
    /// change or already has this kind.
    pub fn supersede_within_change(&mut self, value: Bytes, kind: ValueOpKind, csn: Csn) -> bool {
        match self.value_record(&value) {
            Some(existing) if existing.csn == csn && existing.kind != kind => {
                self.insert(HistoricalValue { value, kind, csn });
                true
            }
            _ => false,
        }
    }

    /// Whether the fact for `value` is an add that no replace has
    /// overridden since.
    pub fn asserts(&self, value: &[u8]) -> bool {
        self.value_record(value).is_some_and(|v| self.is_asserted(v))
    }

    /// Values asserted since the last replace, in CSN order.
    pub fn asserted(&self) -> impl Iterator<Item = &HistoricalValue> {
        self.values.iter().filter(|v| self.is_asserted(v))
    }

    fn is_asserted(&self, record: &HistoricalValue) -> bool {
        record.kind == ValueOpKind::Add && self.last_replace.is_none_or(|r| record.csn >= r)
    }

    /// Number of serialized tokens this history encodes to.
    ///
    /// Every value fact is one token. A replace watermark that no value
    /// fact carries is one more (`attrDel`).
    pub fn token_count(&self) -> usize {
        self.values.len() + usize::from(self.has_standalone_replace())
    }

    /// Remove facts older than `cutoff` and return how many serialized
    /// tokens went with them.
    ///
    /// A replace older than the cutoff goes too, together with every value
    /// fact it overrode.
    pub fn purge_older_than(&mut self, cutoff: &Csn) -> usize {
        let before = self.token_count();

        self.values.retain(|v| v.csn >= *cutoff);
        if self.last_replace.is_some_and(|r| r < *cutoff) {
            self.last_replace = None;
        }

        before - self.token_count()
    }

    /// Whether the replace watermark is not carried by any value asserted
    /// at that CSN.
    pub(crate) fn has_standalone_replace(&self) -> bool {
        self.last_replace.is_some_and(|r| {
            !self
                .values
                .iter()
                .any(|v| v.csn == r && v.kind == ValueOpKind::Add)
        })
    }

    fn insert(&mut self, record: HistoricalValue) {
        self.values.retain(|v| v.value != record.value);
        let pos = self
            .values
            .partition_point(|v| (v.csn, v.value.as_ref()) < (record.csn, record.value.as_ref()));
        self.values.insert(pos, record);
    }
}
