//! Whole-entry history: per-attribute facts plus entry-level creation and
//! rename facts, with decoding from and encoding into the historical
//! attribute.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use burrow_types::{AttributeDescription, Clock, Csn, Entry, SystemClock};
use tracing::{debug, trace};

use crate::attribute::{AttributeHistory, ValueOpKind};
use crate::encoding::{HistoricalToken, TokenKind};
use crate::error::HistoricalError;

type Result<T> = std::result::Result<T, HistoricalError>;

/// The decoded history of one entry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EntryHistorical {
    attributes: BTreeMap<AttributeDescription, AttributeHistory>,
    entry_add: Option<Csn>,
    entry_rename: Option<Csn>,
    purge_delay: Option<Duration>,
    last_purged_values_count: usize,
}

impl EntryHistorical {
    /// An empty history with purging disabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// History of an entry created by the change `csn`.
    pub fn for_new_entry(csn: Csn) -> Self {
        Self {
            entry_add: Some(csn),
            ..Self::default()
        }
    }

    /// Decode the history stored in `entry`'s historical attribute.
    ///
    /// An entry without the attribute yields an empty history. Any
    /// malformed value fails the whole decode.
    pub fn new_instance_from_entry(entry: &Entry) -> Result<Self> {
        let mut hist = Self::new();
        for raw in entry.historical_values() {
            hist.absorb(HistoricalToken::decode(raw)?);
        }
        trace!(
            dn = %entry.dn,
            tokens = entry.historical_values().len(),
            attributes = hist.attributes.len(),
            "decoded entry history"
        );
        Ok(hist)
    }

    fn absorb(&mut self, token: HistoricalToken) {
        match token {
            HistoricalToken::EntryAdd(csn) => {
                self.entry_add = Some(self.entry_add.map_or(csn, |c| c.min(csn)));
            }
            HistoricalToken::EntryRename(csn) => {
                self.entry_rename = Some(self.entry_rename.map_or(csn, |c| c.max(csn)));
            }
            HistoricalToken::Attribute {
                attr,
                csn,
                kind,
                value,
            } => {
                let history = self.attributes.entry(attr).or_default();
                match (kind, value) {
                    (TokenKind::DeleteAttribute, _) => {
                        history.record_replace(csn);
                    }
                    (TokenKind::Replace, Some(v)) => {
                        history.record_replace(csn);
                        history.record_value_op(v, ValueOpKind::Add, csn);
                    }
                    (TokenKind::Add, Some(v)) => {
                        history.record_value_op(v, ValueOpKind::Add, csn);
                    }
                    (TokenKind::Delete, Some(v)) => {
                        history.record_value_op(v, ValueOpKind::Delete, csn);
                    }
                    // `decode` guarantees a value for these kinds.
                    (_, None) => {}
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// History of one attribute.
    pub fn attribute(&self, attr: &AttributeDescription) -> Option<&AttributeHistory> {
        self.attributes.get(attr)
    }

    /// History of one attribute, created empty if absent.
    pub fn attribute_mut(&mut self, attr: &AttributeDescription) -> &mut AttributeHistory {
        self.attributes.entry(attr.clone()).or_default()
    }

    /// All attribute histories.
    pub fn attributes(&self) -> impl Iterator<Item = (&AttributeDescription, &AttributeHistory)> {
        self.attributes.iter()
    }

    /// CSN of the entry's creation.
    pub fn entry_add_csn(&self) -> Option<Csn> {
        self.entry_add
    }

    /// CSN of the entry's latest rename.
    pub fn entry_rename_csn(&self) -> Option<Csn> {
        self.entry_rename
    }

    /// Record a rename at `csn`. Returns `false` if an equal or newer
    /// rename is already recorded.
    pub fn record_rename(&mut self, csn: Csn) -> bool {
        match self.entry_rename {
            Some(existing) if existing >= csn => false,
            _ => {
                self.entry_rename = Some(csn);
                true
            }
        }
    }

    /// The newest CSN recorded anywhere.
    pub fn latest_csn(&self) -> Option<Csn> {
        self.attributes
            .values()
            .filter_map(AttributeHistory::latest_csn)
            .chain(self.entry_add)
            .chain(self.entry_rename)
            .max()
    }

    /// The oldest CSN recorded anywhere.
    pub fn oldest_csn(&self) -> Option<Csn> {
        self.tokens().iter().map(HistoricalToken::csn).min()
    }

    /// Whether nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.entry_add.is_none()
            && self.entry_rename.is_none()
            && self.attributes.values().all(AttributeHistory::is_empty)
    }

    /// Set how long facts are retained. Facts older than `now - delay`
    /// are dropped by [`encode_and_purge`](Self::encode_and_purge).
    pub fn set_purge_delay(&mut self, delay: Duration) {
        self.purge_delay = Some(delay);
    }

    /// The configured retention, `None` when purging is disabled.
    pub fn purge_delay(&self) -> Option<Duration> {
        self.purge_delay
    }

    /// Number of facts removed by the most recent purge.
    pub fn last_purged_values_count(&self) -> usize {
        self.last_purged_values_count
    }

    // -----------------------------------------------------------------------
    // Encoding and purging
    // -----------------------------------------------------------------------

    /// All facts as tokens, ordered by CSN.
    pub fn tokens(&self) -> Vec<HistoricalToken> {
        let mut tokens = Vec::new();

        if let Some(csn) = self.entry_add {
            tokens.push(HistoricalToken::EntryAdd(csn));
        }

        for (attr, history) in &self.attributes {
            let replace = history.last_replace();
            if history.has_standalone_replace()
                && let Some(csn) = replace
            {
                tokens.push(HistoricalToken::Attribute {
                    attr: attr.clone(),
                    csn,
                    kind: TokenKind::DeleteAttribute,
                    value: None,
                });
            }
            for record in history.values() {
                let kind = match record.kind {
                    ValueOpKind::Add if Some(record.csn) == replace => TokenKind::Replace,
                    ValueOpKind::Add => TokenKind::Add,
                    ValueOpKind::Delete => TokenKind::Delete,
                };
                tokens.push(HistoricalToken::Attribute {
                    attr: attr.clone(),
                    csn: record.csn,
                    kind,
                    value: Some(record.value.clone()),
                });
            }
        }

        if let Some(csn) = self.entry_rename {
            tokens.push(HistoricalToken::EntryRename(csn));
        }

        tokens.sort_by_key(HistoricalToken::csn);
        tokens
    }

    /// Serialize without purging.
    pub fn encode(&self) -> Vec<Bytes> {
        self.tokens().iter().map(HistoricalToken::encode).collect()
    }

    /// Purge facts older than the retention window, measured against the
    /// system clock, then serialize.
    pub fn encode_and_purge(&mut self) -> Vec<Bytes> {
        self.encode_and_purge_at(SystemClock.now_ms())
    }

    /// Purge facts older than `now_ms - purge_delay`, then serialize.
    ///
    /// Records the number of removed facts in
    /// [`last_purged_values_count`](Self::last_purged_values_count).
    /// With no purge delay nothing is removed.
    pub fn encode_and_purge_at(&mut self, now_ms: u64) -> Vec<Bytes> {
        self.last_purged_values_count = match self.purge_delay {
            Some(delay) => {
                let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                let cutoff = Csn::cutoff(now_ms.saturating_sub(delay_ms));
                self.purge_older_than(&cutoff)
            }
            None => 0,
        };

        if self.last_purged_values_count > 0 {
            debug!(
                purged = self.last_purged_values_count,
                now_ms, "purged historical facts"
            );
        }

        self.encode()
    }

    /// Remove every fact older than `cutoff`. Returns how many were removed.
    pub fn purge_older_than(&mut self, cutoff: &Csn) -> usize {
        let mut purged = 0;

        self.attributes.retain(|_, history| {
            purged += history.purge_older_than(cutoff);
            !history.is_empty()
        });

        if self.entry_add.is_some_and(|c| c < *cutoff) {
            self.entry_add = None;
            purged += 1;
        }
        if self.entry_rename.is_some_and(|c| c < *cutoff) {
            self.entry_rename = None;
            purged += 1;
        }

        purged
    }

    /// Write `encoded` into `entry`'s historical attribute. An empty list
    /// removes the attribute.
    pub fn store_encoded(entry: &mut Entry, encoded: Vec<Bytes>) {
        entry.replace_values(&AttributeDescription::historical(), encoded);
    }
}
