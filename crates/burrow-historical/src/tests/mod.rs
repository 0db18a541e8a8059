//! Tests for the historical crate.


use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use burrow_store::{EntryLocks, MemoryEntryStore};
use burrow_types::{
    AttributeDescription, Csn, Dn, Entry, EntryId, LogicalClock, ManualClock, ReplicaId, SchemaMap,
};

use crate::domain::ReplicationDomain;
use crate::replay::UpdateMsg;
use crate::resolver::Abandon;

/// Wall-clock start for every test replica.
const T0: u64 = 1_700_000_000_000;

const BASE: &str = "o=test";

fn attr(s: &str) -> AttributeDescription {
    s.parse().unwrap()
}

fn dn(s: &str) -> Dn {
    s.parse().unwrap()
}

fn csn(ts: u64, replica: u16) -> Csn {
    Csn::new(ts, 0, ReplicaId(replica))
}

fn b(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

/// Build an attribute map from `(name, values)` pairs.
fn attrs(pairs: &[(&str, &[&str])]) -> BTreeMap<AttributeDescription, Vec<Bytes>> {
    pairs
        .iter()
        .map(|(name, values)| (attr(name), values.iter().map(|v| b(v)).collect()))
        .collect()
}

/// An entry holding `description: init`, without any history.
fn bare_entry(name: &str) -> Entry {
    let mut entry = Entry::new(dn(name), EntryId::from_data(name.as_bytes()));
    entry.add_value(&attr("description"), b("init"));
    entry
}

/// Values of `name` as sorted strings.
fn values_of(entry: &Entry, name: &str) -> Vec<String> {
    let mut values: Vec<String> = entry
        .values(&attr(name))
        .iter()
        .map(|v| String::from_utf8_lossy(v).into_owned())
        .collect();
    values.sort();
    values
}

/// User attributes as sorted strings, for order-independent comparison.
fn user_state(entry: &Entry) -> BTreeMap<String, Vec<String>> {
    entry
        .user_attributes()
        .map(|(desc, _)| (desc.to_string(), values_of(entry, &desc.to_string())))
        .collect()
}

/// A replica of `o=test` with an in-memory store and a hand-driven clock.
fn test_domain(replica: u16) -> (Arc<ManualClock>, ReplicationDomain) {
    let wall = Arc::new(ManualClock::new(T0));
    let clock = LogicalClock::with_clock(ReplicaId(replica), wall.clone());
    let domain = ReplicationDomain::new(
        dn(BASE),
        clock,
        Arc::new(MemoryEntryStore::new()),
        Arc::new(EntryLocks::new()),
        Arc::new(SchemaMap::default()),
    );
    (wall, domain)
}

/// Create the suffix entry and return the message that replicates it.
fn add_base(domain: &ReplicationDomain) -> UpdateMsg {
    domain
        .add(
            &dn(BASE),
            attrs(&[("objectclass", &["top", "organization"]), ("o", &["test"])]),
        )
        .unwrap()
}

/// Attributes of a minimal inetOrgPerson.
fn person(cn: &str) -> BTreeMap<AttributeDescription, Vec<Bytes>> {
    attrs(&[
        (
            "objectclass",
            &["top", "person", "organizationalPerson", "inetOrgPerson"],
        ),
        ("cn", &[cn]),
        ("sn", &["test"]),
    ])
}

/// Abandons once `limit` checks have passed.
struct AbandonAfter {
    checks: Cell<usize>,
    limit: usize,
}

impl AbandonAfter {
    fn new(limit: usize) -> Self {
        Self {
            checks: Cell::new(0),
            limit,
        }
    }
}

impl Abandon for AbandonAfter {
    fn is_abandoned(&self) -> bool {
        let n = self.checks.get();
        self.checks.set(n + 1);
        n >= self.limit
    }
}
