//! Shared test harness for Burrow integration tests.
//!
//! Provides [`Topology`]: N replicas of one suffix, each with its own
//! in-memory store and hand-driven clock, connected by an in-process
//! message bus with partition injection: messages for an isolated replica
//! queue up and are delivered, newest first, when it heals.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use burrow_historical::{ReplayOutcome, ReplicationDomain, UpdateMsg};
use burrow_store::{EntryLocks, MemoryEntryStore};
use burrow_types::{
    AttributeDescription, Dn, Entry, LogicalClock, ManualClock, ReplicaId, SchemaMap,
};
use bytes::Bytes;

/// Wall-clock start for every replica.
pub const T0: u64 = 1_700_000_000_000;

/// Suffix replicated by every topology.
pub const BASE: &str = "o=example";

// =========================================================================
// Value helpers
// =========================================================================

pub fn attr(s: &str) -> AttributeDescription {
    s.parse().unwrap()
}

pub fn dn(s: &str) -> Dn {
    s.parse().unwrap()
}

pub fn b(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

/// Build an attribute map from `(name, values)` pairs.
pub fn attrs(pairs: &[(&str, &[&str])]) -> BTreeMap<AttributeDescription, Vec<Bytes>> {
    pairs
        .iter()
        .map(|(name, values)| (attr(name), values.iter().map(|v| b(v)).collect()))
        .collect()
}

/// Attributes of a minimal inetOrgPerson.
pub fn person(cn: &str) -> BTreeMap<AttributeDescription, Vec<Bytes>> {
    attrs(&[
        ("objectclass", &["top", "person", "inetOrgPerson"]),
        ("cn", &[cn]),
        ("sn", &["Example"]),
    ])
}

/// Values of `name` as sorted strings.
pub fn values_of(entry: &Entry, name: &str) -> Vec<String> {
    let mut values: Vec<String> = entry
        .values(&attr(name))
        .iter()
        .map(|v| String::from_utf8_lossy(v).into_owned())
        .collect();
    values.sort();
    values
}

/// Everything replicas must agree on for one entry: its DN, its user
/// values (order-independent) and its encoded history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryState {
    pub dn: Dn,
    pub values: BTreeMap<String, Vec<String>>,
    pub history: Vec<Bytes>,
}

impl EntryState {
    pub fn of(entry: &Entry) -> Self {
        Self {
            dn: entry.dn.clone(),
            values: entry
                .user_attributes()
                .map(|(desc, _)| (desc.to_string(), values_of(entry, &desc.to_string())))
                .collect(),
            history: entry.historical_values().to_vec(),
        }
    }
}

/// Every ordering of `items`.
pub fn permutations<T: Clone>(items: &[T]) -> Vec<Vec<T>> {
    if items.len() <= 1 {
        return vec![items.to_vec()];
    }
    let mut out = Vec::new();
    for i in 0..items.len() {
        let mut rest = items.to_vec();
        let head = rest.remove(i);
        for mut tail in permutations(&rest) {
            tail.insert(0, head.clone());
            out.push(tail);
        }
    }
    out
}

// =========================================================================
// Replica
// =========================================================================

/// One replica: a replication domain plus the handles tests poke at.
pub struct Replica {
    pub domain: ReplicationDomain,
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryEntryStore>,
}

impl Replica {
    /// An empty replica of [`BASE`] with the default schema.
    pub fn new(id: u16) -> Self {
        let clock = Arc::new(ManualClock::new(T0));
        let store = Arc::new(MemoryEntryStore::new());
        let domain = ReplicationDomain::new(
            dn(BASE),
            LogicalClock::with_clock(ReplicaId(id), clock.clone()),
            store.clone(),
            Arc::new(EntryLocks::new()),
            Arc::new(SchemaMap::default()),
        );
        Self {
            domain,
            clock,
            store,
        }
    }

    /// Replay `msg`, failing the test on error.
    pub fn apply(&self, msg: &UpdateMsg) -> ReplayOutcome {
        self.domain
            .replay(msg)
            .unwrap_or_else(|e| panic!("replica {} failed to replay {msg:?}: {e}", self.id()))
    }

    pub fn id(&self) -> ReplicaId {
        self.domain.replica_id()
    }

    /// Current state of the entry at `dn`, if any.
    pub fn state(&self, dn: &Dn) -> Option<EntryState> {
        self.domain.entry(dn).unwrap().map(|e| EntryState::of(&e))
    }

    /// State of every entry, keyed by DN.
    pub fn all_states(&self) -> BTreeMap<Dn, EntryState> {
        self.store
            .entries()
            .iter()
            .map(|e| (e.dn.clone(), EntryState::of(e)))
            .collect()
    }
}

// =========================================================================
// Topology
// =========================================================================

/// A multi-master topology over an in-process bus.
pub struct Topology {
    replicas: Vec<Replica>,
    /// Messages every replica has seen, used to seed observers.
    shared: Vec<UpdateMsg>,
    isolated: HashSet<usize>,
    /// `(replica index, message)` held back by a partition.
    pending: Vec<(usize, UpdateMsg)>,
}

impl Topology {
    /// Replicas with the given ids. The first one creates the suffix entry
    /// and every other replica receives it.
    pub fn new(ids: &[u16]) -> Self {
        assert!(!ids.is_empty(), "a topology needs at least one replica");
        let mut topology = Self {
            replicas: ids.iter().map(|id| Replica::new(*id)).collect(),
            shared: Vec::new(),
            isolated: HashSet::new(),
            pending: Vec::new(),
        };
        let base = topology
            .domain(0)
            .add(
                &dn(BASE),
                attrs(&[("objectclass", &["top", "organization"]), ("o", &["example"])]),
            )
            .unwrap();
        topology.broadcast(0, &base);
        topology
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    pub fn replica(&self, i: usize) -> &Replica {
        &self.replicas[i]
    }

    pub fn domain(&self, i: usize) -> &ReplicationDomain {
        &self.replicas[i].domain
    }

    pub fn clock(&self, i: usize) -> &ManualClock {
        &self.replicas[i].clock
    }

    /// Set the wall clock of every replica.
    pub fn set_all_clocks(&self, now_ms: u64) {
        for replica in &self.replicas {
            replica.clock.set(now_ms);
        }
    }

    /// Deliver `msg`, produced locally by replica `from`, to every other
    /// replica. Isolated replicas get it when they heal.
    pub fn broadcast(&mut self, from: usize, msg: &UpdateMsg) {
        for to in 0..self.replicas.len() {
            if to == from {
                continue;
            }
            if self.isolated.contains(&to) {
                self.pending.push((to, msg.clone()));
            } else {
                self.replicas[to].apply(msg);
            }
        }
        if self.isolated.is_empty() {
            self.shared.push(msg.clone());
        }
    }

    /// Cut replica `i` off the bus.
    pub fn isolate(&mut self, i: usize) {
        self.isolated.insert(i);
    }

    /// Reconnect replica `i` and deliver what it missed, newest first.
    pub fn heal(&mut self, i: usize) {
        self.isolated.remove(&i);
        let (mine, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|(to, _)| *to == i);
        self.pending = rest;
        for (_, msg) in mine.iter().rev() {
            self.replicas[i].apply(msg);
        }
    }

    /// Messages every replica has seen, oldest first. The first one
    /// creates the suffix.
    pub fn shared(&self) -> &[UpdateMsg] {
        &self.shared
    }

    /// A fresh replica that has seen exactly the messages every member of
    /// the topology has seen.
    pub fn observer(&self, id: u16) -> Replica {
        let replica = Replica::new(id);
        for msg in &self.shared {
            replica.apply(msg);
        }
        replica
    }

    /// Assert that every replica holds the same state for every entry.
    pub fn assert_converged(&self) {
        let reference = self.replicas[0].all_states();
        for replica in &self.replicas[1..] {
            let states = replica.all_states();
            assert_eq!(
                states.keys().collect::<Vec<_>>(),
                reference.keys().collect::<Vec<_>>(),
                "replica {} holds different entries than replica {}",
                replica.id(),
                self.replicas[0].id()
            );
            for (dn, state) in &states {
                assert_eq!(
                    state,
                    &reference[dn],
                    "replica {} diverged on {dn}",
                    replica.id()
                );
            }
        }
    }
}
