//! Change sequence numbers and the logical clock that issues them.
//!
//! A [`Csn`] orders every change in the topology: wall-clock milliseconds
//! first, then a per-replica sequence for same-millisecond events, then the
//! replica id as the final tiebreak. All replicas agree on this order once
//! CSNs are exchanged, which is what conflict resolution relies on.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ReplicaId;

/// Length of the canonical hex form: 16 (timestamp) + 4 (replica) + 8 (sequence).
const CSN_HEX_LEN: usize = 28;

/// Change sequence number.
///
/// Field order matters: the derived `Ord` compares `timestamp`, then
/// `sequence`, then `replica_id`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Csn {
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Disambiguates events issued by one replica within the same millisecond.
    pub sequence: u32,
    /// Replica that issued the change.
    pub replica_id: ReplicaId,
}

/// Error returned when parsing the hex form of a [`Csn`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid CSN {input:?}: {reason}")]
pub struct CsnParseError {
    /// The rejected input.
    pub input: String,
    /// What was wrong with it.
    pub reason: &'static str,
}

impl Csn {
    /// Create a CSN from its components.
    pub fn new(timestamp: u64, sequence: u32, replica_id: ReplicaId) -> Self {
        Self {
            timestamp,
            sequence,
            replica_id,
        }
    }

    /// Smallest CSN at `timestamp`. Every CSN issued before `timestamp`
    /// sorts strictly below it.
    pub fn cutoff(timestamp: u64) -> Self {
        Self::new(timestamp, 0, ReplicaId(0))
    }

    /// Whether this CSN sorts strictly before `other`.
    pub fn is_older_than(&self, other: &Csn) -> bool {
        self < other
    }

    /// Whether this CSN sorts strictly after `other`.
    pub fn is_newer_than(&self, other: &Csn) -> bool {
        self > other
    }
}

impl fmt::Display for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:016x}{:04x}{:08x}",
            self.timestamp, self.replica_id.0, self.sequence
        )
    }
}

impl fmt::Debug for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Csn({}.{}@{})",
            self.timestamp, self.sequence, self.replica_id
        )
    }
}

impl FromStr for Csn {
    type Err = CsnParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| CsnParseError {
            input: s.to_string(),
            reason,
        };

        if s.len() != CSN_HEX_LEN {
            return Err(err("expected 28 hex digits"));
        }
        if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(err("non-hex character"));
        }

        let timestamp = u64::from_str_radix(&s[0..16], 16).map_err(|_| err("bad timestamp"))?;
        let replica = u16::from_str_radix(&s[16..20], 16).map_err(|_| err("bad replica id"))?;
        let sequence = u32::from_str_radix(&s[20..28], 16).map_err(|_| err("bad sequence"))?;

        Ok(Self::new(timestamp, sequence, ReplicaId(replica)))
    }
}

// ---------------------------------------------------------------------------
// Wall clock sources
// ---------------------------------------------------------------------------

/// Source of wall-clock milliseconds.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A clock moved by hand. Used for deterministic tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a clock reading `now_ms`.
    pub fn new(now_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(now_ms),
        }
    }

    /// Set the current reading. May move backwards.
    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    /// Move the reading forward by `delta_ms`.
    pub fn advance(&self, delta_ms: u64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Logical clock
// ---------------------------------------------------------------------------

/// Issues strictly increasing CSNs for one replica.
///
/// The wall clock is the primary component. When it has not moved past the
/// last issued timestamp (same millisecond, or a backward jump) the sequence
/// is advanced instead, so a regression never yields a CSN at or below one
/// already issued.
pub struct LogicalClock {
    replica_id: ReplicaId,
    clock: Arc<dyn Clock>,
    /// `(timestamp, sequence)` of the highest CSN issued or witnessed.
    last: Mutex<(u64, u32)>,
}

impl LogicalClock {
    /// Create a clock for `replica_id` driven by the system wall clock.
    pub fn new(replica_id: ReplicaId) -> Self {
        Self::with_clock(replica_id, Arc::new(SystemClock))
    }

    /// Create a clock for `replica_id` driven by an explicit wall clock.
    pub fn with_clock(replica_id: ReplicaId, clock: Arc<dyn Clock>) -> Self {
        Self {
            replica_id,
            clock,
            last: Mutex::new((0, 0)),
        }
    }

    /// The replica this clock issues CSNs for.
    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    /// Current wall-clock reading of the underlying clock.
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Issue the next CSN.
    pub fn next(&self) -> Csn {
        let now = self.clock.now_ms();
        let mut last = self.last.lock().expect("clock lock poisoned");

        let (timestamp, sequence) = if now > last.0 {
            (now, 0)
        } else {
            if now < last.0 {
                debug!(
                    wall = now,
                    last = last.0,
                    "wall clock behind last CSN, advancing sequence"
                );
            }
            match last.1.checked_add(1) {
                Some(seq) => (last.0, seq),
                None => (last.0 + 1, 0),
            }
        };

        *last = (timestamp, sequence);
        Csn::new(timestamp, sequence, self.replica_id)
    }

    /// Witness a CSN produced elsewhere. CSNs issued afterwards sort after it.
    pub fn adjust(&self, seen: &Csn) {
        let mut last = self.last.lock().expect("clock lock poisoned");
        if (seen.timestamp, seen.sequence) > *last {
            *last = (seen.timestamp, seen.sequence);
        }
    }
}

impl fmt::Debug for LogicalClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalClock")
            .field("replica_id", &self.replica_id)
            .finish_non_exhaustive()
    }
}
