//! Shared types and identifiers for Burrow.
//!
//! This crate defines the types used across the Burrow workspace:
//! identifiers ([`EntryId`], [`ReplicaId`]), the logical clock ([`Csn`],
//! [`LogicalClock`]), naming ([`Dn`], [`Rdn`]) and the entry model
//! ([`Entry`], [`AttributeDescription`], [`Modification`], [`AttributeSchema`]).

use std::fmt;

use serde::{Deserialize, Serialize};

mod csn;
mod dn;
mod entry;

pub use csn::{Clock, Csn, CsnParseError, LogicalClock, ManualClock, SystemClock};
pub use dn::{Dn, DnParseError, Rdn};
pub use entry::{
    AttributeDescription, AttributeSchema, Entry, HISTORICAL_ATTRIBUTE, Modification,
    ModificationKind, SchemaMap,
};

// ---------------------------------------------------------------------------
// ID types
// ---------------------------------------------------------------------------

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        pub struct $name([u8; 32]);

        impl $name {
            /// Create an ID by hashing arbitrary data with BLAKE3.
            pub fn from_data(data: &[u8]) -> Self {
                Self(blake3::hash(data).into())
            }

            /// Return the raw 32-byte representation.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for byte in &self.0 {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }
    };
}

define_id!(
    /// Stable identifier of an entry, independent of its DN.
    ///
    /// Survives renames; replicated operations address entries by this ID.
    EntryId
);

impl EntryId {
    /// Derive the ID for an entry created at `dn` by the change `csn`.
    ///
    /// The CSN is globally unique, so two replicas creating the same DN
    /// concurrently still produce distinct IDs.
    pub fn generate(dn: &Dn, csn: &Csn) -> Self {
        Self::from_data(format!("{dn}\n{csn}").as_bytes())
    }
}

/// Identity of one replica (server) in the multi-master topology.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize, Default)]
pub struct ReplicaId(pub u16);

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplicaId({})", self.0)
    }
}

impl From<u16> for ReplicaId {
    fn from(id: u16) -> Self {
        Self(id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
