//! Entries, attribute descriptions and modifications.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{Dn, EntryId};

/// Name of the operational attribute that carries an entry's history.
pub const HISTORICAL_ATTRIBUTE: &str = "ds-sync-hist";

// ---------------------------------------------------------------------------
// Attribute descriptions
// ---------------------------------------------------------------------------

/// An attribute name plus its options, e.g. `cn;lang-en`.
///
/// Name and options are lower-cased and options are kept sorted, so
/// `CN;Lang-EN` and `cn;lang-en` are the same description.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AttributeDescription {
    name: String,
    options: BTreeSet<String>,
}

impl AttributeDescription {
    /// Create a description without options.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.trim().to_ascii_lowercase(),
            options: BTreeSet::new(),
        }
    }

    /// Add an option, e.g. a language tag.
    pub fn with_option(mut self, option: &str) -> Self {
        self.options.insert(option.trim().to_ascii_lowercase());
        self
    }

    /// The historical operational attribute.
    pub fn historical() -> Self {
        Self::new(HISTORICAL_ATTRIBUTE)
    }

    /// The attribute name without options.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The options, sorted.
    pub fn options(&self) -> impl Iterator<Item = &str> {
        self.options.iter().map(String::as_str)
    }

    /// Whether this names the historical operational attribute.
    pub fn is_historical(&self) -> bool {
        self.name == HISTORICAL_ATTRIBUTE
    }
}

impl fmt::Display for AttributeDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for option in &self.options {
            write!(f, ";{option}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for AttributeDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AttributeDescription({self})")
    }
}

impl FromStr for AttributeDescription {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(';');
        let name = parts.next().unwrap_or_default().trim();
        if name.is_empty() {
            return Err(format!("empty attribute name in {s:?}"));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        {
            return Err(format!("invalid attribute name {name:?}"));
        }

        let mut desc = AttributeDescription::new(name);
        for option in parts {
            if option.trim().is_empty() {
                return Err(format!("empty option in {s:?}"));
            }
            desc = desc.with_option(option);
        }
        Ok(desc)
    }
}

impl TryFrom<String> for AttributeDescription {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<AttributeDescription> for String {
    fn from(desc: AttributeDescription) -> Self {
        desc.to_string()
    }
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// The one schema property conflict resolution depends on.
pub trait AttributeSchema: Send + Sync {
    /// Whether the attribute holds at most one value.
    fn is_single_valued(&self, attr: &AttributeDescription) -> bool;
}

/// Schema backed by a set of single-valued attribute names.
///
/// Options are ignored: `displayname;lang-en` is single-valued when
/// `displayname` is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaMap {
    single_valued: HashSet<String>,
}

impl SchemaMap {
    /// A schema where every attribute is multi-valued.
    pub fn empty() -> Self {
        Self {
            single_valued: HashSet::new(),
        }
    }

    /// A schema with the given single-valued attribute names.
    pub fn with_single_valued<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            single_valued: names
                .into_iter()
                .map(|n| n.as_ref().trim().to_ascii_lowercase())
                .collect(),
        }
    }

    /// Mark an attribute single-valued.
    pub fn insert(&mut self, name: &str) {
        self.single_valued.insert(name.trim().to_ascii_lowercase());
    }
}

impl Default for SchemaMap {
    /// Single-valued user attributes of the standard inetOrgPerson/posix schema.
    fn default() -> Self {
        Self::with_single_valued([
            "displayname",
            "employeenumber",
            "preferredlanguage",
            "uidnumber",
            "gidnumber",
            "homedirectory",
            "loginshell",
        ])
    }
}

impl AttributeSchema for SchemaMap {
    fn is_single_valued(&self, attr: &AttributeDescription) -> bool {
        self.single_valued.contains(attr.name())
    }
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// A named node in the directory tree.
///
/// Values of one attribute form a set (no duplicates, insertion order kept).
/// An attribute with no values is removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Current name.
    pub dn: Dn,
    /// Stable identifier.
    pub id: EntryId,
    /// User and operational attributes.
    pub attributes: BTreeMap<AttributeDescription, Vec<Bytes>>,
}

impl Entry {
    /// Create an entry with no attributes.
    pub fn new(dn: Dn, id: EntryId) -> Self {
        Self {
            dn,
            id,
            attributes: BTreeMap::new(),
        }
    }

    /// Values of `attr` (empty if absent).
    pub fn values(&self, attr: &AttributeDescription) -> &[Bytes] {
        self.attributes.get(attr).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether `attr` holds `value`.
    pub fn has_value(&self, attr: &AttributeDescription, value: &[u8]) -> bool {
        self.values(attr).iter().any(|v| v.as_ref() == value)
    }

    /// Add a value. Returns `false` if it was already present.
    pub fn add_value(&mut self, attr: &AttributeDescription, value: Bytes) -> bool {
        let values = self.attributes.entry(attr.clone()).or_default();
        if values.iter().any(|v| *v == value) {
            return false;
        }
        values.push(value);
        true
    }

    /// Remove a value. Returns `false` if it was not present.
    pub fn remove_value(&mut self, attr: &AttributeDescription, value: &[u8]) -> bool {
        let Some(values) = self.attributes.get_mut(attr) else {
            return false;
        };
        let before = values.len();
        values.retain(|v| v.as_ref() != value);
        let removed = values.len() != before;
        if values.is_empty() {
            self.attributes.remove(attr);
        }
        removed
    }

    /// Replace all values of `attr`. An empty list removes the attribute.
    pub fn replace_values(&mut self, attr: &AttributeDescription, values: Vec<Bytes>) {
        let mut deduped: Vec<Bytes> = Vec::with_capacity(values.len());
        for value in values {
            if !deduped.contains(&value) {
                deduped.push(value);
            }
        }
        if deduped.is_empty() {
            self.attributes.remove(attr);
        } else {
            self.attributes.insert(attr.clone(), deduped);
        }
    }

    /// User attributes, i.e. everything except the historical attribute.
    pub fn user_attributes(&self) -> impl Iterator<Item = (&AttributeDescription, &Vec<Bytes>)> {
        self.attributes.iter().filter(|(desc, _)| !desc.is_historical())
    }

    /// Raw values of the historical attribute.
    pub fn historical_values(&self) -> &[Bytes] {
        self.values(&AttributeDescription::historical())
    }
}

// ---------------------------------------------------------------------------
// Modifications
// ---------------------------------------------------------------------------

/// Kind of change applied to one attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModificationKind {
    /// Add the listed values.
    Add,
    /// Delete the listed values, or the whole attribute if none are listed.
    Delete,
    /// Replace all values with the listed ones.
    Replace,
}

/// One attribute change within a modify request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modification {
    /// Target attribute.
    pub attr: AttributeDescription,
    /// What to do.
    pub kind: ModificationKind,
    /// Values the change carries.
    pub values: Vec<Bytes>,
}

impl Modification {
    /// Build a modification from string values.
    pub fn new(kind: ModificationKind, attr: AttributeDescription, values: &[&str]) -> Self {
        Self {
            attr,
            kind,
            values: values
                .iter()
                .map(|v| Bytes::copy_from_slice(v.as_bytes()))
                .collect(),
        }
    }

    /// `add: attr` with the given values.
    pub fn add(attr: AttributeDescription, values: &[&str]) -> Self {
        Self::new(ModificationKind::Add, attr, values)
    }

    /// `delete: attr` with the given values (none deletes the attribute).
    pub fn delete(attr: AttributeDescription, values: &[&str]) -> Self {
        Self::new(ModificationKind::Delete, attr, values)
    }

    /// `replace: attr` with the given values.
    pub fn replace(attr: AttributeDescription, values: &[&str]) -> Self {
        Self::new(ModificationKind::Replace, attr, values)
    }
}
