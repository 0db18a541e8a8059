//! Distinguished names.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error returned when a DN string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid DN {input:?}: {reason}")]
pub struct DnParseError {
    /// The rejected input.
    pub input: String,
    /// What was wrong with it.
    pub reason: &'static str,
}

/// Relative distinguished name: one `attr=value` component of a DN.
///
/// The attribute type is stored lower-cased. Values keep their case but
/// compare case-insensitively.
#[derive(Clone, Serialize, Deserialize)]
pub struct Rdn {
    attr: String,
    value: String,
}

impl Rdn {
    /// Create an RDN from an attribute type and value.
    pub fn new(attr: &str, value: &str) -> Self {
        Self {
            attr: attr.trim().to_ascii_lowercase(),
            value: value.to_string(),
        }
    }

    /// The attribute type (lower-cased).
    pub fn attr(&self) -> &str {
        &self.attr
    }

    /// The attribute value as written.
    pub fn value(&self) -> &str {
        &self.value
    }

    fn normalized_value(&self) -> String {
        self.value.to_lowercase()
    }
}

impl PartialEq for Rdn {
    fn eq(&self, other: &Self) -> bool {
        self.attr == other.attr && self.normalized_value() == other.normalized_value()
    }
}

impl Eq for Rdn {}

impl Hash for Rdn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.attr.hash(state);
        self.normalized_value().hash(state);
    }
}

impl PartialOrd for Rdn {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Rdn {
    fn cmp(&self, other: &Self) -> Ordering {
        self.attr
            .cmp(&other.attr)
            .then_with(|| self.normalized_value().cmp(&other.normalized_value()))
    }
}

impl fmt::Display for Rdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=", self.attr)?;
        for c in self.value.chars() {
            if matches!(c, ',' | '\\' | '=' | '+') {
                write!(f, "\\")?;
            }
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Rdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rdn({self})")
    }
}

impl FromStr for Rdn {
    type Err = DnParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| DnParseError {
            input: s.to_string(),
            reason,
        };

        let parts = split_unescaped(s, '=');
        if parts.len() < 2 {
            return Err(err("RDN is missing '='"));
        }

        let attr = parts[0].trim();
        if attr.is_empty() {
            return Err(err("RDN has an empty attribute type"));
        }

        // Anything after the first unescaped '=' belongs to the value.
        let raw_value = &s[parts[0].len() + 1..];
        let value = unescape(raw_value.trim());
        if value.is_empty() {
            return Err(err("RDN has an empty value"));
        }

        Ok(Rdn::new(attr, &value))
    }
}

/// A distinguished name, stored leaf first (`cn=a,o=test` is `[cn=a, o=test]`).
///
/// The empty DN is the root of the tree.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(try_from = "String", into = "String")]
pub struct Dn(Vec<Rdn>);

impl Dn {
    /// The root DN.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Whether this is the root DN.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// The leaf RDN, `None` for the root.
    pub fn rdn(&self) -> Option<&Rdn> {
        self.0.first()
    }

    /// All RDNs, leaf first.
    pub fn rdns(&self) -> &[Rdn] {
        &self.0
    }

    /// The parent DN, `None` for the root.
    pub fn parent(&self) -> Option<Dn> {
        if self.0.is_empty() {
            None
        } else {
            Some(Dn(self.0[1..].to_vec()))
        }
    }

    /// A child of this DN with the given leaf RDN.
    pub fn child(&self, rdn: Rdn) -> Dn {
        let mut rdns = Vec::with_capacity(self.0.len() + 1);
        rdns.push(rdn);
        rdns.extend(self.0.iter().cloned());
        Dn(rdns)
    }

    /// Whether `self` lies strictly below `ancestor`.
    pub fn is_descendant_of(&self, ancestor: &Dn) -> bool {
        self.0.len() > ancestor.0.len() && self.0.ends_with(&ancestor.0)
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, rdn) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{rdn}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dn({self})")
    }
}

impl FromStr for Dn {
    type Err = DnParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Ok(Dn::root());
        }

        let rdns = split_unescaped(s, ',')
            .into_iter()
            .map(|part| {
                part.parse::<Rdn>().map_err(|e| DnParseError {
                    input: s.to_string(),
                    reason: e.reason,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Dn(rdns))
    }
}

impl TryFrom<String> for Dn {
    type Error = DnParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Dn> for String {
    fn from(dn: Dn) -> Self {
        dn.to_string()
    }
}

/// Split on `sep` wherever it is not preceded by a backslash escape.
fn split_unescaped(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;

    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == sep {
            parts.push(&s[start..i]);
            start = i + c.len_utf8();
        }
    }
    parts.push(&s[start..]);
    parts
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}
