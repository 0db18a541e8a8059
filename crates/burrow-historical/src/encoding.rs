//! Text form of historical facts.
//!
//! Each fact is one value of the `ds-sync-hist` attribute:
//!
//! ```text
//! description:0000019123456789000300000000:add:first value
//! description:0000019123456789000300000001:del::AAEC
//! displayname:0000019123456789000300000002:repl:Smith
//! telephonenumber:0000019123456789000300000003:attrDel
//! dn:0000019123456789000300000000:add
//! dn:0000019123456789000300000004:moddn
//! ```
//!
//! Values that are not UTF-8, contain a line break, or begin with `:` are
//! written as `::` followed by standard base64.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use burrow_types::{AttributeDescription, Csn};

use crate::error::HistoricalError;

/// Attribute slot used for entry-level facts.
pub(crate) const ENTRY_SLOT: &str = "dn";

/// Kind of a per-attribute fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    /// A value was added.
    Add,
    /// A value was deleted.
    Delete,
    /// A value was asserted by a replace.
    Replace,
    /// The attribute was replaced with nothing or deleted as a whole.
    DeleteAttribute,
}

impl TokenKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Delete => "del",
            Self::Replace => "repl",
            Self::DeleteAttribute => "attrDel",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "add" => Some(Self::Add),
            "del" => Some(Self::Delete),
            "repl" => Some(Self::Replace),
            "attrDel" => Some(Self::DeleteAttribute),
            _ => None,
        }
    }
}

/// One decoded historical fact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoricalToken {
    /// The entry was created.
    EntryAdd(Csn),
    /// The entry was renamed or moved.
    EntryRename(Csn),
    /// A fact about one attribute.
    Attribute {
        /// Attribute description.
        attr: AttributeDescription,
        /// When it happened.
        csn: Csn,
        /// What happened.
        kind: TokenKind,
        /// The value; `None` exactly for [`TokenKind::DeleteAttribute`].
        value: Option<Bytes>,
    },
}

impl HistoricalToken {
    /// The CSN carried by the fact.
    pub fn csn(&self) -> Csn {
        match self {
            Self::EntryAdd(csn) | Self::EntryRename(csn) => *csn,
            Self::Attribute { csn, .. } => *csn,
        }
    }

    /// Serialize as an attribute value.
    pub fn encode(&self) -> Bytes {
        Bytes::from(self.to_string())
    }

    /// Parse one attribute value.
    pub fn decode(raw: &[u8]) -> Result<Self, HistoricalError> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| HistoricalError::decode(raw, "not valid UTF-8"))?;

        let mut fields = text.splitn(4, ':');
        let slot = fields.next().unwrap_or_default();
        let csn_text = fields
            .next()
            .ok_or_else(|| HistoricalError::decode(raw, "missing CSN"))?;
        let kind_text = fields
            .next()
            .ok_or_else(|| HistoricalError::decode(raw, "missing change kind"))?;
        let value_text = fields.next();

        let csn: Csn = csn_text
            .parse()
            .map_err(|e: burrow_types::CsnParseError| HistoricalError::decode(raw, e.reason))?;

        if slot == ENTRY_SLOT {
            if value_text.is_some() {
                return Err(HistoricalError::decode(raw, "entry fact carries a value"));
            }
            return match kind_text {
                "add" => Ok(Self::EntryAdd(csn)),
                "moddn" => Ok(Self::EntryRename(csn)),
                other => Err(HistoricalError::decode(
                    raw,
                    format!("unknown entry fact {other:?}"),
                )),
            };
        }

        let attr: AttributeDescription = slot
            .parse()
            .map_err(|reason: String| HistoricalError::decode(raw, reason))?;
        let kind = TokenKind::parse(kind_text).ok_or_else(|| {
            HistoricalError::decode(raw, format!("unknown change kind {kind_text:?}"))
        })?;

        let value = match (kind, value_text) {
            (TokenKind::DeleteAttribute, None) => None,
            (TokenKind::DeleteAttribute, Some(_)) => {
                return Err(HistoricalError::decode(raw, "attrDel carries a value"));
            }
            (_, None) => return Err(HistoricalError::decode(raw, "missing value")),
            (_, Some(v)) => Some(decode_value(raw, v)?),
        };

        Ok(Self::Attribute {
            attr,
            csn,
            kind,
            value,
        })
    }
}

impl fmt::Display for HistoricalToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EntryAdd(csn) => write!(f, "{ENTRY_SLOT}:{csn}:add"),
            Self::EntryRename(csn) => write!(f, "{ENTRY_SLOT}:{csn}:moddn"),
            Self::Attribute {
                attr,
                csn,
                kind,
                value,
            } => {
                write!(f, "{attr}:{csn}:{}", kind.as_str())?;
                if let Some(value) = value {
                    write!(f, ":{}", encode_value(value))?;
                }
                Ok(())
            }
        }
    }
}

fn encode_value(value: &[u8]) -> String {
    match std::str::from_utf8(value) {
        Ok(text) if !needs_base64(text) => text.to_string(),
        _ => format!(":{}", BASE64.encode(value)),
    }
}

fn needs_base64(text: &str) -> bool {
    text.starts_with(':') || text.contains(['\n', '\r'])
}

fn decode_value(raw: &[u8], text: &str) -> Result<Bytes, HistoricalError> {
    match text.strip_prefix(':') {
        Some(encoded) => BASE64
            .decode(encoded)
            .map(Bytes::from)
            .map_err(|e| HistoricalError::decode(raw, format!("bad base64 value: {e}"))),
        None => Ok(Bytes::copy_from_slice(text.as_bytes())),
    }
}
