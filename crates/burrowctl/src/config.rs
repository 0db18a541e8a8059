//! TOML configuration for `burrowctl`.
//!
//! Every section is optional; a missing file means all defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use burrow_purge::PurgeConfig;
use burrow_types::{Dn, ReplicaId, SchemaMap};
use serde::Deserialize;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Replica identity and suffix.
    pub replica: ReplicaSection,
    /// Attribute schema.
    pub schema: SchemaSection,
    /// History retention.
    pub purge: PurgeSection,
    /// Entry snapshot location.
    pub store: StoreSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[replica]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ReplicaSection {
    /// Replica id stamped into CSNs issued by this tool.
    pub id: u16,
    /// Suffix DN of the replicated subtree.
    pub base_dn: String,
}

impl Default for ReplicaSection {
    fn default() -> Self {
        Self {
            id: 1,
            base_dn: "o=example".to_string(),
        }
    }
}

/// `[schema]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SchemaSection {
    /// Single-valued attribute names. When empty, the built-in
    /// inetOrgPerson/posix list is used.
    pub single_valued: Vec<String>,
}

/// `[purge]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PurgeSection {
    /// Retention window (e.g. `"1d"`, `"12h"`).
    pub delay: String,
    /// Time between background passes.
    pub interval: String,
    /// Wall-time budget of one pass. Empty means unbounded.
    pub max_duration: String,
}

impl Default for PurgeSection {
    fn default() -> Self {
        Self {
            delay: "1d".to_string(),
            interval: "1h".to_string(),
            max_duration: "1h".to_string(),
        }
    }
}

/// `[store]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// JSON entry snapshot. Defaults to `~/.burrow/entries.json`.
    pub snapshot: Option<PathBuf>,
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CliConfig {
    /// Load config from a TOML file, or use defaults if no path given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("failed to read {}", p.display()))?;
                let config: CliConfig = toml::from_str(&content)?;
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse config from a TOML string (used in tests).
    #[cfg(test)]
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Effective replica id.
    pub fn replica_id(&self) -> ReplicaId {
        ReplicaId(self.replica.id)
    }

    /// Parsed suffix DN.
    pub fn base_dn(&self) -> anyhow::Result<Dn> {
        self.replica
            .base_dn
            .parse()
            .with_context(|| format!("invalid base_dn {:?}", self.replica.base_dn))
    }

    /// Effective schema.
    pub fn schema(&self) -> SchemaMap {
        if self.schema.single_valued.is_empty() {
            SchemaMap::default()
        } else {
            SchemaMap::with_single_valued(&self.schema.single_valued)
        }
    }

    /// Effective snapshot path.
    pub fn snapshot_path(&self) -> PathBuf {
        self.store.snapshot.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .map(|h| h.join(".burrow"))
                .unwrap_or_else(|| PathBuf::from(".burrow"))
                .join("entries.json")
        })
    }

    /// Purge scheduling built from the `[purge]` section.
    pub fn purge_config(&self) -> anyhow::Result<PurgeConfig> {
        let max_duration = if self.purge.max_duration.trim().is_empty() {
            None
        } else {
            Some(parse_duration(&self.purge.max_duration)?)
        };
        Ok(PurgeConfig {
            delay: parse_duration(&self.purge.delay)?,
            interval: parse_duration(&self.purge.interval)?,
            max_duration,
        })
    }
}

/// Parse a human-readable duration string.
///
/// Supports: `"500ms"`, `"30s"`, `"5m"`, `"2h"`, `"1d"`, `"1500"` (raw
/// milliseconds).
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    let (num, unit_ms) = if let Some(num) = s.strip_suffix("ms") {
        (num, 1)
    } else if let Some(num) = s.strip_suffix('s') {
        (num, 1_000)
    } else if let Some(num) = s.strip_suffix('m') {
        (num, 60_000)
    } else if let Some(num) = s.strip_suffix('h') {
        (num, 3_600_000)
    } else if let Some(num) = s.strip_suffix('d') {
        (num, 86_400_000)
    } else {
        (s, 1)
    };

    let Ok(value) = num.trim().parse::<u64>() else {
        bail!("invalid duration {s:?}");
    };
    let Some(ms) = value.checked_mul(unit_ms) else {
        bail!("duration {s:?} is out of range");
    };
    Ok(Duration::from_millis(ms))
}
