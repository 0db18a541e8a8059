//! `burrowctl`: offline tooling for Burrow replication history.
//!
//! Operates on a JSON entry snapshot: inspect the history stored on an
//! entry, rebuild and replay the operations it encodes, and purge facts
//! older than the retention window.
//!
//! # Usage
//!
//! ```text
//! burrowctl status                                   # snapshot summary
//! burrowctl inspect "cn=alice,ou=people,o=example"    # values and history
//! burrowctl replay "cn=alice,ou=people,o=example"     # rebuilt operations
//! burrowctl replay --into rebuilt.json                # rebuild every entry elsewhere
//! burrowctl purge --dry-run --delay 12h               # what a pass would drop
//! burrowctl purge --watch                             # run the scheduler until Ctrl-C
//! burrowctl decode "description:<csn>:add:hello"      # parse one token
//! ```

mod config;
mod telemetry;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use burrow_historical::{
    EntryHistorical, HistoricalToken, ReplayOutcome, ReplicationDomain, UpdateMsg,
};
use burrow_purge::{PurgeReport, PurgeScheduler};
use burrow_store::{EntryLocks, EntryStore, MemoryEntryStore};
use burrow_types::{Dn, LogicalClock, SystemClock};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use config::{CliConfig, parse_duration};

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "burrowctl",
    version,
    about = "Inspect, replay and purge Burrow replication history"
)]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the entry snapshot path.
    #[arg(short, long, global = true, env = "BURROW_SNAPSHOT")]
    snapshot: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize the snapshot and the history it carries.
    Status,

    /// Show an entry's values and decoded history.
    Inspect {
        /// DN of the entry.
        dn: String,
    },

    /// Rebuild the operations encoded in entry history.
    Replay {
        /// DN of the entry. All entries when omitted.
        dn: Option<String>,

        /// Replay the rebuilt operations into this snapshot (created if
        /// missing) instead of printing them.
        #[arg(long)]
        into: Option<PathBuf>,

        /// Print messages as JSON lines.
        #[arg(long)]
        json: bool,
    },

    /// Drop history older than the retention window.
    Purge {
        /// Report what would be dropped without saving the snapshot.
        #[arg(long)]
        dry_run: bool,

        /// Override the configured retention window (e.g. "12h").
        #[arg(long)]
        delay: Option<String>,

        /// Keep running scheduled passes until Ctrl-C, then save.
        #[arg(long, conflicts_with = "dry_run")]
        watch: bool,
    },

    /// Parse a single historical token.
    Decode {
        /// The raw `ds-sync-hist` value.
        token: String,
    },
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.as_deref()).context("failed to load config")?;
    if let Some(snapshot) = cli.snapshot {
        config.store.snapshot = Some(snapshot);
    }

    telemetry::init(&config.log.level);

    match cli.command {
        Commands::Status => cmd_status(&config),
        Commands::Inspect { dn } => cmd_inspect(&config, &parse_dn(&dn)?),
        Commands::Replay { dn, into, json } => {
            let dn = dn.as_deref().map(parse_dn).transpose()?;
            cmd_replay(&config, dn.as_ref(), into.as_deref(), json)
        }
        Commands::Purge {
            dry_run,
            delay,
            watch,
        } => cmd_purge(&config, dry_run, delay.as_deref(), watch).await,
        Commands::Decode { token } => cmd_decode(&token),
    }
}

// -----------------------------------------------------------------------
// Commands
// -----------------------------------------------------------------------

fn cmd_status(config: &CliConfig) -> Result<()> {
    let path = config.snapshot_path();
    let store = load_store(&path)?;
    let entries = store.entries();

    let mut with_history = 0usize;
    let mut tokens = 0usize;
    let mut corrupt = 0usize;
    let mut oldest = None;
    let mut newest = None;
    for entry in &entries {
        if entry.historical_values().is_empty() {
            continue;
        }
        with_history += 1;
        tokens += entry.historical_values().len();
        match EntryHistorical::new_instance_from_entry(entry) {
            Ok(hist) => {
                oldest = min_opt(oldest, hist.oldest_csn());
                newest = newest.max(hist.latest_csn());
            }
            Err(e) => {
                warn!(dn = %entry.dn, error = %e, "undecodable history");
                corrupt += 1;
            }
        }
    }

    println!("Snapshot: {}", path.display());
    println!("Replica:  {} ({})", config.replica_id(), config.replica.base_dn);
    println!("Entries:  {}", entries.len());
    println!("  with history:    {with_history}");
    println!("  history values:  {tokens}");
    println!("  undecodable:     {corrupt}");
    if let (Some(oldest), Some(newest)) = (oldest, newest) {
        println!("Oldest change: {oldest} ({} ms)", oldest.timestamp);
        println!("Newest change: {newest} ({} ms)", newest.timestamp);
    }
    Ok(())
}

fn cmd_inspect(config: &CliConfig, dn: &Dn) -> Result<()> {
    let store = load_store(&config.snapshot_path())?;
    let entry = store
        .get(dn)?
        .with_context(|| format!("no entry at {dn}"))?;

    println!("dn: {}", entry.dn);
    println!("id: {}", entry.id);
    for (attr, values) in entry.user_attributes() {
        for value in values {
            println!("{attr}: {}", String::from_utf8_lossy(value));
        }
    }

    let hist = EntryHistorical::new_instance_from_entry(&entry)?;
    println!();
    println!("history ({} values):", entry.historical_values().len());
    for token in hist.tokens() {
        println!("  {token}");
    }
    if let Some(add) = hist.entry_add_csn() {
        println!("created: {add}");
    }
    if let Some(rename) = hist.entry_rename_csn() {
        println!("renamed: {rename}");
    }
    Ok(())
}

fn cmd_replay(config: &CliConfig, dn: Option<&Dn>, into: Option<&Path>, json: bool) -> Result<()> {
    let source = Arc::new(load_store(&config.snapshot_path())?);
    let source_domain = domain(config, source.clone())?;

    // Ancestors first so every rebuilt add finds its parent.
    let mut targets: Vec<Dn> = match dn {
        Some(dn) => vec![dn.clone()],
        None => source.entries().into_iter().map(|e| e.dn).collect(),
    };
    targets.sort_by_key(|dn| dn.rdns().len());

    let mut messages: Vec<UpdateMsg> = Vec::new();
    for dn in &targets {
        let replay = source_domain
            .generate_fake_operations(dn)
            .with_context(|| format!("failed to rebuild {dn}"))?;
        for anomaly in &replay.anomalies {
            warn!(dn = %dn, %anomaly, "history does not match entry values");
        }
        messages.extend(replay.operations.iter().map(|op| op.generate_message()));
    }
    info!(
        entries = targets.len(),
        messages = messages.len(),
        "rebuilt operations from history"
    );

    let Some(into) = into else {
        for msg in &messages {
            if json {
                println!("{}", serde_json::to_string(msg)?);
            } else {
                println!("{} {:<8} {}", msg.csn, msg.kind(), msg.dn);
            }
        }
        return Ok(());
    };

    let target = Arc::new(if into.exists() {
        load_store(into)?
    } else {
        MemoryEntryStore::new()
    });
    let target_domain = domain(config, target.clone())?;

    let (mut applied, mut ignored) = (0usize, 0usize);
    for msg in &messages {
        match target_domain.replay(msg)? {
            ReplayOutcome::Applied(_) => applied += 1,
            ReplayOutcome::Ignored(reason) => {
                debug!(dn = %msg.dn, csn = %msg.csn, ?reason, "replayed message ignored");
                ignored += 1;
            }
        }
    }
    save_store(&target, into)?;
    println!(
        "Replayed {} messages into {}: {applied} applied, {ignored} ignored",
        messages.len(),
        into.display()
    );
    Ok(())
}

async fn cmd_purge(
    config: &CliConfig,
    dry_run: bool,
    delay: Option<&str>,
    watch_mode: bool,
) -> Result<()> {
    let path = config.snapshot_path();
    let store = Arc::new(load_store(&path)?);

    let mut purge_config = config.purge_config()?;
    if let Some(delay) = delay {
        purge_config.delay = parse_duration(delay)?;
    }
    if !watch_mode {
        // A one-shot run always finishes the store.
        purge_config.max_duration = None;
    }

    let scheduler = Arc::new(PurgeScheduler::new(
        store.clone(),
        Arc::new(EntryLocks::new()),
        Arc::new(SystemClock),
        purge_config,
    ));

    if watch_mode {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run(shutdown_rx).await })
        };

        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl-C")?;
        info!("shutting down purge scheduler");
        let _ = shutdown_tx.send(true);
        task.await.context("purge scheduler task failed")?;

        save_store(&store, &path)?;
        println!(
            "Purged {} history values in {} passes",
            scheduler.total_purged(),
            scheduler.passes()
        );
        return Ok(());
    }

    let report = scheduler.purge_pass()?;
    print_report(&report);
    if dry_run {
        println!("Dry run: snapshot left unchanged");
    } else if report.values_purged > 0 {
        save_store(&store, &path)?;
    }
    Ok(())
}

fn cmd_decode(token: &str) -> Result<()> {
    let token = HistoricalToken::decode(token.as_bytes())?;
    let csn = token.csn();
    println!("{token}");
    println!("  csn:       {csn}");
    println!("  timestamp: {}", csn.timestamp);
    println!("  sequence:  {}", csn.sequence);
    println!("  replica:   {}", csn.replica_id);
    if let HistoricalToken::Attribute { attr, kind, value, .. } = &token {
        println!("  attribute: {attr}");
        println!("  kind:      {kind:?}");
        if let Some(value) = value {
            println!("  value:     {}", String::from_utf8_lossy(value));
        }
    }
    Ok(())
}

// -----------------------------------------------------------------------
// Helpers
// -----------------------------------------------------------------------

fn parse_dn(s: &str) -> Result<Dn> {
    s.parse().with_context(|| format!("invalid DN {s:?}"))
}

fn load_store(path: &Path) -> Result<MemoryEntryStore> {
    if !path.exists() {
        bail!("snapshot {} does not exist", path.display());
    }
    MemoryEntryStore::load_snapshot(path)
        .with_context(|| format!("failed to load snapshot {}", path.display()))
}

fn save_store(store: &MemoryEntryStore, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    store
        .save_snapshot(path)
        .with_context(|| format!("failed to save snapshot {}", path.display()))
}

fn domain(config: &CliConfig, store: Arc<MemoryEntryStore>) -> Result<ReplicationDomain> {
    Ok(ReplicationDomain::new(
        config.base_dn()?,
        LogicalClock::new(config.replica_id()),
        store,
        Arc::new(EntryLocks::new()),
        Arc::new(config.schema()),
    ))
}

fn print_report(report: &PurgeReport) {
    println!("Entries scanned:  {}", report.entries_scanned);
    println!("Entries purged:   {}", report.entries_purged);
    println!("Values purged:    {}", report.values_purged);
    for skipped in &report.skipped {
        println!("Skipped {}: {}", skipped.entry_id, skipped.reason);
    }
}

fn min_opt<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}
