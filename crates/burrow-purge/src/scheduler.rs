//! Purge scheduler: periodically rewrites entries whose history holds facts
//! older than the retention window.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use burrow_historical::EntryHistorical;
use burrow_store::{EntryLocks, EntryStore};
use burrow_types::{Clock, EntryId};
use tokio::sync::{Notify, watch};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::error::PurgeError;

/// Purge scheduling parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeConfig {
    /// Facts older than `now - delay` are dropped.
    pub delay: Duration,
    /// Time between scheduled passes.
    pub interval: Duration,
    /// Wall-time budget of one pass. An exhausted pass stops after the
    /// current entry and the next pass resumes behind it.
    pub max_duration: Option<Duration>,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(24 * 60 * 60),
            interval: Duration::from_secs(60 * 60),
            max_duration: Some(Duration::from_secs(60 * 60)),
        }
    }
}

/// An entry a pass could not purge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    /// The entry.
    pub entry_id: EntryId,
    /// What went wrong.
    pub reason: String,
}

/// Summary of one purge pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Entries examined.
    pub entries_scanned: u64,
    /// Entries rewritten because they lost facts.
    pub entries_purged: u64,
    /// Facts removed across all entries.
    pub values_purged: u64,
    /// Entries left untouched because of an error.
    pub skipped: Vec<SkippedEntry>,
    /// Whether the pass reached the end of the store.
    pub completed: bool,
    /// Where the next pass resumes, if this one stopped early.
    pub resume_after: Option<EntryId>,
}

/// Triggers passes on a running [`PurgeScheduler`].
#[derive(Debug, Clone)]
pub struct PurgeHandle {
    trigger: Arc<Notify>,
}

impl PurgeHandle {
    /// Ask for a pass now instead of waiting for the next tick.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }
}

/// Walks the entry store and drops expired history.
pub struct PurgeScheduler {
    store: Arc<dyn EntryStore>,
    locks: Arc<EntryLocks>,
    clock: Arc<dyn Clock>,
    config: PurgeConfig,
    /// Highest wall-clock reading used by any pass, so the purge horizon
    /// never moves backwards.
    last_now: AtomicU64,
    /// Last entry processed by an interrupted pass.
    cursor: Mutex<Option<EntryId>>,
    /// Facts removed since the scheduler was created.
    total_purged: AtomicU64,
    /// Passes run since the scheduler was created.
    passes: AtomicU64,
    trigger: Arc<Notify>,
}

impl PurgeScheduler {
    /// Create a scheduler over `store`, taking the per-entry lock from
    /// `locks` for every rewrite.
    pub fn new(
        store: Arc<dyn EntryStore>,
        locks: Arc<EntryLocks>,
        clock: Arc<dyn Clock>,
        config: PurgeConfig,
    ) -> Self {
        Self {
            store,
            locks,
            clock,
            config,
            last_now: AtomicU64::new(0),
            cursor: Mutex::new(None),
            total_purged: AtomicU64::new(0),
            passes: AtomicU64::new(0),
            trigger: Arc::new(Notify::new()),
        }
    }

    /// The scheduling parameters.
    pub fn config(&self) -> &PurgeConfig {
        &self.config
    }

    /// A handle that triggers passes.
    pub fn handle(&self) -> PurgeHandle {
        PurgeHandle {
            trigger: self.trigger.clone(),
        }
    }

    /// Facts removed since the scheduler was created.
    pub fn total_purged(&self) -> u64 {
        self.total_purged.load(Ordering::Relaxed)
    }

    /// Passes run since the scheduler was created.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Where the next pass resumes, if the last one was interrupted.
    pub fn resume_cursor(&self) -> Option<EntryId> {
        *self.cursor.lock().expect("cursor lock poisoned")
    }

    /// Run passes on every tick or trigger until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            delay_ms = self.config.delay.as_millis() as u64,
            interval_ms = self.config.interval.as_millis() as u64,
            "purge scheduler started"
        );
        let mut tick = interval(self.config.interval);

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = self.trigger.notified() => {
                    debug!("purge pass triggered");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if let Err(e) = self.purge_pass() {
                error!(error = %e, "purge pass failed");
            }
        }

        info!(total_purged = self.total_purged(), "purge scheduler stopped");
    }

    /// Run one pass over the store.
    ///
    /// Every entry with expired facts is rewritten under its entry lock.
    /// Entries that fail to decode or store are skipped and reported; the
    /// pass continues with the next one.
    pub fn purge_pass(&self) -> Result<PurgeReport, PurgeError> {
        let started = Instant::now();
        let now = self.monotonic_now();
        let resume_after = self.cursor.lock().expect("cursor lock poisoned").take();

        let mut report = PurgeReport::default();
        let mut ids = self.store.list_ids()?;
        ids.sort();
        if let Some(after) = resume_after {
            ids.retain(|id| *id > after);
            debug!(%after, remaining = ids.len(), "resuming interrupted purge pass");
        }

        let total = ids.len();
        for (i, id) in ids.into_iter().enumerate() {
            report.entries_scanned += 1;
            match self.purge_entry(id, now) {
                Ok(0) => {}
                Ok(purged) => {
                    report.entries_purged += 1;
                    report.values_purged += purged as u64;
                }
                Err(reason) => {
                    warn!(entry_id = %id, %reason, "skipping entry during purge");
                    report.skipped.push(SkippedEntry {
                        entry_id: id,
                        reason,
                    });
                }
            }

            let out_of_time = self
                .config
                .max_duration
                .is_some_and(|budget| started.elapsed() >= budget);
            if out_of_time && i + 1 < total {
                report.resume_after = Some(id);
                *self.cursor.lock().expect("cursor lock poisoned") = Some(id);
                break;
            }
        }
        report.completed = report.resume_after.is_none();

        self.total_purged
            .fetch_add(report.values_purged, Ordering::Relaxed);
        self.passes.fetch_add(1, Ordering::Relaxed);

        info!(
            scanned = report.entries_scanned,
            purged_entries = report.entries_purged,
            purged_values = report.values_purged,
            skipped = report.skipped.len(),
            completed = report.completed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "purge pass finished"
        );
        Ok(report)
    }

    /// Purge one entry. Returns the number of facts removed.
    fn purge_entry(&self, id: EntryId, now: u64) -> Result<usize, String> {
        let _guard = self.locks.lock(id);

        let Some(mut entry) = self.store.get_by_id(&id).map_err(|e| e.to_string())? else {
            // Deleted since the listing.
            return Ok(0);
        };
        if entry.historical_values().is_empty() {
            return Ok(0);
        }

        let mut hist =
            EntryHistorical::new_instance_from_entry(&entry).map_err(|e| e.to_string())?;
        hist.set_purge_delay(self.config.delay);
        let encoded = hist.encode_and_purge_at(now);
        let purged = hist.last_purged_values_count();
        if purged == 0 {
            return Ok(0);
        }

        EntryHistorical::store_encoded(&mut entry, encoded);
        self.store.put(entry).map_err(|e| e.to_string())?;
        debug!(entry_id = %id, purged, "purged entry history");
        Ok(purged)
    }

    fn monotonic_now(&self) -> u64 {
        let wall = self.clock.now_ms();
        let previous = self.last_now.fetch_max(wall, Ordering::SeqCst);
        previous.max(wall)
    }
}
