//! Purging of expired replication history.
//!
//! - [`PurgeScheduler`] walks the entry store, drops historical facts older
//!   than the retention window and rewrites the affected entries. Passes can
//!   be bounded in duration and resume where the previous one stopped.
//! - [`PurgeHandle`] triggers an immediate pass on a running scheduler.

pub mod error;
pub mod scheduler;

pub use error::PurgeError;
pub use scheduler::{PurgeConfig, PurgeHandle, PurgeReport, PurgeScheduler, SkippedEntry};
