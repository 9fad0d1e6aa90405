#![deny(missing_docs)]
//! Compaction core for a leveled LSM key-value storage engine.
//!
//! This crate owns the background half of the write path: it flushes frozen
//! in-memory write buffers into sorted tables and merges tables between
//! adjacent on-disk levels, discarding obsolete versions and tombstones.
//! Everything else (the memtable, the table encoder/decoder, the version
//! set or "session", the journal) is consumed through trait seams, so the
//! core can be exercised and tested against in-memory collaborators.
//!
//! The moving parts:
//! - Two long-lived dispatch loops (memtable flush and table compaction)
//!   consuming command channels, plus a dedicated error-state task.
//! - A transact runner that retries each compaction step with backoff,
//!   rolls back half-written state on abort, and publishes every outcome to
//!   the error-state task.
//! - A merge rewrite with per-user-key suppression, bounded output tables,
//!   and a resume snapshot so a retried merge never restructures the
//!   outputs a previous attempt already finished.
//!
//! The crate never installs a tracing subscriber; applications configure
//! one themselves. [`CompactionCore::spawn`] must be called from within a
//! tokio runtime.

pub mod compaction;
pub mod db;
pub mod error;
pub mod key;
mod observability;
pub mod option;
pub mod session;
pub mod table;

#[cfg(test)]
mod test_util;
#[cfg(test)]
mod tests_internal;

pub use compaction::{CompactionCore, CompactionHandle, CompactionStats, LevelStats};
pub use error::Error;
pub use option::Options;
