//! Per-level compaction statistics.

use std::{
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

/// Accumulates one compaction's contribution before its commit succeeds.
#[derive(Debug, Default)]
pub(crate) struct StatsStaging {
    start: Option<Instant>,
    pub(crate) duration: Duration,
    pub(crate) read: u64,
    pub(crate) write: u64,
}

impl StatsStaging {
    pub(crate) fn start_timer(&mut self) {
        if self.start.is_none() {
            self.start = Some(Instant::now());
        }
    }

    pub(crate) fn stop_timer(&mut self) {
        if let Some(start) = self.start.take() {
            self.duration += start.elapsed();
        }
    }
}

/// Snapshot of one level's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LevelStats {
    /// Wall-clock time spent compacting into this level.
    pub duration: Duration,
    /// Bytes read from input tables.
    pub bytes_read: u64,
    /// Bytes written to output tables.
    pub bytes_written: u64,
}

/// Per-level compaction counters, contributed after successful commits.
#[derive(Debug)]
pub struct CompactionStats {
    levels: Vec<Mutex<LevelStats>>,
}

impl CompactionStats {
    pub(crate) fn new(num_levels: usize) -> Self {
        Self {
            levels: (0..num_levels).map(|_| Mutex::default()).collect(),
        }
    }

    pub(crate) fn add(&self, level: usize, staging: &StatsStaging) {
        if let Some(slot) = self.levels.get(level) {
            let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
            guard.duration += staging.duration;
            guard.bytes_read += staging.read;
            guard.bytes_written += staging.write;
        }
    }

    /// The counters accumulated for `level`. Levels beyond the configured
    /// range read as zero.
    pub fn get(&self, level: usize) -> LevelStats {
        self.levels
            .get(level)
            .map(|slot| *slot.lock().unwrap_or_else(PoisonError::into_inner))
            .unwrap_or_default()
    }
}
