//! Structured log events for the compaction subsystem.
//!
//! Everything the core logs flows through two thin macros over `tracing`,
//! pinned to a single target so an embedder can route or silence the
//! crate's events wholesale. Call sites name their `event` in snake_case
//! and tag the owning `component`; subscriber setup is left entirely to
//! the application.

/// Log target shared by every event the crate emits.
pub(crate) const TARGET: &str = "strata";

/// Record a routine state change: a flush or compaction committed, an
/// output table finished, a trivial move.
macro_rules! log_info {
    ($($field:tt)*) => {
        ::tracing::info!(target: $crate::observability::TARGET, $($field)*)
    };
}

/// Record a failure the subsystem survives or latches: a retried step, a
/// rollback, a persistent error taking the write lock.
macro_rules! log_warn {
    ($($field:tt)*) => {
        ::tracing::warn!(target: $crate::observability::TARGET, $($field)*)
    };
}

pub(crate) use {log_info, log_warn};
