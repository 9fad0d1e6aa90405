//! Retrying execution of compaction steps.
//!
//! Every compaction step (flush, merge, commit, trivial move) runs under
//! [`CompactionCore::transact`], which retries transient failures with
//! backoff, publishes every outcome to the error loop, and aborts with the
//! [`Exiting`] sentinel on shutdown, corruption, or a latched persistent
//! error. Rollback runs once, at abort, before the sentinel propagates.

use std::{future::Future, time::Duration};

use crate::{
    compaction::{stats::StatsStaging, CompactionCore, Exiting},
    error::Error,
    observability::{log_info, log_warn},
    session::SessionRecord,
};

const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(8);

/// Count of useful work units performed by one step attempt. A step that
/// advances this between failures proves the system is making progress, so
/// the runner resets its backoff.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Progress(u64);

impl Progress {
    pub(crate) fn incr(&mut self) {
        self.0 += 1;
    }

    pub(crate) fn get(self) -> u64 {
        self.0
    }
}

/// One retryable compaction step.
pub(crate) trait TransactStep: Send {
    /// Attempt the step once, incrementing `progress` per unit of work.
    fn exec(&mut self, progress: &mut Progress) -> impl Future<Output = Result<(), Error>> + Send;

    /// Undo half-written state after an aborted step.
    fn rollback(&mut self) -> impl Future<Output = Result<(), Error>> + Send;

    /// Whether [`rollback`](TransactStep::rollback) has any effect.
    fn has_rollback(&self) -> bool {
        false
    }
}

impl CompactionCore {
    /// Run `step` until it succeeds, or abort with [`Exiting`].
    pub(crate) async fn transact<S: TransactStep>(
        &self,
        name: &str,
        step: &mut S,
    ) -> Result<(), Exiting> {
        let disable_backoff = self.session.options().disable_compaction_backoff;
        let mut backoff = BACKOFF_MIN;
        let mut last_progress = Progress::default();
        let mut attempt = 0u64;
        loop {
            if self.is_closed() {
                log_info!(
                    component = "compaction",
                    event = "transact_exiting",
                    name,
                    reason = "closed",
                );
                return self.abort(name, step).await;
            } else if attempt > 0 {
                log_info!(
                    component = "compaction",
                    event = "transact_retry",
                    name,
                    attempt,
                );
            }
            attempt += 1;

            let mut progress = Progress::default();
            let result = step.exec(&mut progress).await;
            if let Err(err) = &result {
                log_warn!(
                    component = "compaction",
                    event = "transact_error",
                    name,
                    records = progress.get(),
                    error = %err,
                );
            }

            // Publish the outcome. Whichever of {ingress send, persistent
            // error drained, shutdown} wins decides the next action.
            tokio::select! {
                biased;
                _ = self.shutdown.wait() => {
                    log_info!(
                        component = "compaction",
                        event = "transact_exiting",
                        name,
                        reason = "closed",
                    );
                    return self.abort(name, step).await;
                }
                perr = self.chans.per_err_rx.recv_async() => {
                    if result.is_err() {
                        if let Ok(perr) = perr {
                            log_info!(
                                component = "compaction",
                                event = "transact_exiting",
                                name,
                                reason = "persistent",
                                error = %perr,
                            );
                        }
                        return self.abort(name, step).await;
                    }
                }
                r = self.chans.err_set_tx.send_async(result.as_ref().err().cloned()) => {
                    let _ = r;
                }
            }

            let err = match result {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            if err.is_corrupted() {
                log_warn!(
                    component = "compaction",
                    event = "transact_exiting",
                    name,
                    reason = "corruption",
                    error = %err,
                );
                return self.abort(name, step).await;
            }

            if !disable_backoff {
                if progress > last_progress {
                    backoff = BACKOFF_MIN;
                    last_progress = progress;
                }
                tokio::select! {
                    biased;
                    _ = self.shutdown.wait() => {
                        log_info!(
                            component = "compaction",
                            event = "transact_exiting",
                            name,
                            reason = "closed",
                        );
                        return self.abort(name, step).await;
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
                if backoff < BACKOFF_MAX {
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
            }
        }
    }

    async fn abort<S: TransactStep>(&self, name: &str, step: &mut S) -> Result<(), Exiting> {
        if step.has_rollback() {
            if let Err(err) = step.rollback().await {
                log_warn!(
                    component = "compaction",
                    event = "rollback_failed",
                    name,
                    error = %err,
                );
            }
        }
        Err(Exiting)
    }
}

/// Commits a staged session record; shared by the flush, move, and merge
/// paths. Commits are atomic at the session layer, so there is nothing to
/// roll back.
pub(crate) struct RecCommitStep<'a> {
    core: &'a CompactionCore,
    rec: &'a SessionRecord,
    stats: Option<&'a mut StatsStaging>,
}

impl<'a> RecCommitStep<'a> {
    pub(crate) fn new(
        core: &'a CompactionCore,
        rec: &'a SessionRecord,
        stats: Option<&'a mut StatsStaging>,
    ) -> Self {
        Self { core, rec, stats }
    }
}

impl TransactStep for RecCommitStep<'_> {
    async fn exec(&mut self, _progress: &mut Progress) -> Result<(), Error> {
        if let Some(stats) = self.stats.as_deref_mut() {
            stats.start_timer();
        }
        let result = self.core.session.commit(self.rec);
        if let Some(stats) = self.stats.as_deref_mut() {
            stats.stop_timer();
        }
        result
    }

    async fn rollback(&mut self) -> Result<(), Error> {
        Ok(())
    }
}
