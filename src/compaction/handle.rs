//! Writer-facing handle over the compaction subsystem.

use std::sync::Arc;

use bytes::Bytes;
use flume::{Receiver, Sender};
use tokio::task::JoinHandle;

use crate::{
    compaction::{stats::CompactionStats, Cmd, CmdAck, CompactionCore},
    error::Error,
};

/// Handle to the background compaction tasks.
///
/// Returned by [`CompactionCore::spawn`]. Dropping the handle signals
/// shutdown; the tasks observe it at their next suspension point and exit.
/// [`close`](CompactionHandle::close) additionally waits for them.
pub struct CompactionHandle {
    core: Arc<CompactionCore>,
    shutdown_tx: Option<Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl CompactionHandle {
    pub(crate) fn new(
        core: Arc<CompactionCore>,
        shutdown_tx: Sender<()>,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            core,
            shutdown_tx: Some(shutdown_tx),
            tasks,
        }
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &Arc<CompactionCore> {
        &self.core
    }

    /// Flush the frozen memtable and wait for its commit.
    ///
    /// Fails fast with the current transient error if the subsystem is
    /// unhealthy, and with [`Error::Closed`] on shutdown.
    pub async fn flush_mem(&self) -> Result<(), Error> {
        self.send_and_wait(&self.core.chans.mcomp_cmd_tx, |ack| Cmd::Idle { ack })
            .await
    }

    /// Wait until every table compaction pending at the time of the call
    /// has run (idle = quiescent).
    pub async fn wait_table_idle(&self) -> Result<(), Error> {
        self.send_and_wait(&self.core.chans.tcomp_cmd_tx, |ack| Cmd::Idle { ack })
            .await
    }

    /// Nudge the table loop to reassess whether a compaction is needed.
    /// Non-blocking: the wake is dropped if the loop is not ready for it.
    pub fn trigger_table(&self) {
        let _ = self.core.chans.tcomp_cmd_tx.try_send(Cmd::Trigger);
    }

    /// Compact every table intersecting `[umin, umax]` at `level`, or at
    /// every overlapped level when `level` is `None`, and wait for
    /// completion.
    pub async fn compact_range(
        &self,
        level: Option<usize>,
        umin: impl Into<Bytes>,
        umax: impl Into<Bytes>,
    ) -> Result<(), Error> {
        let umin = umin.into();
        let umax = umax.into();
        self.send_and_wait(&self.core.chans.tcomp_cmd_tx, move |ack| Cmd::Range {
            level,
            umin,
            umax,
            ack,
        })
        .await
    }

    /// Receiver carrying the current transient error while the subsystem is
    /// unhealthy. Writers that fail fast select on it.
    pub fn transient_errors(&self) -> Receiver<Error> {
        self.core.chans.err_rx.clone()
    }

    /// Receiver carrying the error once the subsystem is wedged for good.
    pub fn persistent_errors(&self) -> Receiver<Error> {
        self.core.chans.per_err_rx.clone()
    }

    /// The write-lock channel: send to acquire, receive to release. The
    /// error state machine holds it while a persistent error is latched.
    pub fn write_lock(&self) -> (Sender<()>, Receiver<()>) {
        (
            self.core.chans.write_lock_tx.clone(),
            self.core.chans.write_lock_rx.clone(),
        )
    }

    /// Per-level compaction statistics.
    pub fn stats(&self) -> Arc<CompactionStats> {
        Arc::clone(&self.core.stats)
    }

    /// Signal shutdown and wait for the background tasks to exit.
    pub async fn close(mut self) {
        self.shutdown_tx.take();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }

    async fn send_and_wait(
        &self,
        tx: &Sender<Cmd>,
        build: impl FnOnce(CmdAck) -> Cmd,
    ) -> Result<(), Error> {
        let (ack, ack_rx) = CmdAck::channel();
        tokio::select! {
            r = tx.send_async(build(ack)) => {
                if r.is_err() {
                    return Err(Error::Closed);
                }
            }
            err = self.core.chans.err_rx.recv_async() => {
                return Err(err.unwrap_or(Error::Closed));
            }
            _ = self.core.shutdown.wait() => return Err(Error::Closed),
        }
        tokio::select! {
            r = ack_rx.recv_async() => r.unwrap_or(Err(Error::Closed)),
            err = self.core.chans.err_rx.recv_async() => {
                Err(err.unwrap_or(Error::Closed))
            }
            _ = self.core.shutdown.wait() => Err(Error::Closed),
        }
    }
}
