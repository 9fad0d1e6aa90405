//! Background compaction: dispatch loops, the transact runner, the error
//! state machine, and the merge itself.
//!
//! Three long-lived tasks cooperate over rendezvous channels: the mem loop
//! flushes frozen memtables, the table loop merges tables between adjacent
//! levels, and the error loop owns the health of the subsystem. No mutable
//! state is shared between the loops; everything flows through the session
//! (which serializes internally) or a channel.

mod errstate;
mod handle;
mod mem;
mod stats;
mod table;
mod transact;
mod worker;

use std::sync::Arc;

use bytes::Bytes;
use flume::{Receiver, Sender};

pub use handle::CompactionHandle;
pub use stats::{CompactionStats, LevelStats};

use crate::{db::DbHandle, error::Error, session::Session, table::TableOps};

/// Sentinel signaling that the surrounding compaction task must exit: the
/// database closed, a persistent error latched, or corruption was detected.
/// The dispatch loops swallow it at their boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Exiting;

/// Cloned view of the process-wide shutdown signal. The signal fires when
/// the sending side is dropped; every blocking channel operation in the
/// core races against it.
#[derive(Clone)]
pub(crate) struct Shutdown(Receiver<()>);

impl Shutdown {
    /// Resolve once shutdown has been signaled. Nothing is ever sent on the
    /// underlying channel, so this only completes on disconnect.
    pub(crate) async fn wait(&self) {
        let _ = self.0.recv_async().await;
    }

    pub(crate) fn is_signaled(&self) -> bool {
        self.0.is_disconnected()
    }
}

/// Single-use command acknowledgment. Delivery tolerates a receiver that
/// abandoned the wait.
#[derive(Debug)]
pub(crate) struct CmdAck(Sender<Result<(), Error>>);

impl CmdAck {
    pub(crate) fn channel() -> (CmdAck, Receiver<Result<(), Error>>) {
        let (tx, rx) = flume::bounded(1);
        (CmdAck(tx), rx)
    }

    pub(crate) fn ack(self, result: Result<(), Error>) {
        let _ = self.0.try_send(result);
    }
}

/// Commands consumed by the dispatch loops.
pub(crate) enum Cmd {
    /// Request quiescence: acknowledged once every compaction pending at
    /// the time the command was queued has run.
    Idle { ack: CmdAck },
    /// Fire-and-forget wake so the table loop reassesses whether a
    /// compaction is needed.
    Trigger,
    /// Compact every table intersecting `[umin, umax]` at `level`, or at
    /// every overlapped level when `level` is `None`.
    Range {
        level: Option<usize>,
        umin: Bytes,
        umax: Bytes,
        ack: CmdAck,
    },
}

/// The channel fabric connecting the loops, the transact runner, and the
/// writer-facing handle. All command/error channels are rendezvous
/// channels; the write lock is the one-slot channel writers contend on.
pub(crate) struct Channels {
    pub(crate) mcomp_cmd_tx: Sender<Cmd>,
    pub(crate) mcomp_cmd_rx: Receiver<Cmd>,
    pub(crate) tcomp_cmd_tx: Sender<Cmd>,
    pub(crate) tcomp_cmd_rx: Receiver<Cmd>,
    /// Pause rendezvous: the mem loop sends a resume handle, the table loop
    /// blocks on it until the mem loop receives.
    pub(crate) tcomp_pause_tx: Sender<Sender<()>>,
    pub(crate) tcomp_pause_rx: Receiver<Sender<()>>,
    /// Error ingress: the transact runner publishes every step outcome.
    pub(crate) err_set_tx: Sender<Option<Error>>,
    pub(crate) err_set_rx: Receiver<Option<Error>>,
    /// Transient-error egress read by fail-fast writers.
    pub(crate) err_tx: Sender<Error>,
    pub(crate) err_rx: Receiver<Error>,
    /// Persistent-error egress; also drained by the transact runner as its
    /// publication rendezvous.
    pub(crate) per_err_tx: Sender<Error>,
    pub(crate) per_err_rx: Receiver<Error>,
    /// Write lock: send to acquire, receive to release.
    pub(crate) write_lock_tx: Sender<()>,
    pub(crate) write_lock_rx: Receiver<()>,
}

impl Channels {
    fn new() -> Self {
        let (mcomp_cmd_tx, mcomp_cmd_rx) = flume::bounded(0);
        let (tcomp_cmd_tx, tcomp_cmd_rx) = flume::bounded(0);
        let (tcomp_pause_tx, tcomp_pause_rx) = flume::bounded(0);
        let (err_set_tx, err_set_rx) = flume::bounded(0);
        let (err_tx, err_rx) = flume::bounded(0);
        let (per_err_tx, per_err_rx) = flume::bounded(0);
        let (write_lock_tx, write_lock_rx) = flume::bounded(1);
        Self {
            mcomp_cmd_tx,
            mcomp_cmd_rx,
            tcomp_cmd_tx,
            tcomp_cmd_rx,
            tcomp_pause_tx,
            tcomp_pause_rx,
            err_set_tx,
            err_set_rx,
            err_tx,
            err_rx,
            per_err_tx,
            per_err_rx,
            write_lock_tx,
            write_lock_rx,
        }
    }
}

/// Shared state of the compaction subsystem.
///
/// Constructed by [`CompactionCore::spawn`], which wires the channels,
/// spawns the three background tasks, and returns the writer-facing
/// [`CompactionHandle`].
pub struct CompactionCore {
    pub(crate) session: Arc<dyn Session>,
    pub(crate) tops: Arc<dyn TableOps>,
    pub(crate) db: Arc<dyn DbHandle>,
    pub(crate) chans: Channels,
    pub(crate) stats: Arc<CompactionStats>,
    pub(crate) shutdown: Shutdown,
}

impl CompactionCore {
    /// Spawn the error loop, the mem loop, and the table loop on the
    /// current tokio runtime and return the handle controlling them.
    pub fn spawn(
        session: Arc<dyn Session>,
        tops: Arc<dyn TableOps>,
        db: Arc<dyn DbHandle>,
    ) -> CompactionHandle {
        let (shutdown_tx, shutdown_rx) = flume::bounded::<()>(0);
        let num_levels = session.options().num_levels;
        let core = Arc::new(CompactionCore {
            session,
            tops,
            db,
            chans: Channels::new(),
            stats: Arc::new(CompactionStats::new(num_levels)),
            shutdown: Shutdown(shutdown_rx),
        });
        let tasks = vec![
            tokio::spawn(errstate::error_loop(Arc::clone(&core))),
            tokio::spawn(worker::mem_loop(Arc::clone(&core))),
            tokio::spawn(worker::table_loop(Arc::clone(&core))),
        ];
        CompactionHandle::new(core, shutdown_tx, tasks)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.shutdown.is_signaled()
    }

    /// Yield to a pauser: block sending on its resume handle until the
    /// pauser receives, racing shutdown. A dropped handle counts as an
    /// immediate resume.
    pub(crate) async fn pause(&self, resume: Sender<()>) -> Result<(), Exiting> {
        tokio::select! {
            biased;
            _ = self.shutdown.wait() => Err(Exiting),
            r = resume.send_async(()) => {
                let _ = r;
                Ok(())
            }
        }
    }
}
