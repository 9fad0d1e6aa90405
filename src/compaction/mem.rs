//! Memtable flush.
//!
//! Turns the frozen memtable into one sorted table, picks its destination
//! level, and commits the addition together with the journal and sequence
//! numbers that seal the memtable's place in the write-ahead journal. The
//! flush and the commit are separate transacts: a failed flush rolls back
//! the files it created, while commits are atomic at the session layer.

use std::sync::Arc;

use tracing::instrument;

use crate::{
    compaction::{
        stats::StatsStaging,
        transact::{Progress, RecCommitStep, TransactStep},
        Cmd, CompactionCore, Exiting,
    },
    db::FrozenMem,
    error::Error,
    observability::log_info,
    session::SessionRecord,
};

/// Flush the frozen memtable, if any. Pauses the table loop for the
/// duration so the two never commit concurrently.
#[instrument(name = "compaction::mem", skip_all, fields(component = "compaction"))]
pub(crate) async fn mem_compaction(core: &Arc<CompactionCore>) -> Result<(), Exiting> {
    let Some(mem) = core.db.frozen_mem() else {
        return Ok(());
    };

    log_info!(
        component = "compaction",
        event = "mem_flush_started",
        entries = mem.len(),
        bytes = mem.approximate_size(),
    );

    if mem.is_empty() {
        log_info!(component = "compaction", event = "mem_flush_skipped");
        core.db.drop_frozen_mem();
        return Ok(());
    }

    // Pause table compaction. With a persistent error latched there is no
    // table-loop work to pause against, so skip the handshake rather than
    // deadlock on it.
    let (resume_tx, resume_rx) = flume::bounded::<()>(0);
    let resume_rx = tokio::select! {
        r = core.chans.tcomp_pause_tx.send_async(resume_tx) => match r {
            Ok(()) => Some(resume_rx),
            Err(_) => None,
        },
        _ = core.chans.per_err_rx.recv_async() => None,
        _ = core.shutdown.wait() => return Ok(()),
    };

    let mut step = MemFlushStep {
        core,
        mem,
        rec: SessionRecord::default(),
        level: 0,
        stats: StatsStaging::default(),
    };
    core.transact("mem@flush", &mut step).await?;

    let MemFlushStep {
        mut rec,
        level,
        mut stats,
        ..
    } = step;
    rec.set_journal_num(core.db.journal_num());
    rec.set_seq_num(core.db.frozen_seq());
    let mut commit = RecCommitStep::new(core, &rec, Some(&mut stats));
    core.transact("mem@commit", &mut commit).await?;

    log_info!(
        component = "compaction",
        event = "mem_flush_committed",
        level,
        tables = rec.added_tables.len(),
        duration_ms = stats.duration.as_millis() as u64,
    );

    for (_, meta) in &rec.added_tables {
        stats.write += meta.size;
    }
    core.stats.add(level, &stats);

    core.db.drop_frozen_mem();

    // Resume table compaction.
    if let Some(resume_rx) = resume_rx {
        tokio::select! {
            _ = resume_rx.recv_async() => {}
            _ = core.shutdown.wait() => return Ok(()),
        }
    }

    // Wake the table loop so it reassesses the new level shape.
    let _ = core.chans.tcomp_cmd_tx.try_send(Cmd::Trigger);
    Ok(())
}

/// The flush transact: drain the memtable into one fresh table and stage
/// its addition at the picked level.
struct MemFlushStep<'a> {
    core: &'a CompactionCore,
    mem: Arc<dyn FrozenMem>,
    rec: SessionRecord,
    level: usize,
    stats: StatsStaging,
}

impl TransactStep for MemFlushStep<'_> {
    async fn exec(&mut self, _progress: &mut Progress) -> Result<(), Error> {
        self.stats.start_timer();
        let result = self.flush();
        self.stats.stop_timer();
        result
    }

    async fn rollback(&mut self) -> Result<(), Error> {
        for (_, meta) in &self.rec.added_tables {
            log_info!(
                component = "compaction",
                event = "mem_flush_rollback",
                file_num = meta.num,
            );
            self.core.tops.remove(meta.num)?;
        }
        Ok(())
    }

    fn has_rollback(&self) -> bool {
        true
    }
}

impl MemFlushStep<'_> {
    fn flush(&mut self) -> Result<(), Error> {
        let (meta, entries) = self.core.tops.create_from(self.mem.iter())?;

        let version = self.core.session.version();
        let level = version.pick_level(meta.umin(), meta.umax());
        drop(version);

        log_info!(
            component = "compaction",
            event = "mem_flush_table_created",
            level,
            file_num = meta.num,
            entries,
            bytes = meta.size,
        );

        self.rec.add_table(level, meta);
        self.level = level;
        Ok(())
    }
}
