//! Table compaction: trivial moves and the merging rewrite.
//!
//! The merge walks a single sorted iterator over the union of the input
//! tables and rewrites the survivors into bounded output tables at the next
//! level. Two rules drop records: an older version of a user key whose
//! newer version is already visible below every live snapshot, and a
//! deletion tombstone below every live snapshot for a user key no deeper
//! level contains. Output boundaries are cut on grandparent overlap and on
//! size; at every cut the merge snapshots its bookkeeping so a retry
//! resumes at the boundary instead of rewriting finished outputs.

use std::{cmp::Ordering, sync::Arc};

use tracing::instrument;

use crate::{
    compaction::{
        stats::StatsStaging,
        transact::{Progress, RecCommitStep, TransactStep},
        CompactionCore, Exiting,
    },
    error::Error,
    key::{parse_ikey, KeyKind, MAX_SEQ},
    observability::log_info,
    session::{Compaction, SessionRecord},
    table::TableWriter,
};

/// Whether the session wants a table compaction to run right now.
pub(crate) fn table_need_compaction(core: &CompactionCore) -> bool {
    core.session.version().need_compaction()
}

/// Run the compaction the session picks, if any.
pub(crate) async fn table_auto_compaction(core: &Arc<CompactionCore>) -> Result<(), Exiting> {
    if let Some(c) = core.session.pick_compaction() {
        table_compaction(core, c, false).await?;
    }
    Ok(())
}

/// Compact every table intersecting `[umin, umax]`. With `level` set, only
/// that level is considered; otherwise every level from 0 up to the deepest
/// one overlapping the range is compacted in turn. Range compactions never
/// degrade to a trivial move.
pub(crate) async fn table_range_compaction(
    core: &Arc<CompactionCore>,
    level: Option<usize>,
    umin: &[u8],
    umax: &[u8],
) -> Result<(), Exiting> {
    log_info!(
        component = "compaction",
        event = "range_compaction_started",
        level = ?level,
    );

    match level {
        Some(level) => {
            if let Some(c) = core.session.compaction_range(level, umin, umax) {
                table_compaction(core, c, true).await?;
            }
        }
        None => {
            let version = core.session.version();
            let icmp = core.session.icmp();
            let mut deepest = 1;
            for level in 1..core.session.options().num_levels {
                if version
                    .tables(level)
                    .iter()
                    .any(|t| t.overlaps_ukey(icmp, umin, umax))
                {
                    deepest = level;
                }
            }
            drop(version);

            for level in 0..deepest {
                if let Some(c) = core.session.compaction_range(level, umin, umax) {
                    table_compaction(core, c, true).await?;
                }
            }
        }
    }
    Ok(())
}

/// Run one compaction to completion: either a trivial file move, or a full
/// merge followed by the record commit.
#[instrument(
    name = "compaction::table",
    skip_all,
    fields(component = "compaction", level = c.level())
)]
pub(crate) async fn table_compaction(
    core: &Arc<CompactionCore>,
    c: Box<dyn Compaction>,
    no_trivial: bool,
) -> Result<(), Exiting> {
    let level = c.level();
    let mut rec = SessionRecord::default();
    rec.add_comp_ptr(level, c.imax().clone());

    if !no_trivial && c.is_trivial() {
        let t = c.inputs(0)[0].clone();
        log_info!(
            component = "compaction",
            event = "table_move",
            level,
            file_num = t.num,
            to_level = level + 1,
        );
        rec.del_table(level, t.num);
        rec.add_table(level + 1, t);
        let mut commit = RecCommitStep::new(core, &rec, None);
        core.transact("table@move", &mut commit).await?;
        return Ok(());
    }

    let mut stats = [StatsStaging::default(), StatsStaging::default()];
    for (side, staging) in stats.iter_mut().enumerate() {
        for t in c.inputs(side) {
            staging.read += t.size;
            rec.del_table(level + side, t.num);
        }
    }
    let source_size = stats[0].read + stats[1].read;

    // Captured once: the rules below must judge obsolescence against the
    // same snapshot horizon for the whole merge, retries included.
    let min_seq = core.db.min_seq();

    log_info!(
        component = "compaction",
        event = "table_compaction_started",
        level,
        source_tables = c.inputs(0).len(),
        parent_tables = c.inputs(1).len(),
        bytes = source_size,
        min_seq,
    );

    let strict = core.session.options().strict_compaction;
    let table_size = core.session.options().compaction_table_size(level + 1);

    let mut build = TableBuildStep {
        core,
        c,
        rec,
        stats,
        min_seq,
        strict,
        table_size,
        snap: MergeSnapshot::default(),
        kerr_cnt: 0,
        drop_cnt: 0,
    };
    core.transact("table@build", &mut build).await?;

    let TableBuildStep {
        rec,
        mut stats,
        kerr_cnt,
        drop_cnt,
        ..
    } = build;

    let mut commit = RecCommitStep::new(core, &rec, Some(&mut stats[1]));
    core.transact("table@commit", &mut commit).await?;

    log_info!(
        component = "compaction",
        event = "table_compaction_committed",
        level,
        added = rec.added_tables.len(),
        deleted = rec.deleted_tables.len(),
        bytes_in = source_size,
        bytes_out = stats[1].write,
        key_errors = kerr_cnt,
        dropped = drop_cnt,
        duration_ms = stats[1].duration.as_millis() as u64,
    );

    for staging in &stats {
        core.stats.add(level + 1, staging);
    }
    Ok(())
}

/// Bookkeeping captured at the last output-table boundary. A retry restores
/// it and skips the iterator forward to `iter_pos`, so outputs finished by
/// a previous attempt keep their exact contents.
#[derive(Debug, Default)]
struct MergeSnapshot {
    has_last_ukey: bool,
    last_ukey: Vec<u8>,
    last_seq: u64,
    iter_pos: usize,
    kerr_cnt: u64,
    drop_cnt: u64,
}

/// The merge transact.
struct TableBuildStep<'a> {
    core: &'a Arc<CompactionCore>,
    c: Box<dyn Compaction>,
    rec: SessionRecord,
    stats: [StatsStaging; 2],
    min_seq: u64,
    strict: bool,
    table_size: usize,
    snap: MergeSnapshot,
    kerr_cnt: u64,
    drop_cnt: u64,
}

impl TransactStep for TableBuildStep<'_> {
    async fn exec(&mut self, progress: &mut Progress) -> Result<(), Error> {
        self.stats[1].start_timer();
        let result = self.build(progress).await;
        self.stats[1].stop_timer();
        result
    }

    async fn rollback(&mut self) -> Result<(), Error> {
        for (_, meta) in &self.rec.added_tables {
            log_info!(
                component = "compaction",
                event = "table_build_rollback",
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

impl TableBuildStep<'_> {
    async fn build(&mut self, progress: &mut Progress) -> Result<(), Error> {
        // Reinstate the bookkeeping of the last safe boundary. The user key
        // may legitimately be empty, hence the explicit flag.
        let mut has_last_ukey = self.snap.has_last_ukey;
        let mut last_ukey = self.snap.last_ukey.clone();
        let mut last_seq = self.snap.last_seq;
        self.kerr_cnt = self.snap.kerr_cnt;
        self.drop_cnt = self.snap.drop_cnt;
        let mut snap_sched = self.snap.iter_pos == 0;

        let mut tw: Option<Box<dyn TableWriter>> = None;
        let mut iter = self.c.iter();
        let mut pos = 0usize;
        loop {
            let Some(entry) = iter.next() else { break };
            let (ikey, value) = entry?;
            progress.incr();

            // Skip forward to where the previous attempt left off.
            let idx = pos;
            pos += 1;
            if idx < self.snap.iter_pos {
                continue;
            }

            let parsed = parse_ikey(&ikey);

            // Cut the output before a key that would drag in too much of
            // the grandparent level. The predicate is stateful, so it is
            // consulted for every well-formed key even with no open output.
            if parsed.is_ok() && self.c.should_stop_before(&ikey) {
                if let Some(w) = tw.take() {
                    self.finish_output(w)?;
                    snap_sched = true;
                }
            }

            if snap_sched {
                self.snap.has_last_ukey = has_last_ukey;
                self.snap.last_ukey.clear();
                self.snap.last_ukey.extend_from_slice(&last_ukey);
                self.snap.last_seq = last_seq;
                self.snap.iter_pos = idx;
                self.snap.kerr_cnt = self.kerr_cnt;
                self.snap.drop_cnt = self.drop_cnt;
                snap_sched = false;
            }

            match parsed {
                Ok(pk) => {
                    let icmp = self.core.session.icmp();
                    if !has_last_ukey || icmp.ucompare(&last_ukey, pk.ukey) != Ordering::Equal {
                        // First occurrence of this user key.
                        has_last_ukey = true;
                        last_ukey.clear();
                        last_ukey.extend_from_slice(pk.ukey);
                        last_seq = MAX_SEQ;
                    }

                    if last_seq <= self.min_seq {
                        // A newer version of this user key was already
                        // emitted below every live snapshot.
                        last_seq = pk.seq;
                        self.drop_cnt += 1;
                        continue;
                    }
                    if pk.kind == KeyKind::Deletion
                        && pk.seq <= self.min_seq
                        && self.c.base_level_for_key(&last_ukey)
                    {
                        // No deeper level holds this user key, and any older
                        // version among the inputs sorts later and falls to
                        // the newer-version rule above. The tombstone is
                        // obsolete.
                        last_seq = pk.seq;
                        self.drop_cnt += 1;
                        continue;
                    }
                    last_seq = pk.seq;
                }
                Err(kerr) => {
                    if self.strict {
                        return Err(kerr);
                    }
                    // Keep the corrupted key verbatim and restart the
                    // suppression bookkeeping at the next well-formed key.
                    has_last_ukey = false;
                    last_ukey.clear();
                    last_seq = MAX_SEQ;
                    self.kerr_cnt += 1;
                }
            }

            if tw.is_none() {
                self.yield_point().await?;
                tw = Some(self.core.tops.create()?);
            }
            if let Some(w) = tw.as_mut() {
                w.append(&ikey, &value)?;
            }
            if tw
                .as_ref()
                .is_some_and(|w| w.bytes_len() >= self.table_size)
            {
                if let Some(w) = tw.take() {
                    self.finish_output(w)?;
                    snap_sched = true;
                }
            }
        }

        // Finish the final partial output; an empty writer is abandoned.
        if let Some(w) = tw.take() {
            if !w.is_empty() {
                self.finish_output(w)?;
            }
        }
        Ok(())
    }

    fn finish_output(&mut self, mut w: Box<dyn TableWriter>) -> Result<(), Error> {
        let entries = w.entries_len();
        let meta = w.finish()?;
        let to_level = self.c.level() + 1;
        log_info!(
            component = "compaction",
            event = "table_output_created",
            level = to_level,
            file_num = meta.num,
            entries,
            bytes = meta.size,
        );
        self.stats[1].write += meta.size;
        self.rec.add_table(to_level, meta);
        Ok(())
    }

    /// A new output is about to open: honor a pending pause request and
    /// bail out promptly on shutdown.
    async fn yield_point(&self) -> Result<(), Error> {
        if let Ok(resume) = self.core.chans.tcomp_pause_rx.try_recv() {
            self.core.pause(resume).await.map_err(|_| Error::Closed)?;
        }
        if self.core.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }
}
