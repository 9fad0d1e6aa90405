//! The version-set seam and the staged session record.
//!
//! The session owns file metadata, level composition, and atomic manifest
//! commits. Compaction stages its effects in a [`SessionRecord`] and hands
//! the record to [`Session::commit`]; a successful commit atomically
//! installs a new version.

use std::sync::Arc;

use bytes::Bytes;

use crate::{
    error::Error,
    key::InternalComparator,
    option::Options,
    table::{EntryIter, TableMeta},
};

/// A staged delta against the current version.
///
/// Committing a record applies every field atomically: tables added and
/// deleted per level, at most one compaction-pointer update, and the
/// journal/sequence numbers a memtable flush carries.
#[derive(Clone, Debug, Default)]
pub struct SessionRecord {
    /// Journal number recorded with a memtable flush.
    pub journal_num: Option<u64>,
    /// Sequence number recorded with a memtable flush.
    pub seq_num: Option<u64>,
    /// Compaction pointer update: the next compaction at this level resumes
    /// past this internal key.
    pub comp_ptr: Option<(usize, Bytes)>,
    /// Tables added, with their destination level.
    pub added_tables: Vec<(usize, TableMeta)>,
    /// Tables deleted, by level and file number.
    pub deleted_tables: Vec<(usize, u64)>,
}

impl SessionRecord {
    /// Record the journal number.
    pub fn set_journal_num(&mut self, num: u64) {
        self.journal_num = Some(num);
    }

    /// Record the sequence number.
    pub fn set_seq_num(&mut self, seq: u64) {
        self.seq_num = Some(seq);
    }

    /// Record a compaction-pointer update for `level`.
    pub fn add_comp_ptr(&mut self, level: usize, imax: Bytes) {
        self.comp_ptr = Some((level, imax));
    }

    /// Stage a table addition at `level`.
    pub fn add_table(&mut self, level: usize, meta: TableMeta) {
        self.added_tables.push((level, meta));
    }

    /// Stage a table deletion at `level`.
    pub fn del_table(&mut self, level: usize, num: u64) {
        self.deleted_tables.push((level, num));
    }
}

/// Immutable snapshot of the level composition.
pub trait Version: Send + Sync {
    /// The live tables at `level`.
    fn tables(&self, level: usize) -> Vec<TableMeta>;
    /// Destination level for a flushed memtable covering `[umin, umax]`:
    /// level 0 when the range overlaps level 0, otherwise the deepest level
    /// up to `max_mem_compact_level` whose next level the range does not
    /// overlap (and whose grandchild overlap the session judges acceptable).
    fn pick_level(&self, umin: &[u8], umax: &[u8]) -> usize;
    /// Whether the session wants a table compaction to run.
    fn need_compaction(&self) -> bool;
}

/// One planned merge of tables from a level `L` into `L + 1`.
///
/// Produced by the session, consumed by a single table-compaction
/// invocation, and released on drop.
pub trait Compaction: Send + Sync {
    /// Source level `L`.
    fn level(&self) -> usize;
    /// Input tables: `side` 0 selects the tables at `L`, 1 the tables at
    /// `L + 1`.
    fn inputs(&self, side: usize) -> &[TableMeta];
    /// Largest internal key among the inputs; recorded as the compaction
    /// pointer so the next compaction at `L` resumes past this range.
    fn imax(&self) -> &Bytes;
    /// Whether the compaction can be satisfied by relabeling a single input
    /// file to `L + 1` without rewriting data.
    fn is_trivial(&self) -> bool;
    /// Whether the current output table should be finished before emitting
    /// `ikey`, bounding overlap with level `L + 2`. Stateful: keys must be
    /// offered in iteration order.
    fn should_stop_before(&mut self, ikey: &[u8]) -> bool;
    /// Whether no level deeper than `L + 1` contains `ukey`. Stateful: user
    /// keys must be offered in ascending order.
    fn base_level_for_key(&mut self, ukey: &[u8]) -> bool;
    /// A merged iterator over the union of the input tables, ordered by the
    /// internal comparator.
    fn iter(&self) -> EntryIter;
}

/// The version set: single point of truth for live table metadata.
pub trait Session: Send + Sync {
    /// The current version.
    fn version(&self) -> Arc<dyn Version>;
    /// Pick the most urgent compaction, if any.
    fn pick_compaction(&self) -> Option<Box<dyn Compaction>>;
    /// Build a compaction covering `[umin, umax]` at `level`, if that range
    /// holds any tables.
    fn compaction_range(&self, level: usize, umin: &[u8], umax: &[u8])
        -> Option<Box<dyn Compaction>>;
    /// Atomically apply `rec` to the manifest and install a new version.
    fn commit(&self, rec: &SessionRecord) -> Result<(), Error>;
    /// The internal-key comparator.
    fn icmp(&self) -> &InternalComparator;
    /// The shared operating parameters.
    fn options(&self) -> &Options;
}
