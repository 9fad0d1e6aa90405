//! Operating parameters for the compaction core.

const DEFAULT_NUM_LEVELS: usize = 7;
const DEFAULT_BASE_TABLE_SIZE: usize = 2 * 1024 * 1024;
const DEFAULT_MAX_MEM_COMPACT_LEVEL: usize = 2;

/// Configure the operating parameters of the compaction core.
///
/// The session and the core share one `Options` value; fields consumed by
/// the session (level picking, compaction sizing) live here too so the two
/// never disagree.
#[derive(Clone, Debug)]
pub struct Options {
    /// Number of on-disk levels.
    pub num_levels: usize,
    /// Target size (in bytes) of an output table at level 1.
    pub base_table_size: usize,
    /// Per-level multiplier applied to `base_table_size`. The default of 1
    /// keeps output tables the same size at every level.
    pub table_size_multiplier: usize,
    /// Fail a compaction on the first malformed internal key instead of
    /// carrying the key through verbatim.
    pub strict_compaction: bool,
    /// Disable the transact runner's retry backoff. Intended for tests.
    pub disable_compaction_backoff: bool,
    /// Deepest level a flushed memtable may be placed at when its key range
    /// overlaps nothing below level 0.
    pub max_mem_compact_level: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            num_levels: DEFAULT_NUM_LEVELS,
            base_table_size: DEFAULT_BASE_TABLE_SIZE,
            table_size_multiplier: 1,
            strict_compaction: false,
            disable_compaction_backoff: false,
            max_mem_compact_level: DEFAULT_MAX_MEM_COMPACT_LEVEL,
        }
    }
}

impl Options {
    /// Set the number of on-disk levels.
    pub fn num_levels(mut self, value: usize) -> Self {
        self.num_levels = value.max(2);
        self
    }

    /// Set the base output-table size in bytes.
    pub fn base_table_size(mut self, value: usize) -> Self {
        self.base_table_size = value.max(1);
        self
    }

    /// Set the per-level output-table size multiplier.
    pub fn table_size_multiplier(mut self, value: usize) -> Self {
        self.table_size_multiplier = value.max(1);
        self
    }

    /// Enable or disable strict corruption handling during merges.
    pub fn strict_compaction(mut self, value: bool) -> Self {
        self.strict_compaction = value;
        self
    }

    /// Enable or disable the transact retry backoff.
    pub fn disable_compaction_backoff(mut self, value: bool) -> Self {
        self.disable_compaction_backoff = value;
        self
    }

    /// Set the deepest level a non-overlapping memtable flush may target.
    pub fn max_mem_compact_level(mut self, value: usize) -> Self {
        self.max_mem_compact_level = value;
        self
    }

    /// Target size of an output table produced by a compaction into `level`.
    pub fn compaction_table_size(&self, level: usize) -> usize {
        let mut size = self.base_table_size;
        for _ in 1..level.max(1) {
            size = size.saturating_mul(self.table_size_multiplier);
        }
        size
    }
}
