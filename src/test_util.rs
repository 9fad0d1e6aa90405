//! In-memory collaborators for exercising the compaction core.
//!
//! The doubles keep real bookkeeping (level composition, file registry,
//! commit application) so the end-to-end scenarios can assert the same
//! invariants a disk-backed session would maintain. Fault hooks let tests
//! fail the nth append, the nth table finish, a table create, or a commit.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering as AtomicOrdering},
        Arc, Mutex, PoisonError,
    },
};

use bytes::Bytes;

use crate::{
    compaction::{CompactionCore, CompactionHandle},
    db::{DbHandle, FrozenMem},
    error::Error,
    key::{ikey, InternalComparator, KeyKind},
    option::Options,
    session::{Compaction, Session, SessionRecord, Version},
    table::{EntryIter, TableMeta, TableOps, TableWriter},
};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Build one `(internal key, value)` entry.
pub(crate) fn kv(ukey: &str, seq: u64, kind: KeyKind, value: &str) -> (Bytes, Bytes) {
    (
        ikey(ukey.as_bytes(), seq, kind),
        Bytes::copy_from_slice(value.as_bytes()),
    )
}

// ---------------------------------------------------------------------------
// Table store

#[derive(Clone, Debug)]
pub(crate) struct TestTable {
    pub(crate) num: u64,
    pub(crate) entries: Vec<(Bytes, Bytes)>,
}

impl TestTable {
    fn meta(&self) -> TableMeta {
        let size: usize = self
            .entries
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum();
        TableMeta {
            num: self.num,
            size: size as u64,
            imin: self.entries.first().map(|(k, _)| k.clone()).unwrap_or_default(),
            imax: self.entries.last().map(|(k, _)| k.clone()).unwrap_or_default(),
        }
    }
}

#[derive(Default)]
struct StoreInner {
    files: Mutex<BTreeMap<u64, TestTable>>,
    next_num: AtomicU64,
    append_count: AtomicU64,
    /// Fail every nth append across the store (0 = off).
    fail_append_every: AtomicU64,
    finish_count: AtomicU64,
    /// Fail the nth finish call, once (0 = off).
    fail_finish_at: AtomicU64,
    create_count: AtomicU64,
    /// Fail the nth `create`/`create_from` call with the given error, once.
    fail_create_at: Mutex<Option<(u64, Error)>>,
    /// Microseconds to stall every append, to widen race windows in tests.
    append_delay_micros: AtomicU64,
}

/// In-memory table registry implementing [`TableOps`]. Cheap to clone.
#[derive(Clone, Default)]
pub(crate) struct TestTableStore {
    inner: Arc<StoreInner>,
}

impl TestTableStore {
    pub(crate) fn new() -> Self {
        let store = Self::default();
        store.inner.next_num.store(1, AtomicOrdering::SeqCst);
        store
    }

    /// Register a pre-built table, bypassing the writer path.
    pub(crate) fn build_table(&self, entries: Vec<(Bytes, Bytes)>) -> TableMeta {
        let num = self.inner.next_num.fetch_add(1, AtomicOrdering::SeqCst);
        let table = TestTable { num, entries };
        let meta = table.meta();
        lock(&self.inner.files).insert(num, table);
        meta
    }

    pub(crate) fn table(&self, num: u64) -> Option<TestTable> {
        lock(&self.inner.files).get(&num).cloned()
    }

    pub(crate) fn file_nums(&self) -> BTreeSet<u64> {
        lock(&self.inner.files).keys().copied().collect()
    }

    pub(crate) fn fail_append_every(&self, every: u64) {
        self.inner
            .fail_append_every
            .store(every, AtomicOrdering::SeqCst);
    }

    pub(crate) fn fail_finish_at(&self, nth: u64) {
        self.inner.fail_finish_at.store(nth, AtomicOrdering::SeqCst);
    }

    pub(crate) fn fail_create_at(&self, nth: u64, err: Error) {
        *lock(&self.inner.fail_create_at) = Some((nth, err));
    }

    pub(crate) fn set_append_delay_micros(&self, micros: u64) {
        self.inner
            .append_delay_micros
            .store(micros, AtomicOrdering::SeqCst);
    }

    fn check_create(&self) -> Result<(), Error> {
        let nth = self.inner.create_count.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        let mut slot = lock(&self.inner.fail_create_at);
        if let Some((at, _)) = slot.as_ref() {
            if *at == nth {
                let (_, err) = slot.take().expect("slot checked above");
                return Err(err);
            }
        }
        Ok(())
    }
}

impl TableOps for TestTableStore {
    fn create(&self) -> Result<Box<dyn TableWriter>, Error> {
        self.check_create()?;
        let num = self.inner.next_num.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(Box::new(TestTableWriter {
            inner: Arc::clone(&self.inner),
            num,
            entries: Vec::new(),
            bytes: 0,
        }))
    }

    fn create_from(&self, entries: EntryIter) -> Result<(TableMeta, usize), Error> {
        self.check_create()?;
        let collected: Vec<(Bytes, Bytes)> =
            entries.collect::<Result<_, Error>>()?;
        let count = collected.len();
        Ok((self.build_table(collected), count))
    }

    fn remove(&self, num: u64) -> Result<(), Error> {
        match lock(&self.inner.files).remove(&num) {
            Some(_) => Ok(()),
            None => Err(Error::io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("table {num} not found"),
            ))),
        }
    }
}

struct TestTableWriter {
    inner: Arc<StoreInner>,
    num: u64,
    entries: Vec<(Bytes, Bytes)>,
    bytes: usize,
}

impl TableWriter for TestTableWriter {
    fn append(&mut self, ikey: &[u8], value: &[u8]) -> Result<(), Error> {
        let delay = self.inner.append_delay_micros.load(AtomicOrdering::SeqCst);
        if delay > 0 {
            std::thread::sleep(std::time::Duration::from_micros(delay));
        }
        let count = self.inner.append_count.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        let every = self.inner.fail_append_every.load(AtomicOrdering::SeqCst);
        if every > 0 && count % every == 0 {
            return Err(Error::io(std::io::Error::other(format!(
                "injected append failure at {count}"
            ))));
        }
        self.entries
            .push((Bytes::copy_from_slice(ikey), Bytes::copy_from_slice(value)));
        self.bytes += ikey.len() + value.len();
        Ok(())
    }

    fn finish(&mut self) -> Result<TableMeta, Error> {
        let nth = self.inner.finish_count.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        let fail_at = self.inner.fail_finish_at.load(AtomicOrdering::SeqCst);
        if fail_at > 0 && nth == fail_at {
            self.inner.fail_finish_at.store(0, AtomicOrdering::SeqCst);
            return Err(Error::io(std::io::Error::other(format!(
                "injected finish failure at {nth}"
            ))));
        }
        let table = TestTable {
            num: self.num,
            entries: std::mem::take(&mut self.entries),
        };
        let meta = table.meta();
        lock(&self.inner.files).insert(self.num, table);
        Ok(meta)
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn bytes_len(&self) -> usize {
        self.bytes
    }

    fn entries_len(&self) -> usize {
        self.entries.len()
    }
}

// ---------------------------------------------------------------------------
// Session

/// A compaction the session will hand out on the next `pick_compaction`.
pub(crate) struct PlannedCompaction {
    pub(crate) level: usize,
    pub(crate) inputs: [Vec<TableMeta>; 2],
    /// Internal keys at which `should_stop_before` fires, in order.
    pub(crate) stop_keys: Vec<Bytes>,
    /// Refuse the trivial-move shortcut even for a single-table input.
    pub(crate) force_merge: bool,
}

struct SessionState {
    levels: Vec<Vec<TableMeta>>,
    comp_ptrs: BTreeMap<usize, Bytes>,
    /// `(journal, seq)` pairs in commit order, for monotonicity checks.
    marks: Vec<(u64, u64)>,
    /// "mem" or "table", in commit order.
    commit_kinds: Vec<&'static str>,
    commits: u64,
}

/// In-memory version set implementing [`Session`].
pub(crate) struct TestSession {
    options: Options,
    icmp: InternalComparator,
    store: TestTableStore,
    state: Mutex<SessionState>,
    planned: Mutex<VecDeque<PlannedCompaction>>,
    commit_errors: Mutex<VecDeque<Error>>,
}

impl TestSession {
    pub(crate) fn new(options: Options, store: TestTableStore) -> Self {
        let levels = vec![Vec::new(); options.num_levels];
        Self {
            options,
            icmp: InternalComparator::default(),
            store,
            state: Mutex::new(SessionState {
                levels,
                comp_ptrs: BTreeMap::new(),
                marks: Vec::new(),
                commit_kinds: Vec::new(),
                commits: 0,
            }),
            planned: Mutex::new(VecDeque::new()),
            commit_errors: Mutex::new(VecDeque::new()),
        }
    }

    /// Install a table at `level` outside the commit path, as recovery
    /// would.
    pub(crate) fn install_table(&self, level: usize, meta: TableMeta) {
        let mut state = lock(&self.state);
        state.levels[level].push(meta);
        let icmp = self.icmp.clone();
        state.levels[level].sort_by(|a, b| icmp.compare(&a.imin, &b.imin));
    }

    /// Queue a compaction for the table loop to pick up.
    pub(crate) fn plan(&self, planned: PlannedCompaction) {
        lock(&self.planned).push_back(planned);
    }

    /// Script the next commit to fail with `err`.
    pub(crate) fn fail_next_commit(&self, err: Error) {
        lock(&self.commit_errors).push_back(err);
    }

    pub(crate) fn level_tables(&self, level: usize) -> Vec<TableMeta> {
        lock(&self.state).levels[level].clone()
    }

    pub(crate) fn live_nums(&self) -> BTreeSet<u64> {
        lock(&self.state)
            .levels
            .iter()
            .flatten()
            .map(|t| t.num)
            .collect()
    }

    pub(crate) fn commits(&self) -> u64 {
        lock(&self.state).commits
    }

    pub(crate) fn marks(&self) -> Vec<(u64, u64)> {
        lock(&self.state).marks.clone()
    }

    pub(crate) fn commit_kinds(&self) -> Vec<&'static str> {
        lock(&self.state).commit_kinds.clone()
    }

    pub(crate) fn comp_ptr(&self, level: usize) -> Option<Bytes> {
        lock(&self.state).comp_ptrs.get(&level).cloned()
    }

    fn materialize(&self, planned: PlannedCompaction) -> TestCompaction {
        let mut entries: Vec<(Bytes, Bytes)> = Vec::new();
        for meta in planned.inputs.iter().flatten() {
            if let Some(table) = self.store.table(meta.num) {
                entries.extend(table.entries);
            }
        }
        let icmp = self.icmp.clone();
        entries.sort_by(|a, b| icmp.compare(&a.0, &b.0));

        let imax = planned
            .inputs
            .iter()
            .flatten()
            .map(|t| t.imax.clone())
            .max_by(|a, b| self.icmp.compare(a, b))
            .unwrap_or_default();

        let deeper = {
            let state = lock(&self.state);
            state
                .levels
                .get(planned.level + 2..)
                .map(|rest| rest.to_vec())
                .unwrap_or_default()
        };

        TestCompaction {
            level: planned.level,
            inputs: planned.inputs,
            imax,
            entries,
            stop_keys: planned.stop_keys,
            stop_idx: 0,
            force_merge: planned.force_merge,
            deeper,
            icmp: self.icmp.clone(),
        }
    }
}

impl Session for TestSession {
    fn version(&self) -> Arc<dyn Version> {
        let state = lock(&self.state);
        Arc::new(TestVersion {
            icmp: self.icmp.clone(),
            levels: state.levels.clone(),
            max_mem_compact_level: self.options.max_mem_compact_level,
            need: !lock(&self.planned).is_empty(),
        })
    }

    fn pick_compaction(&self) -> Option<Box<dyn Compaction>> {
        let planned = lock(&self.planned).pop_front()?;
        Some(Box::new(self.materialize(planned)))
    }

    fn compaction_range(
        &self,
        level: usize,
        umin: &[u8],
        umax: &[u8],
    ) -> Option<Box<dyn Compaction>> {
        let (source, parent) = {
            let state = lock(&self.state);
            let source: Vec<TableMeta> = state.levels[level]
                .iter()
                .filter(|t| t.overlaps_ukey(&self.icmp, umin, umax))
                .cloned()
                .collect();
            let parent: Vec<TableMeta> = state
                .levels
                .get(level + 1)
                .map(|tables| {
                    tables
                        .iter()
                        .filter(|t| t.overlaps_ukey(&self.icmp, umin, umax))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            (source, parent)
        };
        if source.is_empty() {
            return None;
        }
        Some(Box::new(self.materialize(PlannedCompaction {
            level,
            inputs: [source, parent],
            stop_keys: Vec::new(),
            force_merge: false,
        })))
    }

    fn commit(&self, rec: &SessionRecord) -> Result<(), Error> {
        if let Some(err) = lock(&self.commit_errors).pop_front() {
            return Err(err);
        }
        let mut state = lock(&self.state);
        for (level, num) in &rec.deleted_tables {
            state.levels[*level].retain(|t| t.num != *num);
            // The session owns registered files; a deleted table's file is
            // reclaimed with the commit.
            let _ = self.store.remove(*num);
        }
        for (level, meta) in &rec.added_tables {
            state.levels[*level].push(meta.clone());
        }
        let icmp = self.icmp.clone();
        for tables in &mut state.levels {
            tables.sort_by(|a, b| icmp.compare(&a.imin, &b.imin));
        }
        if let Some((level, imax)) = &rec.comp_ptr {
            state.comp_ptrs.insert(*level, imax.clone());
        }
        if let (Some(journal), Some(seq)) = (rec.journal_num, rec.seq_num) {
            state.marks.push((journal, seq));
        }
        state
            .commit_kinds
            .push(if rec.journal_num.is_some() { "mem" } else { "table" });
        state.commits += 1;
        Ok(())
    }

    fn icmp(&self) -> &InternalComparator {
        &self.icmp
    }

    fn options(&self) -> &Options {
        &self.options
    }
}

struct TestVersion {
    icmp: InternalComparator,
    levels: Vec<Vec<TableMeta>>,
    max_mem_compact_level: usize,
    need: bool,
}

impl TestVersion {
    fn overlaps(&self, level: usize, umin: &[u8], umax: &[u8]) -> bool {
        self.levels
            .get(level)
            .map(|tables| {
                tables
                    .iter()
                    .any(|t| t.overlaps_ukey(&self.icmp, umin, umax))
            })
            .unwrap_or(false)
    }
}

impl Version for TestVersion {
    fn tables(&self, level: usize) -> Vec<TableMeta> {
        self.levels.get(level).cloned().unwrap_or_default()
    }

    fn pick_level(&self, umin: &[u8], umax: &[u8]) -> usize {
        let mut level = 0;
        if !self.overlaps(0, umin, umax) {
            while level < self.max_mem_compact_level {
                if self.overlaps(level + 1, umin, umax) {
                    break;
                }
                level += 1;
            }
        }
        level
    }

    fn need_compaction(&self) -> bool {
        self.need
    }
}

struct TestCompaction {
    level: usize,
    inputs: [Vec<TableMeta>; 2],
    imax: Bytes,
    entries: Vec<(Bytes, Bytes)>,
    stop_keys: Vec<Bytes>,
    stop_idx: usize,
    force_merge: bool,
    deeper: Vec<Vec<TableMeta>>,
    icmp: InternalComparator,
}

impl Compaction for TestCompaction {
    fn level(&self) -> usize {
        self.level
    }

    fn inputs(&self, side: usize) -> &[TableMeta] {
        &self.inputs[side]
    }

    fn imax(&self) -> &Bytes {
        &self.imax
    }

    fn is_trivial(&self) -> bool {
        self.inputs[0].len() == 1
            && self.inputs[1].is_empty()
            && self.stop_keys.is_empty()
            && !self.force_merge
    }

    fn should_stop_before(&mut self, ikey: &[u8]) -> bool {
        if let Some(stop) = self.stop_keys.get(self.stop_idx) {
            if self.icmp.compare(ikey, stop) != std::cmp::Ordering::Less {
                self.stop_idx += 1;
                return true;
            }
        }
        false
    }

    fn base_level_for_key(&mut self, ukey: &[u8]) -> bool {
        !self.deeper.iter().any(|tables| {
            tables
                .iter()
                .any(|t| t.overlaps_ukey(&self.icmp, ukey, ukey))
        })
    }

    fn iter(&self) -> EntryIter {
        Box::new(self.entries.clone().into_iter().map(Ok))
    }
}

// ---------------------------------------------------------------------------
// Frozen memtable and database handle

/// Sorted in-memory buffer implementing [`FrozenMem`].
pub(crate) struct TestMem {
    entries: Vec<(Bytes, Bytes)>,
}

impl TestMem {
    pub(crate) fn new(mut entries: Vec<(Bytes, Bytes)>) -> Self {
        let icmp = InternalComparator::default();
        entries.sort_by(|a, b| icmp.compare(&a.0, &b.0));
        Self { entries }
    }
}

impl FrozenMem for TestMem {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn approximate_size(&self) -> usize {
        self.entries.iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    fn iter(&self) -> EntryIter {
        Box::new(self.entries.clone().into_iter().map(Ok))
    }
}

/// Write-path double implementing [`DbHandle`].
#[derive(Default)]
pub(crate) struct TestDb {
    frozen: Mutex<Option<Arc<TestMem>>>,
    journal_num: AtomicU64,
    frozen_seq: AtomicU64,
    min_seq: AtomicU64,
    drops: AtomicU64,
}

impl TestDb {
    pub(crate) fn freeze(&self, mem: TestMem) {
        *lock(&self.frozen) = Some(Arc::new(mem));
    }

    pub(crate) fn set_journal_num(&self, num: u64) {
        self.journal_num.store(num, AtomicOrdering::SeqCst);
    }

    pub(crate) fn set_frozen_seq(&self, seq: u64) {
        self.frozen_seq.store(seq, AtomicOrdering::SeqCst);
    }

    pub(crate) fn set_min_seq(&self, seq: u64) {
        self.min_seq.store(seq, AtomicOrdering::SeqCst);
    }

    pub(crate) fn drops(&self) -> u64 {
        self.drops.load(AtomicOrdering::SeqCst)
    }
}

impl DbHandle for TestDb {
    fn frozen_mem(&self) -> Option<Arc<dyn FrozenMem>> {
        lock(&self.frozen)
            .clone()
            .map(|mem| mem as Arc<dyn FrozenMem>)
    }

    fn drop_frozen_mem(&self) {
        *lock(&self.frozen) = None;
        self.drops.fetch_add(1, AtomicOrdering::SeqCst);
    }

    fn journal_num(&self) -> u64 {
        self.journal_num.load(AtomicOrdering::SeqCst)
    }

    fn frozen_seq(&self) -> u64 {
        self.frozen_seq.load(AtomicOrdering::SeqCst)
    }

    fn min_seq(&self) -> u64 {
        self.min_seq.load(AtomicOrdering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Harness

/// Everything a test needs: the spawned subsystem plus its collaborators.
pub(crate) struct Harness {
    pub(crate) handle: CompactionHandle,
    pub(crate) core: Arc<CompactionCore>,
    pub(crate) session: Arc<TestSession>,
    pub(crate) store: TestTableStore,
    pub(crate) db: Arc<TestDb>,
}

/// Spawn the subsystem against fresh in-memory collaborators, with retry
/// backoff disabled so fault-injection tests run at full speed.
pub(crate) fn spawn_harness() -> Harness {
    spawn_harness_with(Options::default().disable_compaction_backoff(true))
}

/// Spawn the subsystem with explicit options.
pub(crate) fn spawn_harness_with(options: Options) -> Harness {
    let store = TestTableStore::new();
    let session = Arc::new(TestSession::new(options, store.clone()));
    let db = Arc::new(TestDb::default());
    let handle = CompactionCore::spawn(
        Arc::clone(&session) as Arc<dyn Session>,
        Arc::new(store.clone()),
        Arc::clone(&db) as Arc<dyn DbHandle>,
    );
    let core = Arc::clone(handle.core());
    Harness {
        handle,
        core,
        session,
        store,
        db,
    }
}
