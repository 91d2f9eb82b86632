mod handler;

pub(crate) use handler::{assert_tables_order, get_tables_in_range, LevelHandler};

use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{select, tick};
use indexsort::sort_slice;
use kvtypes::{
    compare_key, key_with_ts, same_key, user_key, Key, KeyRange, Value, ValuePointer,
};
use rand::Rng;
use scopeguard::defer;
use stele::{
    new_filename, parse_file_id, Builder, ConcatTableIterator, MergeTableIterator, Table,
    TableIterator,
};
use strata_utils::{Closer, RateLimiter, RefCounter};

use crate::compaction::{
    get_key_range, CompactDef, CompactStatus, CompactionPriority, Decision,
};
use crate::discard::DiscardStats;
use crate::error::*;
use crate::iterator::{IteratorOptions, KvPair};
use crate::manifest::{sync_dir, Manifest, ManifestChange};
use crate::options::LevelsOptions;
use crate::oracle::Oracle;

/// Diagnostic snapshot of one resident table.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub id: u64,
    pub level: usize,
    pub left: Key,
    pub right: Key,
}

/// Per-compaction tally of dropped data: bytes per value log file (decoded
/// from indirect value pointers) and the total count of skipped records.
#[derive(Default)]
struct DiscardCollector {
    spaces: HashMap<u32, u64>,
    num_skips: u64,
}

impl DiscardCollector {
    fn collect(&mut self, vs: &Value) {
        if vs.is_value_pointer() {
            if let Some(vp) = ValuePointer::decode(&vs.value) {
                *self.spaces.entry(vp.fid).or_insert(0) += vp.len as u64;
            }
        }
        self.num_skips += 1;
    }
}

/// The first guard strictly greater than `key`, compared as raw bytes so a
/// versioned key sorts after its own user key.
fn search_guard(key: &[u8], guards: &[Bytes]) -> Option<Bytes> {
    let idx = indexsort::search(guards.len(), |i| key < guards[i].as_ref());
    guards.get(idx).cloned()
}

/// Whether the current output file must be cut before `key`: the key crossed
/// the active guard, or the builder is full. Only consulted when the user
/// key changes, so all versions of one key land in one file.
fn should_finish_file(key: &[u8], guard: Option<&[u8]>, builder: &Builder, max_size: u64) -> bool {
    if let Some(guard) = guard {
        if key > guard {
            return true;
        }
    }
    builder.reached_capacity(max_size)
}

#[inline]
fn before_end(key: &[u8], end: Option<&Key>) -> bool {
    end.map_or(true, |e| {
        compare_key(key, e.as_slice()) == core::cmp::Ordering::Less
    })
}

/// One bounded slice of a compaction's key space, sized for sub-compaction
/// planning.
struct RangeWithSize {
    start: Option<Key>,
    end: Option<Key>,
    size: usize,
}

impl CompactDef {
    /// Splits the compaction's key space at the bottom tables' boundaries,
    /// each bound widened to cover every version of its user key.
    fn get_input_bounds(&self) -> Vec<RangeWithSize> {
        let mut bounds = Vec::with_capacity(self.bot.len() + 1);
        for t in &self.bot {
            bounds.push(key_with_ts(user_key(t.smallest().as_slice()), u64::MAX));
        }
        bounds.push(key_with_ts(
            user_key(self.bot[self.bot.len() - 1].biggest().as_slice()),
            0,
        ));

        let mut ranges = Vec::with_capacity(bounds.len() - 1);
        for window in bounds.windows(2) {
            let (start, end) = (&window[0], &window[1]);
            let size = self.size_in_range(&self.top, self.this_level.level(), start, end)
                + self.size_in_range(&self.bot, self.next_level.level(), start, end);
            ranges.push(RangeWithSize {
                start: Some(start.clone()),
                end: Some(end.clone()),
                size,
            });
        }
        ranges.first_mut().unwrap().start = None;
        ranges.last_mut().unwrap().end = None;
        ranges
    }

    fn size_in_range(&self, tbls: &[Table], level: usize, start: &Key, end: &Key) -> usize {
        let (left, right) = if level != 0 {
            get_tables_in_range(tbls, start.as_slice(), end.as_slice())
        } else {
            (0, tbls.len())
        };
        tbls[left..right]
            .iter()
            .map(|t| {
                t.approximate_size_in_range(Some(start.as_slice()), Some(end.as_slice())) as usize
            })
            .sum()
    }
}

pub(crate) struct Core {
    next_file_id: AtomicU64,

    // The following are initialized once and const.
    levels: Vec<LevelHandler>,
    opts: LevelsOptions,

    cstatus: CompactStatus,
    manifest: Manifest,
    orc: RefCounter<Oracle>,
    discard: DiscardStats,
    limiter: RateLimiter,
}

/// Top-level orchestration of the level hierarchy: opens the directory
/// against the manifest, runs compaction workers, admits level-0 tables
/// (stalling when unhealthy) and dispatches reads across levels.
#[derive(Clone)]
#[repr(transparent)]
pub struct LevelsController {
    core: RefCounter<Core>,
}

/// Table file ids present in the directory.
fn get_id_map(dir: &std::path::Path) -> Result<HashSet<u64>> {
    let mut ids = HashSet::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(id) = parse_file_id(&entry.path()) {
            ids.insert(id);
        }
    }
    Ok(ids)
}

/// Reconciles the directory listing with the manifest: every referenced file
/// must exist; unreferenced table files are leftovers of abandoned
/// compactions and are removed.
fn revert_to_manifest(
    dir: &std::path::Path,
    mf_tables: &HashMap<u64, crate::manifest::TableManifest>,
    id_map: &HashSet<u64>,
    read_only: bool,
) -> Result<()> {
    for id in mf_tables.keys() {
        if !id_map.contains(id) {
            return Err(Error::Corruption(format!(
                "file does not exist for table {}",
                id
            )));
        }
    }

    for id in id_map {
        if !mf_tables.contains_key(id) {
            tracing::info!(target: "levels", id, "table file not referenced in manifest");
            if !read_only {
                std::fs::remove_file(new_filename(*id, dir))?;
            }
        }
    }
    Ok(())
}

impl LevelsController {
    /// Opens the level hierarchy in `opts.dir`: replays the manifest,
    /// reconciles it with the directory, loads every referenced table into
    /// its level and validates the result.
    pub fn open(
        opts: LevelsOptions,
        orc: RefCounter<Oracle>,
        discard: DiscardStats,
    ) -> Result<Self> {
        assert!(
            opts.num_level_zero_tables_stall > opts.num_level_zero_tables,
            "stall threshold must exceed the compaction trigger"
        );
        assert!(opts.max_levels >= 2, "need at least two levels");

        let manifest = Manifest::open(&opts.dir, opts.read_only)?;

        let mut levels = Vec::with_capacity(opts.max_levels);
        let mut max_total_size = 0i64;
        for i in 0..opts.max_levels {
            if i == 1 {
                // Level 1 probably shouldn't be much bigger than level 0.
                max_total_size = opts.level_one_size;
            } else if i > 1 {
                max_total_size *= opts.level_size_multiplier;
            }
            levels.push(LevelHandler::new(
                i,
                max_total_size,
                opts.num_level_zero_tables_stall,
            ));
        }

        let mf_tables = manifest.tables();
        revert_to_manifest(&opts.dir, &mf_tables, &get_id_map(&opts.dir)?, opts.read_only)?;

        let mut tables: Vec<Vec<Table>> = Vec::new();
        tables.resize_with(opts.max_levels, Vec::new);
        let mut max_file_id = 0u64;
        for (id, tm) in &mf_tables {
            let level = tm.level as usize;
            if level >= opts.max_levels {
                return Err(Error::Corruption(format!(
                    "manifest places table {} at level {}, max is {}",
                    id,
                    level,
                    opts.max_levels - 1
                )));
            }
            let fname = new_filename(*id, &opts.dir);
            let t = Table::open(&fname, &opts.table).map_err(|e| {
                tracing::error!(target: "levels", file = %fname.display(), err = %e, "opening table");
                Error::Table(e)
            })?;
            tables[level].push(t);
            max_file_id = max_file_id.max(*id);
        }

        let core = Core {
            next_file_id: AtomicU64::new(max_file_id + 1),
            levels,
            cstatus: CompactStatus::new(opts.max_levels),
            manifest,
            orc,
            discard,
            limiter: RateLimiter::new(opts.compaction_throughput),
            opts,
        };

        for (i, tbls) in tables.into_iter().enumerate() {
            core.levels[i].init_tables(tbls);
        }

        // Make sure key ranges do not overlap, and sizes add up.
        core.validate()?;

        // We may have removed files, and the manifest was possibly created.
        sync_dir(&core.opts.dir)?;

        Ok(Self {
            core: RefCounter::new(core),
        })
    }

    /// Spawns the background compaction workers; they drain on `closer`.
    pub fn start_compact(&self, closer: &Closer) {
        if self.core.opts.read_only {
            return;
        }
        let n = self.core.opts.num_compactors;
        closer.add_running(n);
        for _ in 0..n {
            let core = self.core.clone();
            let closer = closer.clone();
            std::thread::spawn(move || core.run_worker(closer));
        }
    }

    /// Admits a freshly built table to level 0, first recording it in the
    /// manifest. Blocks while level 0 is at its stall threshold; only a
    /// manifest append failure surfaces as an error.
    pub fn add_level0_table(&self, t: Table) -> Result<()> {
        // The manifest learns about the table before any level handler does,
        // so its create is ordered before the delete of whichever compaction
        // later consumes it.
        self.core
            .manifest
            .add_changes(vec![ManifestChange::Create {
                id: t.id(),
                level: 0,
            }])?;

        while !self.core.levels[0].try_add_level0_table(&t) {
            tracing::warn!(target: "levels", "stalled: waiting for level 0 compaction");
            let started = Instant::now();
            // Before unstalling, levels 0 and 1 must be healthy; this check
            // mirrors the planner's triggers so progress is monotone. Zero
            // delta treats running compactions as unfinished.
            loop {
                if !self.core.is_l0_compactable() && !self.core.levels[1].is_compactable(0) {
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            tracing::info!(target: "levels", stalled_for = ?started.elapsed(), "unstalled");
        }
        Ok(())
    }

    /// First valid value found scanning levels 0 upward.
    pub fn get(&self, key: &Key) -> Option<Value> {
        self.core.get(key)
    }

    /// Answers each pair from the shallowest level that has its key.
    pub fn multi_get(&self, pairs: &mut [KvPair]) {
        for h in &self.core.levels {
            h.multi_get(pairs);
        }
    }

    /// Appends every level's contribution to a merged scan, levels 0 upward.
    pub fn append_iterators(&self, out: &mut Vec<TableIterator>, opts: &IteratorOptions) {
        // Upward level order matters for the same reason as in `get`:
        // otherwise a concurrent compaction could hide or duplicate keys.
        for h in &self.core.levels {
            h.append_iterators(out, opts);
        }
    }

    /// Snapshot of every resident table, sorted by level then id.
    pub fn get_table_info(&self) -> Vec<TableInfo> {
        let mut infos = Vec::new();
        for h in &self.core.levels {
            let inner = h.read();
            for t in &inner.tables {
                infos.push(TableInfo {
                    id: t.id(),
                    level: h.level(),
                    left: t.smallest().clone(),
                    right: t.biggest().clone(),
                });
            }
        }
        infos.sort_by(|a, b| (a.level, a.id).cmp(&(b.level, b.id)));
        infos
    }

    /// The next unused table file id.
    pub fn reserve_file_id(&self) -> u64 {
        self.core.reserve_file_id()
    }

    /// A handle to the manifest shared with the rest of the engine.
    pub fn manifest(&self) -> &Manifest {
        &self.core.manifest
    }

    /// Releases every table reference without deleting files.
    pub fn close(&self) -> Result<()> {
        for h in &self.core.levels {
            h.close();
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &Core {
        &self.core
    }
}

impl Core {
    fn reserve_file_id(&self) -> u64 {
        self.next_file_id.fetch_add(1, Ordering::SeqCst)
    }

    fn validate(&self) -> Result<()> {
        for h in &self.levels {
            h.validate()?;
        }
        Ok(())
    }

    fn get(&self, key: &Key) -> Option<Value> {
        // Levels are consulted strictly from 0 upward. Reading them in any
        // other order could observe level L post-compaction and level L+1
        // pre-compaction, losing the key entirely.
        for h in &self.levels {
            if let Some(vs) = h.get(key) {
                return Some(vs);
            }
        }
        None
    }

    /// Returns true if level zero may be compacted, without accounting for
    /// compactions already happening.
    fn is_l0_compactable(&self) -> bool {
        self.levels[0].num_tables() >= self.opts.num_level_zero_tables
    }

    fn run_worker(&self, closer: Closer) {
        defer! {
            closer.done();
        }
        if self.opts.do_not_compact {
            return;
        }

        // Jitter the start so workers do not tick in lockstep.
        let jitter = rand::thread_rng().gen_range(0..1000);
        std::thread::sleep(Duration::from_millis(jitter));

        let ticker = tick(Duration::from_secs(1));
        loop {
            select! {
                recv(ticker) -> _ => {
                    for p in self.pick_compact_levels() {
                        match self.do_compact(&p) {
                            Ok(true) => break,
                            Ok(false) => {}
                            Err(e) => {
                                tracing::error!(
                                    target: "levels",
                                    level = p.level,
                                    err = %e,
                                    "compaction abandoned"
                                );
                            }
                        }
                    }
                }
                recv(closer.has_been_closed()) -> _ => return,
            }
        }
    }

    /// Scores the levels needing compaction, most urgent first. The criteria
    /// must stay identical to the stall check in `add_level0_table` to
    /// guarantee admission progress.
    fn pick_compact_levels(&self) -> Vec<CompactionPriority> {
        let mut prios = Vec::new();

        // Skip level 0 while one of its compactions is in flight.
        if !self.cstatus.overlaps_with(0, &KeyRange::infinite()) && self.is_l0_compactable() {
            prios.push(CompactionPriority {
                level: 0,
                score: self.levels[0].num_tables() as f64 / self.opts.num_level_zero_tables as f64,
            });
        }

        for level in 1..self.levels.len() {
            // Tables already being compacted away don't count.
            let delta = self.cstatus.delta_size(level);
            let l = &self.levels[level];
            if l.is_compactable(delta) {
                prios.push(CompactionPriority {
                    level,
                    score: (l.get_total_size() - delta) as f64 / l.max_total_size() as f64,
                });
            }
        }
        prios.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
        prios
    }

    /// Whether any level deeper than the compaction's target holds tables
    /// intersecting its input range. Decides tombstone retention.
    fn has_overlap_table(&self, cd: &CompactDef) -> bool {
        let kr = get_key_range(&cd.top);
        for h in &self.levels[cd.next_level.level() + 1..] {
            let inner = h.read();
            let (left, right) = inner.overlapping_tables(&kr);
            if right > left {
                return true;
            }
        }
        false
    }

    /// Reserves all of level 0 plus the overlapped stretch of level 1.
    fn fill_tables_l0(&self, cd: &mut CompactDef) -> bool {
        let this_level = cd.this_level.clone();
        let next_level = cd.next_level.clone();
        let this_inner = this_level.read();
        let next_inner = next_level.read();

        if this_inner.tables.is_empty() {
            return false;
        }

        cd.top = this_inner.tables.clone();
        cd.this_range = KeyRange::infinite();

        let kr = get_key_range(&cd.top);
        let (left, right) = next_inner.overlapping_tables(&kr);
        cd.bot = next_inner.tables[left..right].to_vec();
        cd.next_range = if cd.bot.is_empty() {
            kr
        } else {
            get_key_range(&cd.bot)
        };

        self.cstatus.compare_and_add(cd)
    }

    /// Picks one table of this level (biggest first) whose range is free,
    /// plus its overlap below, and reserves both.
    fn fill_tables(&self, cd: &mut CompactDef) -> bool {
        let this_level = cd.this_level.clone();
        let next_level = cd.next_level.clone();
        let this_inner = this_level.read();
        let next_inner = next_level.read();

        if this_inner.tables.is_empty() {
            return false;
        }

        let mut tbls = this_inner.tables.clone();
        sort_slice(&mut tbls, |d, i, j| d[i].size() > d[j].size());

        for t in &tbls {
            cd.this_size = t.size() as i64;
            // All versions of the boundary user keys belong to this
            // compaction; version zero is the rightmost key.
            cd.this_range = KeyRange::new(
                key_with_ts(user_key(t.smallest().as_slice()), u64::MAX),
                key_with_ts(user_key(t.biggest().as_slice()), 0),
            );
            if self
                .cstatus
                .overlaps_with(cd.this_level.level(), &cd.this_range)
            {
                continue;
            }
            cd.top = vec![t.clone()];

            let (left, right) = next_inner.overlapping_tables(&cd.this_range);
            cd.bot = next_inner.tables[left..right].to_vec();

            if cd.bot.is_empty() {
                cd.next_range = cd.this_range.clone();
                if !self.cstatus.compare_and_add(cd) {
                    continue;
                }
                return true;
            }
            cd.next_range = get_key_range(&cd.bot);

            if self
                .cstatus
                .overlaps_with(cd.next_level.level(), &cd.next_range)
            {
                continue;
            }
            if !self.cstatus.compare_and_add(cd) {
                continue;
            }
            return true;
        }
        false
    }

    /// Merges the compaction inputs into a sequence of new tables for the
    /// next level, restricted to `[start, end)` when sub-compacting.
    ///
    /// Returns the tables plus a move-down flag; when set, the single input
    /// table is reused unchanged.
    fn compact_build_tables(
        &self,
        level: usize,
        cd: &CompactDef,
        start: Option<&Key>,
        end: Option<&Key>,
    ) -> Result<(Vec<Table>, bool)> {
        let has_overlap = self.has_overlap_table(cd);
        tracing::info!(
            target: "levels",
            level,
            has_overlap,
            top = cd.top.len(),
            bot = cd.bot.len(),
            "compacting"
        );

        if level > 0 {
            assert_tables_order(&cd.top);
            assert_tables_order(&cd.bot);
            debug_assert_eq!(cd.top.len(), 1);
        }

        // With nothing to merge below, the table moves down as-is; the
        // manifest records a level reassignment instead of create/delete.
        if level > 0 && cd.bot.is_empty() && start.is_none() && end.is_none() {
            return Ok((vec![cd.top[0].clone()], true));
        }

        let mut discard = DiscardCollector::default();

        let mut iters: Vec<TableIterator> = Vec::new();
        if level == 0 {
            // Newest table first; it takes precedence on equal keys.
            for t in cd.top.iter().rev() {
                iters.push(t.iter(false).into());
            }
        } else {
            iters.push(cd.top[0].iter(false).into());
        }
        // The next level's tables don't overlap; one concatenated source.
        iters.push(ConcatTableIterator::new(cd.bot.clone(), false).into());
        let mut it = MergeTableIterator::new(iters, false);
        match start {
            Some(k) => it.seek(k.as_slice()),
            None => it.rewind(),
        }

        // Versions at or below this are invisible to every open transaction.
        // Discarding any version above it would break snapshot reads.
        let min_read_ts = self.orc.min_read_ts();

        let mut filter = self
            .opts
            .compaction_filter_factory
            .as_ref()
            .map(|factory| factory());
        let guards = filter.as_ref().map(|f| f.guards()).unwrap_or_default();

        let mut last_key: Vec<u8> = Vec::new();
        let mut skip_key: Vec<u8> = Vec::new();
        let mut new_tables: Vec<Table> = Vec::new();

        while it.valid() && before_end(it.key(), end) {
            let started = Instant::now();
            let file_id = self.reserve_file_id();
            let mut builder = Builder::new(self.opts.table.clone());
            let mut curr_guard: Option<Bytes> = None;
            let mut num_keys = 0u64;

            while it.valid() && before_end(it.key(), end) {
                let key = Key::copy_from_slice(it.key());
                let vs = it.value();

                // Older versions of an already-resolved user key.
                if !skip_key.is_empty() {
                    if same_key(key.as_slice(), &skip_key) {
                        discard.collect(&vs);
                        it.next();
                        continue;
                    }
                    skip_key.clear();
                }

                if curr_guard.is_none() && !guards.is_empty() {
                    curr_guard = search_guard(key.as_slice(), &guards);
                }

                if !same_key(key.as_slice(), &last_key) {
                    if should_finish_file(
                        key.as_slice(),
                        curr_guard.as_deref(),
                        &builder,
                        self.opts.max_table_size,
                    ) {
                        break;
                    }
                    last_key = key.as_slice().to_vec();
                }

                let version = key.parse_timestamp();
                if version <= min_read_ts {
                    // The newest visible version of this user key; all the
                    // older ones get skipped.
                    skip_key = key.as_slice().to_vec();

                    if vs.is_deleted() {
                        // The tombstone still shadows versions in deeper
                        // levels, if there are any; otherwise it is spent.
                        if !has_overlap {
                            it.next();
                            continue;
                        }
                    } else if let Some(f) = filter.as_mut() {
                        match f.filter(key.as_slice(), &vs.value, vs.user_meta) {
                            Decision::MarkTombstone => {
                                discard.collect(&vs);
                                if has_overlap {
                                    // Deeper levels may hold old versions;
                                    // convert to a delete tombstone.
                                    builder.insert(&key, &Value::tombstone());
                                }
                                it.next();
                                continue;
                            }
                            Decision::Drop => {
                                discard.collect(&vs);
                                it.next();
                                continue;
                            }
                            Decision::Keep => {}
                        }
                    }
                }

                num_keys += 1;
                builder.insert(&key, &vs);
                it.next();
            }

            tracing::info!(
                target: "levels",
                num_keys,
                skipped = discard.num_skips,
                took = ?started.elapsed(),
                "compaction iteration"
            );

            if builder.is_empty() {
                continue;
            }
            let t = Table::create(new_filename(file_id, &self.opts.dir), builder, &self.limiter)?;
            if t.is_empty() {
                t.mark_delete();
            } else {
                new_tables.push(t);
            }
        }

        // Created files' directory entries must be visible before the
        // manifest publishes them.
        sync_dir(&self.opts.dir)?;

        sort_slice(&mut new_tables, |d, i, j| d[i].biggest() < d[j].biggest());
        self.discard.update_gc_stats(&discard.spaces);
        tracing::info!(
            target: "levels",
            vlog_files = discard.spaces.len(),
            skipped = discard.num_skips,
            "discard stats collected"
        );
        Ok((new_tables, false))
    }

    fn should_start_sub_compaction(&self, cd: &CompactDef) -> bool {
        if self.opts.max_sub_compaction <= 1 || cd.bot.is_empty() {
            return false;
        }
        if cd.this_level.level() == 0 {
            return true;
        }
        if cd.this_level.level() == 1 {
            // Only large level-1 compactions are worth the fan-out.
            return cd.bot.len() + cd.top.len() >= 10;
        }
        false
    }

    /// The number of parallel jobs and the byte size each should cover.
    fn determine_sub_compact_plan(&self, bounds: &[RangeWithSize]) -> (usize, usize) {
        let mut n = self.opts.max_sub_compaction.min(bounds.len());

        let size: usize = bounds.iter().map(|b| b.size).sum();
        const MIN_FILE_FILL_PERCENT: f64 = 4.0 / 5.0;
        let max_output_files =
            (size as f64 / MIN_FILE_FILL_PERCENT / self.opts.max_table_size as f64).ceil() as usize;
        if max_output_files < n {
            n = max_output_files;
        }
        if n <= 1 {
            return (1, size);
        }
        (n, size / n)
    }

    /// Shards one compaction across scoped threads by contiguous key-range
    /// chunks of roughly equal byte size, concatenating the outputs in order.
    fn run_sub_compacts(&self, level: usize, cd: &CompactDef) -> Result<(Vec<Table>, bool)> {
        let bounds = cd.get_input_bounds();
        let (num_jobs, avg_size) = self.determine_sub_compact_plan(&bounds);
        if num_jobs <= 1 {
            return self.compact_build_tables(level, cd, None, None);
        }

        let mut jobs: Vec<(Option<Key>, Option<Key>)> = Vec::new();
        let mut current = 0usize;
        let mut begin = 0usize;
        for (i, bound) in bounds.iter().enumerate() {
            current += bound.size;
            if current >= avg_size || i == bounds.len() - 1 {
                jobs.push((bounds[begin].start.clone(), bounds[i].end.clone()));
                current = 0;
                begin = i + 1;
            }
        }
        tracing::info!(target: "levels", jobs = jobs.len(), "started sub-compaction jobs");

        let results: Vec<Result<(Vec<Table>, bool)>> = std::thread::scope(|s| {
            let handles: Vec<_> = jobs
                .iter()
                .map(|(start, end)| {
                    s.spawn(move || {
                        self.compact_build_tables(level, cd, start.as_ref(), end.as_ref())
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let mut new_tables = Vec::new();
        for result in results {
            let (tables, _) = result?;
            new_tables.extend(tables);
        }
        Ok((new_tables, false))
    }

    fn build_change_set(
        cd: &CompactDef,
        new_tables: &[Table],
        move_down: bool,
    ) -> Vec<ManifestChange> {
        let mut changes = Vec::new();
        if move_down {
            for t in new_tables {
                changes.push(ManifestChange::MoveDown {
                    id: t.id(),
                    level: cd.next_level.level() as u32,
                });
            }
        } else {
            for t in new_tables {
                changes.push(ManifestChange::Create {
                    id: t.id(),
                    level: cd.next_level.level() as u32,
                });
            }
            for t in cd.top.iter().chain(cd.bot.iter()) {
                changes.push(ManifestChange::Delete { id: t.id() });
            }
        }
        changes
    }

    fn run_compact_def(&self, level: usize, cd: &CompactDef) -> Result<()> {
        let started = Instant::now();

        let (new_tables, move_down) = if self.should_start_sub_compaction(cd) {
            self.run_sub_compacts(level, cd)?
        } else {
            self.compact_build_tables(level, cd, None, None)?
        };

        let change_set = Self::build_change_set(cd, &new_tables, move_down);

        // The manifest is written before any file is deleted and after every
        // file was created. An append failure here leaves the in-memory
        // state about to diverge from disk; there is no safe recovery.
        if let Err(e) = self.manifest.add_changes(change_set) {
            tracing::error!(target: "levels", err = %e, "manifest append failed");
            panic!("manifest append failed: {}", e);
        }

        if !move_down {
            // Deletion is now durably decided; files disappear once the
            // handlers and any in-flight readers release them.
            for t in cd.top.iter().chain(cd.bot.iter()) {
                t.mark_delete();
            }
        }

        // Install order pairs with the read path's level order: a reader
        // sees the data in the next level before it vanishes from this one.
        cd.next_level.replace_tables(&new_tables);
        cd.this_level.delete_tables(&cd.top);

        tracing::info!(
            target: "levels",
            from = level,
            to = level + 1,
            deleted = cd.top.len() + cd.bot.len(),
            added = new_tables.len(),
            took = ?started.elapsed(),
            "compaction finished"
        );
        Ok(())
    }

    /// Picks and runs one compaction for the given priority. `Ok(false)`
    /// means the planner lost the admission race and nothing happened.
    fn do_compact(&self, p: &CompactionPriority) -> Result<bool> {
        let level = p.level;
        assert!(level + 1 < self.opts.max_levels);

        let mut cd = CompactDef::new(self.levels[level].clone(), self.levels[level + 1].clone());
        tracing::info!(target: "levels", level, score = p.score, "got compaction priority");

        let filled = if level == 0 {
            self.fill_tables_l0(&mut cd)
        } else {
            self.fill_tables(&mut cd)
        };
        if !filled {
            tracing::debug!(target: "levels", level, "no tables to fill");
            return Ok(false);
        }

        let result = self.run_compact_def(level, &cd);
        // Whatever happened, the reserved ranges are released; the planner
        // retries on the next tick.
        self.cstatus.delete(&cd);

        match result {
            Ok(()) => {
                tracing::info!(target: "levels", level, "compaction done");
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests;
