use std::collections::HashSet;

use crate::error::*;
use crate::iterator::{IteratorOptions, KvPair};
use indexsort::{search, sort_slice};
use kvtypes::{compare_key, Key, KeyRange, Value};
use parking_lot::{RwLock, RwLockReadGuard};
use stele::{bloom, ConcatTableIterator, Table, TableIterator};
use strata_utils::RefCounter;

/// Owns the sorted table set of one level.
///
/// For level >= 1, tables are sorted by key range and do not overlap. For
/// level 0, tables are sorted by file id; the newest table is at the back
/// and shadows older ones.
#[derive(Clone)]
pub(crate) struct LevelHandler {
    inner: RefCounter<RwLock<Inner>>,

    // The following are initialized once and const.
    level: usize,
    max_total_size: i64,
    num_level_zero_tables_stall: usize,
}

pub(crate) struct Inner {
    pub(crate) tables: Vec<Table>,
    pub(crate) total_size: i64,
}

impl Inner {
    /// The half-open index interval of tables intersecting `kr`. The caller
    /// holds this level's read lock by construction, having obtained `self`
    /// from [`LevelHandler::read`].
    pub(crate) fn overlapping_tables(&self, kr: &KeyRange) -> (usize, usize) {
        if kr.left.is_empty() || kr.right.is_empty() {
            return (0, 0);
        }
        get_tables_in_range(&self.tables, kr.left.as_slice(), kr.right.as_slice())
    }
}

/// The half-open index interval of `tbls` intersecting `[start, end]`.
pub(crate) fn get_tables_in_range(tbls: &[Table], start: &[u8], end: &[u8]) -> (usize, usize) {
    let left = search(tbls.len(), |i| {
        compare_key(start, tbls[i].biggest().as_slice()) != core::cmp::Ordering::Greater
    });
    let right = search(tbls.len(), |i| {
        compare_key(end, tbls[i].smallest().as_slice()) == core::cmp::Ordering::Less
    });
    (left, right)
}

/// Panics unless the tables are individually well formed, sorted and
/// pairwise disjoint. Never called for level 0, where overlap is expected.
pub(crate) fn assert_tables_order(tables: &[Table]) {
    for i in 0..tables.len().saturating_sub(1) {
        assert!(
            tables[i].smallest() <= tables[i].biggest(),
            "table {} inverted: smallest {:?} > biggest {:?}",
            tables[i].id(),
            tables[i].smallest().as_slice(),
            tables[i].biggest().as_slice(),
        );
        assert!(
            tables[i].biggest() < tables[i + 1].smallest(),
            "tables {} and {} overlap: {:?} >= {:?}",
            tables[i].id(),
            tables[i + 1].id(),
            tables[i].biggest().as_slice(),
            tables[i + 1].smallest().as_slice(),
        );
    }
}

impl LevelHandler {
    pub(crate) fn new(
        level: usize,
        max_total_size: i64,
        num_level_zero_tables_stall: usize,
    ) -> Self {
        Self {
            inner: RefCounter::new(RwLock::new(Inner {
                tables: Vec::new(),
                total_size: 0,
            })),
            level,
            max_total_size,
            num_level_zero_tables_stall,
        }
    }

    #[inline]
    pub(crate) fn level(&self) -> usize {
        self.level
    }

    #[inline]
    pub(crate) fn max_total_size(&self) -> i64 {
        self.max_total_size
    }

    #[inline]
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read()
    }

    #[inline]
    pub(crate) fn get_total_size(&self) -> i64 {
        self.inner.read().total_size
    }

    #[inline]
    pub(crate) fn num_tables(&self) -> usize {
        self.inner.read().tables.len()
    }

    /// Whether this level carries more data than its target, discounting
    /// `delta` bytes already claimed by running compactions.
    #[inline]
    pub(crate) fn is_compactable(&self, delta: i64) -> bool {
        self.get_total_size() >= self.max_total_size + delta
    }

    /// Replaces the whole table set. Done during loading.
    pub(crate) fn init_tables(&self, tables: Vec<Table>) {
        let mut inner = self.inner.write();
        inner.total_size = tables.iter().map(|t| t.size() as i64).sum();
        inner.tables = tables;

        if self.level == 0 {
            // Key ranges overlap; sort by file id, newer tables at the back.
            sort_slice(&mut inner.tables, |d, i, j| d[i].id() < d[j].id());
        } else {
            sort_slice(&mut inner.tables, |d, i, j| {
                d[i].smallest() < d[j].smallest()
            });
        }
    }

    /// Returns true if the table was admitted without stalling.
    pub(crate) fn try_add_level0_table(&self, t: &Table) -> bool {
        assert_eq!(self.level, 0);

        // Needs the lock: a level-0 compaction may be deleting tables.
        let mut inner = self.inner.write();
        if inner.tables.len() >= self.num_level_zero_tables_stall {
            return false;
        }

        inner.total_size += t.size() as i64;
        inner.tables.push(t.clone());
        true
    }

    /// Removes the given tables, preserving order. Table references are
    /// released after the lock is dropped; closing files can be slow.
    pub(crate) fn delete_tables(&self, to_del: &[Table]) {
        let mut inner = self.inner.write();

        let to_del_ids: HashSet<u64> = to_del.iter().map(|t| t.id()).collect();
        let old = std::mem::take(&mut inner.tables);
        let mut removed = Vec::with_capacity(to_del.len());
        let mut kept = Vec::with_capacity(old.len());
        for t in old {
            if to_del_ids.contains(&t.id()) {
                inner.total_size -= t.size() as i64;
                removed.push(t);
            } else {
                kept.push(t);
            }
        }
        inner.tables = kept;

        // New level-0 tables can arrive mid-compaction, so only the sorted
        // levels are checked.
        if self.level != 0 {
            assert_tables_order(&inner.tables);
        }

        drop(inner);
        drop(removed);
    }

    /// Splices `new_tables` over the stretch of existing tables their key
    /// range covers. Callers must already have recorded the change in the
    /// manifest. Replaced tables are released after the lock is dropped.
    pub(crate) fn replace_tables(&self, new_tables: &[Table]) {
        if new_tables.is_empty() {
            return;
        }
        assert_tables_order(new_tables);

        // The overlapped stretch is re-searched under the lock: other
        // compactions may have shifted the indices since planning.
        let mut inner = self.inner.write();

        for t in new_tables {
            inner.total_size += t.size() as i64;
        }

        let kr = KeyRange::new(
            new_tables[0].smallest().clone(),
            new_tables[new_tables.len() - 1].biggest().clone(),
        );
        let (left, right) = inner.overlapping_tables(&kr);

        let mut tables =
            Vec::with_capacity(inner.tables.len() - (right - left) + new_tables.len());
        tables.extend_from_slice(&inner.tables[..left]);
        tables.extend_from_slice(new_tables);
        tables.extend_from_slice(&inner.tables[right..]);

        let old = std::mem::replace(&mut inner.tables, tables);
        for t in &old[left..right] {
            inner.total_size -= t.size() as i64;
        }
        assert_tables_order(&inner.tables);

        drop(inner);
        drop(old);
    }

    /// The tables that may hold `key`, each kept alive by the returned
    /// reference. Level 0 returns every table newest first; deeper levels
    /// return the single candidate.
    fn ref_tables_for_key(&self, key: &Key) -> Vec<Table> {
        let inner = self.inner.read();
        if self.level == 0 {
            // Copy out so the lock is not held while seeking in tables.
            // Reversed: the newest table takes precedence.
            inner.tables.iter().rev().cloned().collect()
        } else {
            match ref_level_n_table(&inner.tables, key) {
                Some(t) => vec![t],
                None => Vec::new(),
            }
        }
    }

    fn get_in_table(key: &Key, hash: u32, t: &Table) -> Option<Value> {
        if t.does_not_have(hash) {
            return None;
        }
        t.point_get(key).map(|(_, v)| v)
    }

    /// The newest version visible at `key` in this level, or `None`.
    pub(crate) fn get(&self, key: &Key) -> Option<Value> {
        let hash = bloom::hash(key.parse_key());
        for t in self.ref_tables_for_key(key) {
            if let Some(v) = Self::get_in_table(key, hash, &t) {
                return Some(v);
            }
        }
        None
    }

    /// Answers every still-unfound pair this level can.
    pub(crate) fn multi_get(&self, pairs: &mut [KvPair]) {
        if self.level == 0 {
            let tables: Vec<Table> = {
                let inner = self.inner.read();
                inner.tables.iter().rev().cloned().collect()
            };
            for t in &tables {
                for pair in pairs.iter_mut() {
                    if pair.found() {
                        continue;
                    }
                    let key = pair.key().as_slice();
                    if compare_key(key, t.smallest().as_slice()) == core::cmp::Ordering::Less
                        || compare_key(key, t.biggest().as_slice())
                            == core::cmp::Ordering::Greater
                    {
                        continue;
                    }
                    let hash = bloom::hash(pair.key().parse_key());
                    if let Some(v) = Self::get_in_table(pair.key(), hash, t) {
                        pair.set(v);
                    }
                }
            }
        } else {
            let tables: Vec<Option<Table>> = {
                let inner = self.inner.read();
                pairs
                    .iter()
                    .map(|p| {
                        if p.found() {
                            None
                        } else {
                            ref_level_n_table(&inner.tables, p.key())
                        }
                    })
                    .collect()
            };
            for (pair, t) in pairs.iter_mut().zip(tables) {
                let Some(t) = t else { continue };
                let hash = bloom::hash(pair.key().parse_key());
                if let Some(v) = Self::get_in_table(pair.key(), hash, &t) {
                    pair.set(v);
                }
            }
        }
    }

    /// Appends this level's contribution to a merged scan. Level 0 emits one
    /// iterator per table, newest first; deeper levels emit one concatenated
    /// iterator over the in-bounds tables.
    pub(crate) fn append_iterators(&self, out: &mut Vec<TableIterator>, opts: &IteratorOptions) {
        let inner = self.inner.read();
        if self.level == 0 {
            for t in inner.tables.iter().rev() {
                if opts.pick_table(t) {
                    out.push(t.iter(opts.reverse).into());
                }
            }
            return;
        }
        let tables = opts.pick_tables(&inner.tables);
        if !tables.is_empty() {
            out.push(ConcatTableIterator::new(tables, opts.reverse).into());
        }
    }

    /// Checks the sorted-level invariants, as an error rather than a panic;
    /// used when loading an existing directory.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.level == 0 {
            return Ok(());
        }
        let inner = self.inner.read();
        let mut computed = 0i64;
        for i in 0..inner.tables.len() {
            computed += inner.tables[i].size() as i64;
            if i + 1 == inner.tables.len() {
                continue;
            }
            if inner.tables[i].biggest() >= inner.tables[i + 1].smallest() {
                return Err(Error::Corruption(format!(
                    "level {}: tables {} and {} overlap",
                    self.level,
                    inner.tables[i].id(),
                    inner.tables[i + 1].id(),
                )));
            }
        }
        if computed != inner.total_size {
            return Err(Error::Corruption(format!(
                "level {}: size accounting off, computed {} recorded {}",
                self.level, computed, inner.total_size,
            )));
        }
        Ok(())
    }

    /// Drops every table reference without deleting files.
    pub(crate) fn close(&self) {
        let mut inner = self.inner.write();
        let old = std::mem::take(&mut inner.tables);
        inner.total_size = 0;
        drop(inner);
        drop(old);
    }
}

/// Binary search for the one table at a sorted level whose range contains
/// `key`; takes a reference for the caller.
fn ref_level_n_table(tables: &[Table], key: &Key) -> Option<Table> {
    let idx = search(tables.len(), |i| {
        compare_key(tables[i].biggest().as_slice(), key.as_slice())
            != core::cmp::Ordering::Less
    });
    if idx >= tables.len() {
        // The key is strictly greater than every table here.
        return None;
    }
    Some(tables[idx].clone())
}
