use crate::levels::LevelHandler;
use bytes::Bytes;
use kvtypes::{key_with_ts, user_key, KeyRange};
use parking_lot::RwLock;
use stele::Table;

/// Verdict of a [`CompactionFilter`] for one record.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Decision {
    Keep,
    Drop,
    MarkTombstone,
}

/// A user-supplied hook consulted for every record whose version has fallen
/// below the read horizon during a compaction.
pub trait CompactionFilter: Send {
    /// Sorted user keys at which output files must be split, regardless of
    /// their size.
    fn guards(&self) -> Vec<Bytes> {
        Vec::new()
    }

    fn filter(&mut self, key: &[u8], value: &[u8], user_meta: u8) -> Decision;
}

#[derive(Debug, Clone)]
pub(crate) struct CompactionPriority {
    pub(crate) level: usize,
    pub(crate) score: f64,
}

/// Everything one compaction needs: the two levels, the chosen table sets
/// and the key ranges reserved for them.
pub(crate) struct CompactDef {
    pub(crate) this_level: LevelHandler,
    pub(crate) next_level: LevelHandler,
    pub(crate) top: Vec<Table>,
    pub(crate) bot: Vec<Table>,
    pub(crate) this_range: KeyRange,
    pub(crate) next_range: KeyRange,
    pub(crate) this_size: i64,
}

impl CompactDef {
    pub(crate) fn new(this_level: LevelHandler, next_level: LevelHandler) -> Self {
        Self {
            this_level,
            next_level,
            top: Vec::new(),
            bot: Vec::new(),
            this_range: KeyRange::default(),
            next_range: KeyRange::default(),
            this_size: 0,
        }
    }
}

/// The union of the tables' ranges, widened so that every version of the
/// boundary user keys falls inside: version timestamps sort descending, so
/// `user@MAX` and `user@0` are the inclusive version bounds of `user`.
pub(crate) fn get_key_range(tables: &[Table]) -> KeyRange {
    if tables.is_empty() {
        return KeyRange::default();
    }
    let mut smallest = tables[0].smallest();
    let mut biggest = tables[0].biggest();
    for t in &tables[1..] {
        if t.smallest() < smallest {
            smallest = t.smallest();
        }
        if t.biggest() > biggest {
            biggest = t.biggest();
        }
    }
    KeyRange::new(
        key_with_ts(user_key(smallest.as_slice()), u64::MAX),
        key_with_ts(user_key(biggest.as_slice()), 0),
    )
}

#[derive(Debug, Default)]
pub(crate) struct LevelCompactStatus {
    pub(crate) ranges: Vec<KeyRange>,
    pub(crate) delta_size: i64,
}

impl LevelCompactStatus {
    fn overlaps_with(&self, range: &KeyRange) -> bool {
        self.ranges.iter().any(|r| r.overlaps_with(range))
    }

    fn remove(&mut self, target: &KeyRange) -> bool {
        let before = self.ranges.len();
        let mut removed_one = false;
        self.ranges.retain(|r| {
            if !removed_one && r == target {
                removed_one = true;
                false
            } else {
                true
            }
        });
        self.ranges.len() < before
    }
}

/// Reserved key ranges of in-flight compactions, per level. Planner picks
/// are advisory; admission happens here, under one lock, so two workers
/// racing for overlapping work cannot both win.
pub(crate) struct CompactStatus {
    levels: RwLock<Vec<LevelCompactStatus>>,
}

impl CompactStatus {
    pub(crate) fn new(max_levels: usize) -> Self {
        let mut levels = Vec::with_capacity(max_levels);
        levels.resize_with(max_levels, LevelCompactStatus::default);
        Self {
            levels: RwLock::new(levels),
        }
    }

    pub(crate) fn overlaps_with(&self, level: usize, range: &KeyRange) -> bool {
        self.levels.read()[level].overlaps_with(range)
    }

    pub(crate) fn delta_size(&self, level: usize) -> i64 {
        self.levels.read()[level].delta_size
    }

    /// Re-checks both ranges under the exclusive lock and reserves them if
    /// still clear. A `false` means another worker won the race; the caller
    /// picks a different candidate.
    pub(crate) fn compare_and_add(&self, cd: &CompactDef) -> bool {
        let mut levels = self.levels.write();
        let this = cd.this_level.level();
        let next = cd.next_level.level();
        assert!(
            next < levels.len(),
            "level {} out of bounds, max {}",
            next,
            levels.len()
        );

        if levels[this].overlaps_with(&cd.this_range) {
            return false;
        }
        if levels[next].overlaps_with(&cd.next_range) {
            return false;
        }
        // The planner already did the size checks; admission only arbitrates
        // range conflicts.
        levels[this].ranges.push(cd.this_range.clone());
        levels[next].ranges.push(cd.next_range.clone());
        levels[next].delta_size += cd.this_size;
        true
    }

    /// Releases exactly the ranges reserved by `compare_and_add`.
    pub(crate) fn delete(&self, cd: &CompactDef) {
        let mut levels = self.levels.write();
        let this = cd.this_level.level();
        let next = cd.next_level.level();
        assert!(
            this < levels.len(),
            "level {} out of bounds, max {}",
            this,
            levels.len()
        );

        levels[next].delta_size -= cd.this_size;
        let mut found = levels[this].remove(&cd.this_range);
        if this != next && !cd.next_range.is_empty() {
            found = levels[next].remove(&cd.next_range) && found;
        }
        if !found {
            tracing::warn!(
                target: "compaction",
                this_range = %cd.this_range,
                next_range = %cd.next_range,
                "releasing a compaction that was never reserved"
            );
        }
    }
}
