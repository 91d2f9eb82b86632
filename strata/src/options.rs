use crate::compaction::CompactionFilter;
use std::path::PathBuf;
use std::sync::Arc;
use stele::TableOptions;

/// A factory producing one filter instance per compaction run.
pub type CompactionFilterFactory = Arc<dyn Fn() -> Box<dyn CompactionFilter> + Send + Sync>;

#[derive(Clone)]
pub struct LevelsOptions {
    pub dir: PathBuf,
    pub max_levels: usize,
    pub num_level_zero_tables: usize,
    pub num_level_zero_tables_stall: usize,
    pub level_one_size: i64,
    pub level_size_multiplier: i64,
    pub max_table_size: u64,
    pub num_compactors: usize,
    pub max_sub_compaction: usize,
    pub read_only: bool,
    pub do_not_compact: bool,
    /// Bytes per second shared by all table builders; 0 disables pacing.
    pub compaction_throughput: u64,
    pub table: TableOptions,
    pub compaction_filter_factory: Option<CompactionFilterFactory>,
}

impl core::fmt::Debug for LevelsOptions {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LevelsOptions")
            .field("dir", &self.dir)
            .field("max_levels", &self.max_levels)
            .field("num_level_zero_tables", &self.num_level_zero_tables)
            .field(
                "num_level_zero_tables_stall",
                &self.num_level_zero_tables_stall,
            )
            .field("level_one_size", &self.level_one_size)
            .field("level_size_multiplier", &self.level_size_multiplier)
            .field("max_table_size", &self.max_table_size)
            .field("num_compactors", &self.num_compactors)
            .field("max_sub_compaction", &self.max_sub_compaction)
            .field("read_only", &self.read_only)
            .field("do_not_compact", &self.do_not_compact)
            .field("compaction_throughput", &self.compaction_throughput)
            .field("table", &self.table)
            .field(
                "compaction_filter_factory",
                &self.compaction_filter_factory.is_some(),
            )
            .finish()
    }
}

impl Default for LevelsOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl LevelsOptions {
    #[inline]
    pub fn new() -> Self {
        Self {
            dir: std::env::temp_dir().join("strata"),
            max_levels: 7,
            num_level_zero_tables: 5,
            num_level_zero_tables_stall: 10,
            level_one_size: 256 << 20,
            level_size_multiplier: 10,
            max_table_size: 64 << 20,
            num_compactors: 3,
            max_sub_compaction: 1,
            read_only: false,
            do_not_compact: false,
            compaction_throughput: 0,
            table: TableOptions::new(),
            compaction_filter_factory: None,
        }
    }

    #[inline]
    pub fn set_dir(mut self, dir: PathBuf) -> Self {
        self.dir = dir;
        self
    }

    #[inline]
    pub const fn dir(&self) -> &PathBuf {
        &self.dir
    }

    #[inline]
    pub const fn set_max_levels(mut self, max_levels: usize) -> Self {
        self.max_levels = max_levels;
        self
    }

    #[inline]
    pub const fn max_levels(&self) -> usize {
        self.max_levels
    }

    #[inline]
    pub const fn set_num_level_zero_tables(mut self, n: usize) -> Self {
        self.num_level_zero_tables = n;
        self
    }

    #[inline]
    pub const fn num_level_zero_tables(&self) -> usize {
        self.num_level_zero_tables
    }

    #[inline]
    pub const fn set_num_level_zero_tables_stall(mut self, n: usize) -> Self {
        self.num_level_zero_tables_stall = n;
        self
    }

    #[inline]
    pub const fn num_level_zero_tables_stall(&self) -> usize {
        self.num_level_zero_tables_stall
    }

    #[inline]
    pub const fn set_level_one_size(mut self, size: i64) -> Self {
        self.level_one_size = size;
        self
    }

    #[inline]
    pub const fn level_one_size(&self) -> i64 {
        self.level_one_size
    }

    #[inline]
    pub const fn set_level_size_multiplier(mut self, multiplier: i64) -> Self {
        self.level_size_multiplier = multiplier;
        self
    }

    #[inline]
    pub const fn level_size_multiplier(&self) -> i64 {
        self.level_size_multiplier
    }

    #[inline]
    pub const fn set_max_table_size(mut self, size: u64) -> Self {
        self.max_table_size = size;
        self
    }

    #[inline]
    pub const fn max_table_size(&self) -> u64 {
        self.max_table_size
    }

    #[inline]
    pub const fn set_num_compactors(mut self, n: usize) -> Self {
        self.num_compactors = n;
        self
    }

    #[inline]
    pub const fn num_compactors(&self) -> usize {
        self.num_compactors
    }

    #[inline]
    pub const fn set_max_sub_compaction(mut self, n: usize) -> Self {
        self.max_sub_compaction = n;
        self
    }

    #[inline]
    pub const fn max_sub_compaction(&self) -> usize {
        self.max_sub_compaction
    }

    #[inline]
    pub const fn set_read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    #[inline]
    pub const fn read_only(&self) -> bool {
        self.read_only
    }

    #[inline]
    pub const fn set_do_not_compact(mut self) -> Self {
        self.do_not_compact = true;
        self
    }

    #[inline]
    pub const fn do_not_compact(&self) -> bool {
        self.do_not_compact
    }

    #[inline]
    pub const fn set_compaction_throughput(mut self, bytes_per_sec: u64) -> Self {
        self.compaction_throughput = bytes_per_sec;
        self
    }

    #[inline]
    pub fn set_table_options(mut self, table: TableOptions) -> Self {
        self.table = table;
        self
    }

    #[inline]
    pub fn set_compaction_filter_factory(mut self, factory: CompactionFilterFactory) -> Self {
        self.compaction_filter_factory = Some(factory);
        self
    }
}
