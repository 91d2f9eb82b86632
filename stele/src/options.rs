/// How an opened table file is backed in memory.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum LoadingMode {
    /// Read the whole file into an owned buffer at open.
    LoadToRam,
    /// Memory-map the file read-only.
    MemoryMap,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableOptions {
    pub table_size: u64,
    pub bloom_false_positive: f64,
    pub loading_mode: LoadingMode,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl TableOptions {
    #[inline]
    pub const fn new() -> Self {
        Self {
            table_size: 64 << 20,
            bloom_false_positive: 0.01,
            loading_mode: LoadingMode::LoadToRam,
        }
    }

    #[inline]
    pub const fn set_table_size(mut self, table_size: u64) -> Self {
        self.table_size = table_size;
        self
    }

    #[inline]
    pub const fn table_size(&self) -> u64 {
        self.table_size
    }

    #[inline]
    pub const fn set_bloom_false_positive(mut self, fp: f64) -> Self {
        self.bloom_false_positive = fp;
        self
    }

    #[inline]
    pub const fn bloom_false_positive(&self) -> f64 {
        self.bloom_false_positive
    }

    #[inline]
    pub const fn set_loading_mode(mut self, mode: LoadingMode) -> Self {
        self.loading_mode = mode;
        self
    }

    #[inline]
    pub const fn loading_mode(&self) -> LoadingMode {
        self.loading_mode
    }
}
