use parking_lot::Mutex;
use std::collections::HashMap;
use strata_utils::RefCounter;

/// Per value-log-file byte counts of data that compaction has discarded.
/// The value log garbage collector reads these to pick rewrite victims.
#[derive(Debug, Clone)]
#[repr(transparent)]
pub struct DiscardStats {
    inner: RefCounter<Mutex<HashMap<u32, u64>>>,
}

impl Default for DiscardStats {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscardStats {
    #[inline]
    pub fn new() -> Self {
        Self {
            inner: RefCounter::new(Mutex::new(HashMap::new())),
        }
    }

    /// Merges one compaction's discard byte counts into the totals.
    pub fn update_gc_stats(&self, stats: &HashMap<u32, u64>) {
        if stats.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        for (fid, bytes) in stats {
            *inner.entry(*fid).or_insert(0) += bytes;
        }
    }

    /// Discardable bytes recorded against one value log file.
    #[inline]
    pub fn discard_bytes(&self, fid: u32) -> u64 {
        self.inner.lock().get(&fid).copied().unwrap_or(0)
    }

    /// The file with the most discardable data, if any was recorded.
    pub fn max_discard(&self) -> Option<(u32, u64)> {
        self.inner
            .lock()
            .iter()
            .max_by_key(|(_, bytes)| **bytes)
            .map(|(fid, bytes)| (*fid, *bytes))
    }
}
