use crate::builder::Builder;
use crate::error::*;
use crate::iterator::UniTableIterator;
use crate::options::{LoadingMode, TableOptions};
use bytes::{Buf, Bytes};
use core::sync::atomic::{AtomicBool, Ordering};
use fmmap::{MmapFile, MmapFileExt};
use kvtypes::{compare_key, same_key, Key, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use strata_utils::{RateLimiter, RefCounter};

pub const FILE_SUFFIX: &str = "sst";

pub(crate) const MAGIC: u32 = 0x5354_4C45;
pub(crate) const FOOTER_SIZE: usize = 24;

const CREATE_CHUNK_SIZE: usize = 1 << 20;

/// The canonical file path for a table id.
pub fn new_filename(id: u64, dir: impl AsRef<Path>) -> PathBuf {
    dir.as_ref().join(format!("{:06}.{}", id, FILE_SUFFIX))
}

/// Recovers the table id from a path produced by [`new_filename`].
pub fn parse_file_id(path: &Path) -> Option<u64> {
    if path.extension()? != FILE_SUFFIX {
        return None;
    }
    path.file_stem()?.to_str()?.parse::<u64>().ok()
}

enum TableData {
    Ram(Bytes),
    Mmap(MmapFile),
}

impl TableData {
    #[inline]
    fn len(&self) -> usize {
        match self {
            TableData::Ram(b) => b.len(),
            TableData::Mmap(m) => m.len(),
        }
    }

    /// Reads a pre-validated region.
    #[inline]
    fn read(&self, offset: usize, sz: usize) -> &[u8] {
        match self {
            TableData::Ram(b) => &b[offset..offset + sz],
            TableData::Mmap(m) => m.bytes(offset, sz).unwrap(),
        }
    }

    #[inline]
    fn slice(&self, offset: usize, sz: usize) -> Bytes {
        match self {
            TableData::Ram(b) => b.slice(offset..offset + sz),
            TableData::Mmap(m) => Bytes::copy_from_slice(m.bytes(offset, sz).unwrap()),
        }
    }
}

pub(crate) struct RawTable {
    data: TableData,
    path: PathBuf,
    id: u64,
    table_size: u64,
    index_offset: usize,
    num_entries: usize,
    bloom: Bytes,
    smallest: Key,
    biggest: Key,
    delete_on_drop: AtomicBool,
}

impl RawTable {
    #[inline]
    fn entry_offset(&self, i: usize) -> usize {
        let mut buf = self.data.read(self.index_offset + 4 * i, 4);
        buf.get_u32() as usize
    }

    #[inline]
    fn entry_end(&self, i: usize) -> usize {
        if i + 1 < self.num_entries {
            self.entry_offset(i + 1)
        } else {
            self.index_offset
        }
    }

    #[inline]
    pub(crate) fn entry_key(&self, i: usize) -> &[u8] {
        let off = self.entry_offset(i);
        let mut hdr = self.data.read(off, 4);
        let key_len = hdr.get_u32() as usize;
        self.data.read(off + 4, key_len)
    }

    pub(crate) fn entry_value(&self, i: usize) -> Value {
        let off = self.entry_offset(i);
        let end = self.entry_end(i);
        let mut hdr = self.data.read(off, 4);
        let key_len = hdr.get_u32() as usize;
        let meta_off = off + 4 + key_len;
        let meta = self.data.read(meta_off, 2);
        let (meta, user_meta) = (meta[0], meta[1]);
        let value = self.data.slice(meta_off + 2, end - meta_off - 2);
        let version = kvtypes::parse_ts(self.entry_key(i));
        Value {
            meta,
            user_meta,
            version,
            value,
        }
    }

    /// The index of the first entry whose key is >= `key`, or `num_entries`.
    pub(crate) fn search(&self, key: &[u8]) -> usize {
        let (mut lo, mut hi) = (0, self.num_entries);
        while lo < hi {
            let mid = (lo + hi) / 2;
            if compare_key(self.entry_key(mid), key) == core::cmp::Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    #[inline]
    pub(crate) fn num_entries(&self) -> usize {
        self.num_entries
    }
}

impl Drop for RawTable {
    fn drop(&mut self) {
        if self.delete_on_drop.load(Ordering::Acquire) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// A reference-counted handle to an immutable table file. Cloning the handle
/// shares the mapping; the file is removed once a handle marked for deletion
/// drops its last reference.
#[derive(Clone)]
#[repr(transparent)]
pub struct Table {
    inner: RefCounter<RawTable>,
}

impl core::fmt::Debug for Table {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Table")
            .field("id", &self.inner.id)
            .field("size", &self.inner.table_size)
            .field("entries", &self.inner.num_entries)
            .finish()
    }
}

impl Table {
    /// Opens an existing table file. The whole image is validated here so
    /// that later reads cannot fail: footer framing, checksum, index bounds
    /// and key ordering.
    pub fn open(path: impl AsRef<Path>, opts: &TableOptions) -> Result<Table> {
        let path = path.as_ref().to_path_buf();
        let id = parse_file_id(&path).ok_or_else(|| Error::InvalidFilename(path.clone()))?;

        let data = match opts.loading_mode {
            LoadingMode::LoadToRam => TableData::Ram(std::fs::read(&path)?.into()),
            LoadingMode::MemoryMap => TableData::Mmap(unsafe { MmapFile::open(&path)? }),
        };

        let len = data.len();
        if len < FOOTER_SIZE {
            return Err(Error::Corrupted(format!(
                "file of {} bytes cannot hold a footer",
                len
            )));
        }

        let mut footer = data.read(len - FOOTER_SIZE, FOOTER_SIZE);
        let index_offset = footer.get_u32() as usize;
        let num_entries = footer.get_u32() as usize;
        let bloom_offset = footer.get_u32() as usize;
        let bloom_len = footer.get_u32() as usize;
        let checksum = footer.get_u32();
        let magic = footer.get_u32();

        if magic != MAGIC {
            return Err(Error::Corrupted(format!("bad magic {:#x}", magic)));
        }
        let body_len = len - FOOTER_SIZE;
        if index_offset + 4 * num_entries != bloom_offset || bloom_offset + bloom_len != body_len {
            return Err(Error::Corrupted("footer regions out of bounds".to_string()));
        }
        let actual = crc32fast::hash(data.read(0, body_len));
        if actual != checksum {
            return Err(Error::ChecksumMismatch {
                expected: checksum,
                actual,
            });
        }

        let bloom = data.slice(bloom_offset, bloom_len);
        let mut raw = RawTable {
            table_size: len as u64,
            index_offset,
            num_entries,
            bloom,
            smallest: Key::new(),
            biggest: Key::new(),
            id,
            path,
            data,
            delete_on_drop: AtomicBool::new(false),
        };

        // Walk the index once: every entry must stay inside the entry region
        // and keys must be strictly ascending.
        let mut prev_end = 0usize;
        for i in 0..num_entries {
            let off = raw.data.read(raw.index_offset + 4 * i, 4);
            let off = u32::from_be_bytes(off.try_into().unwrap()) as usize;
            if off != prev_end || off + 4 > index_offset {
                return Err(Error::Corrupted(format!("entry {} misplaced", i)));
            }
            let key_len =
                u32::from_be_bytes(raw.data.read(off, 4).try_into().unwrap()) as usize;
            let end = if i + 1 < num_entries {
                let next = raw.data.read(raw.index_offset + 4 * (i + 1), 4);
                u32::from_be_bytes(next.try_into().unwrap()) as usize
            } else {
                index_offset
            };
            if off + 4 + key_len + 2 > end || end > index_offset {
                return Err(Error::Corrupted(format!("entry {} overflows", i)));
            }
            if i > 0
                && compare_key(raw.entry_key(i - 1), raw.entry_key(i))
                    != core::cmp::Ordering::Less
            {
                return Err(Error::Corrupted(format!("entry {} out of order", i)));
            }
            prev_end = end;
        }

        if num_entries > 0 {
            let smallest = Key::copy_from_slice(raw.entry_key(0));
            let biggest = Key::copy_from_slice(raw.entry_key(num_entries - 1));
            raw.smallest = smallest;
            raw.biggest = biggest;
        }

        Ok(Table {
            inner: RefCounter::new(raw),
        })
    }

    /// Writes the builder image to a new synced file, pacing writes through
    /// the limiter, and opens the result.
    pub fn create(path: impl AsRef<Path>, builder: Builder, limiter: &RateLimiter) -> Result<Table> {
        let path = path.as_ref();
        let opts = builder.options().clone();
        let image = builder.finish();

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(path)?;
        for chunk in image.chunks(CREATE_CHUNK_SIZE) {
            limiter.throttle(chunk.len());
            file.write_all(chunk)?;
        }
        file.sync_all()?;
        drop(file);

        Table::open(path, &opts)
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// On-disk size in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.inner.table_size
    }

    #[inline]
    pub fn smallest(&self) -> &Key {
        &self.inner.smallest
    }

    #[inline]
    pub fn biggest(&self) -> &Key {
        &self.inner.biggest
    }

    #[inline]
    pub fn key_count(&self) -> usize {
        self.inner.num_entries
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.num_entries == 0
    }

    /// Bloom-filter negative check over a user-key hash: `true` means the
    /// table definitely holds no version of that user key.
    #[inline]
    pub fn does_not_have(&self, hash: u32) -> bool {
        !crate::bloom::Filter::from(self.inner.bloom.clone()).may_contain(hash)
    }

    /// Finds the newest record visible at `key` (the first stored key >=
    /// `key` with the same user key).
    pub fn point_get(&self, key: &Key) -> Option<(Key, Value)> {
        let idx = self.inner.search(key.as_slice());
        if idx >= self.inner.num_entries {
            return None;
        }
        let entry_key = self.inner.entry_key(idx);
        if !same_key(entry_key, key.as_slice()) {
            return None;
        }
        Some((
            Key::copy_from_slice(entry_key),
            self.inner.entry_value(idx),
        ))
    }

    #[inline]
    pub fn iter(&self, reverse: bool) -> UniTableIterator {
        UniTableIterator::new(self.clone(), reverse)
    }

    /// Bytes of entry data covered by `[start, end)`; `None` bounds are
    /// unbounded.
    pub fn approximate_size_in_range(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> u64 {
        let lo = start.map_or(0, |k| self.inner.search(k));
        let hi = end.map_or(self.inner.num_entries, |k| self.inner.search(k));
        if hi <= lo {
            return 0;
        }
        let lo_off = self.inner.entry_offset(lo);
        let hi_off = if hi == self.inner.num_entries {
            self.inner.index_offset
        } else {
            self.inner.entry_offset(hi)
        };
        (hi_off - lo_off) as u64
    }

    /// Marks the file for removal once the last handle drops. Called after
    /// the manifest has durably recorded the deletion.
    #[inline]
    pub fn mark_delete(&self) {
        self.inner.delete_on_drop.store(true, Ordering::Release);
    }

    /// The number of live handles to this table.
    #[inline]
    pub fn ref_count(&self) -> usize {
        RefCounter::count(&self.inner)
    }

    #[inline]
    pub(crate) fn raw(&self) -> &RawTable {
        &self.inner
    }
}
