use crate::bloom::{self, Filter};
use crate::options::TableOptions;
use crate::table::{FOOTER_SIZE, MAGIC};
use bytes::{BufMut, Bytes, BytesMut};
use kvtypes::{compare_key, Key, Value};

/// Accumulates key-ordered records and assembles the on-disk table image.
///
/// File layout, all integers big endian:
///
/// ```text
/// entries: [ key_len: u32 | key | meta: u8 | user_meta: u8 | value ]*
/// index:   [ entry_offset: u32 ]*
/// bloom:   filter bytes (empty for an empty table)
/// footer:  index_offset | num_entries | bloom_offset | bloom_len
///          | checksum (crc32 of everything before the footer) | magic
/// ```
pub struct Builder {
    opts: TableOptions,
    buf: BytesMut,
    offsets: Vec<u32>,
    key_hashes: Vec<u32>,
    last_key: Vec<u8>,
}

impl Builder {
    pub fn new(opts: TableOptions) -> Self {
        Self {
            opts,
            buf: BytesMut::with_capacity(1 << 20),
            offsets: Vec::new(),
            key_hashes: Vec::new(),
            last_key: Vec::new(),
        }
    }

    /// Appends a record. Keys must arrive in strictly ascending stored-key
    /// order.
    pub fn insert(&mut self, key: &Key, value: &Value) {
        debug_assert!(
            self.last_key.is_empty()
                || compare_key(&self.last_key, key.as_slice()) == core::cmp::Ordering::Less,
            "keys inserted out of order"
        );

        self.offsets.push(self.buf.len() as u32);
        self.key_hashes.push(bloom::hash(key.parse_key()));

        self.buf.put_u32(key.len() as u32);
        self.buf.put_slice(key.as_slice());
        self.buf.put_u8(value.meta);
        self.buf.put_u8(value.user_meta);
        self.buf.put_slice(&value.value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key.as_slice());
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    #[inline]
    pub fn num_entries(&self) -> usize {
        self.offsets.len()
    }

    #[inline]
    pub(crate) fn options(&self) -> &TableOptions {
        &self.opts
    }

    /// The size the finished file will roughly occupy.
    pub fn estimated_size(&self) -> u64 {
        let n = self.offsets.len();
        let bpk = bloom::bits_per_key(n, self.opts.bloom_false_positive);
        (self.buf.len() + 4 * n + (n * bpk + 7) / 8 + 1 + FOOTER_SIZE) as u64
    }

    /// Whether the builder has grown past the file cutover size.
    #[inline]
    pub fn reached_capacity(&self, cap: u64) -> bool {
        self.estimated_size() >= cap
    }

    /// Assembles the complete file image.
    pub(crate) fn finish(self) -> Bytes {
        let mut buf = self.buf;
        let num_entries = self.offsets.len();

        let index_offset = buf.len() as u32;
        for off in &self.offsets {
            buf.put_u32(*off);
        }

        let bloom_offset = buf.len() as u32;
        let filter = if num_entries == 0 {
            Bytes::new()
        } else {
            let bpk = bloom::bits_per_key(num_entries, self.opts.bloom_false_positive);
            Filter::new(&self.key_hashes, bpk).into_bytes()
        };
        buf.put_slice(&filter);

        let checksum = crc32fast::hash(&buf);
        buf.put_u32(index_offset);
        buf.put_u32(num_entries as u32);
        buf.put_u32(bloom_offset);
        buf.put_u32(filter.len() as u32);
        buf.put_u32(checksum);
        buf.put_u32(MAGIC);
        buf.freeze()
    }
}
