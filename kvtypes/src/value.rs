use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Meta bit marking a record as a deletion tombstone.
pub const VALUE_DELETE: u8 = 1 << 0;
/// Meta bit marking the value as an indirect pointer into a value log file.
pub const VALUE_POINTER: u8 = 1 << 1;

/// The value information associated with a key, plus the internal meta byte.
///
/// `version` is never serialized; it is recovered from the key's timestamp
/// suffix when a record is read back.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Value {
    pub meta: u8,
    pub user_meta: u8,
    pub version: u64,
    pub value: Bytes,
}

impl Value {
    /// Returns an empty value, the "not found" sentinel.
    #[inline]
    pub const fn new() -> Self {
        Self {
            meta: 0,
            user_meta: 0,
            version: 0,
            value: Bytes::new(),
        }
    }

    /// A tombstone carrying no data.
    #[inline]
    pub const fn tombstone() -> Self {
        Self {
            meta: VALUE_DELETE,
            user_meta: 0,
            version: 0,
            value: Bytes::new(),
        }
    }

    #[inline]
    pub fn from_data(data: impl Into<Bytes>) -> Self {
        Self {
            meta: 0,
            user_meta: 0,
            version: 0,
            value: data.into(),
        }
    }

    #[inline]
    pub const fn set_meta(mut self, meta: u8) -> Self {
        self.meta = meta;
        self
    }

    #[inline]
    pub const fn set_user_meta(mut self, user_meta: u8) -> Self {
        self.user_meta = user_meta;
        self
    }

    #[inline]
    pub const fn set_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// A found record is distinguishable from the empty sentinel: tombstones
    /// carry a meta bit, live records carry data.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.meta != 0 || !self.value.is_empty()
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.meta & VALUE_DELETE != 0
    }

    #[inline]
    pub fn is_value_pointer(&self) -> bool {
        self.meta & VALUE_POINTER != 0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.value.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

/// Location of a value stored out-of-line in a value log file.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ValuePointer {
    pub fid: u32,
    pub len: u32,
    pub offset: u32,
}

impl ValuePointer {
    /// Encoded width of a pointer.
    pub const SIZE: usize = 12;

    #[inline]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u32(self.fid);
        buf.put_u32(self.len);
        buf.put_u32(self.offset);
        buf.freeze()
    }

    /// Decodes a pointer from the first [`ValuePointer::SIZE`] bytes of `data`.
    /// Returns `None` when the slice is too short.
    #[inline]
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        let mut buf = data;
        Some(Self {
            fid: buf.get_u32(),
            len: buf.get_u32(),
            offset: buf.get_u32(),
        })
    }
}
