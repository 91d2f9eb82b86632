use bytes::Bytes;
use kvtypes::{Key, Value};
use stele::Table;

/// Options shaping a multi-level scan: direction, and optional inclusive
/// user-key bounds used to skip tables that cannot contribute.
#[derive(Debug, Clone, Default)]
pub struct IteratorOptions {
    pub reverse: bool,
    pub start: Option<Bytes>,
    pub end: Option<Bytes>,
}

impl IteratorOptions {
    #[inline]
    pub fn reversed() -> Self {
        Self {
            reverse: true,
            ..Self::default()
        }
    }

    /// Whether the table's key range intersects the scan bounds.
    pub fn pick_table(&self, t: &Table) -> bool {
        if t.is_empty() {
            return false;
        }
        if let Some(start) = &self.start {
            if t.biggest().parse_key() < start.as_ref() {
                return false;
            }
        }
        if let Some(end) = &self.end {
            if t.smallest().parse_key() > end.as_ref() {
                return false;
            }
        }
        true
    }

    /// The subsequence of `tables` intersecting the scan bounds.
    pub fn pick_tables(&self, tables: &[Table]) -> Vec<Table> {
        tables
            .iter()
            .filter(|t| self.pick_table(t))
            .cloned()
            .collect()
    }
}

/// One key of a batched lookup; `found` is flipped by the first level that
/// answers it, so deeper levels skip the key.
#[derive(Debug, Clone)]
pub struct KvPair {
    key: Key,
    value: Value,
    found: bool,
}

impl KvPair {
    #[inline]
    pub fn new(key: Key) -> Self {
        Self {
            key,
            value: Value::new(),
            found: false,
        }
    }

    #[inline]
    pub fn key(&self) -> &Key {
        &self.key
    }

    #[inline]
    pub fn value(&self) -> &Value {
        &self.value
    }

    #[inline]
    pub fn found(&self) -> bool {
        self.found
    }

    #[inline]
    pub(crate) fn set(&mut self, value: Value) {
        self.value = value;
        self.found = true;
    }
}
