use crate::table::Table;
use bytes::Bytes;
use core::cmp::Ordering;
use kvtypes::{compare_key, Value};

/// Iterator over a single table, forward or reverse. Holds a reference to
/// its table, keeping the file alive while the iterator is in use.
pub struct UniTableIterator {
    t: Table,
    pos: usize,
    valid: bool,
    reverse: bool,
}

impl UniTableIterator {
    pub(crate) fn new(t: Table, reverse: bool) -> Self {
        Self {
            t,
            pos: 0,
            valid: false,
            reverse,
        }
    }

    #[inline]
    fn num_entries(&self) -> usize {
        self.t.raw().num_entries()
    }

    /// Positions at the first record in iteration order.
    pub fn rewind(&mut self) {
        let n = self.num_entries();
        if n == 0 {
            self.valid = false;
            return;
        }
        self.pos = if self.reverse { n - 1 } else { 0 };
        self.valid = true;
    }

    /// Forward: positions at the first record >= `key`. Reverse: at the last
    /// record <= `key`.
    pub fn seek(&mut self, key: &[u8]) {
        let n = self.num_entries();
        let idx = self.t.raw().search(key);
        if !self.reverse {
            self.valid = idx < n;
            self.pos = idx;
            return;
        }
        if idx < n && compare_key(self.t.raw().entry_key(idx), key) == Ordering::Equal {
            self.pos = idx;
            self.valid = true;
        } else if idx == 0 {
            self.valid = false;
        } else {
            self.pos = idx - 1;
            self.valid = true;
        }
    }

    /// Advances one record in iteration order.
    pub fn next(&mut self) {
        if !self.valid {
            return;
        }
        if self.reverse {
            if self.pos == 0 {
                self.valid = false;
            } else {
                self.pos -= 1;
            }
        } else if self.pos + 1 >= self.num_entries() {
            self.valid = false;
        } else {
            self.pos += 1;
        }
    }

    #[inline]
    pub fn valid(&self) -> bool {
        self.valid
    }

    #[inline]
    pub fn key(&self) -> &[u8] {
        self.t.raw().entry_key(self.pos)
    }

    #[inline]
    pub fn value(&self) -> Value {
        self.t.raw().entry_value(self.pos)
    }
}

/// Concatenates iterators over non-overlapping, key-ordered tables, as found
/// at levels >= 1.
pub struct ConcatTableIterator {
    tables: Vec<Table>,
    cur: Option<UniTableIterator>,
    idx: usize,
    reverse: bool,
}

impl ConcatTableIterator {
    pub fn new(tables: Vec<Table>, reverse: bool) -> Self {
        Self {
            tables,
            cur: None,
            idx: 0,
            reverse,
        }
    }

    fn set_idx(&mut self, idx: usize) {
        self.idx = idx;
        if idx >= self.tables.len() {
            self.cur = None;
            return;
        }
        self.cur = Some(self.tables[idx].iter(self.reverse));
    }

    /// Steps to the next table in iteration order until one yields a valid
    /// position or the sequence is exhausted.
    fn advance_table(&mut self) {
        loop {
            let next = if self.reverse {
                if self.idx == 0 {
                    self.cur = None;
                    return;
                }
                self.idx - 1
            } else {
                self.idx + 1
            };
            self.set_idx(next);
            match &mut self.cur {
                None => return,
                Some(it) => {
                    it.rewind();
                    if it.valid() {
                        return;
                    }
                }
            }
        }
    }

    pub fn rewind(&mut self) {
        if self.tables.is_empty() {
            self.cur = None;
            return;
        }
        let first = if self.reverse {
            self.tables.len() - 1
        } else {
            0
        };
        self.set_idx(first);
        if let Some(it) = &mut self.cur {
            it.rewind();
            if !it.valid() {
                self.advance_table();
            }
        }
    }

    pub fn seek(&mut self, key: &[u8]) {
        let n = self.tables.len();
        if !self.reverse {
            // First table whose biggest key can cover `key`.
            let idx = search(n, |i| {
                compare_key(self.tables[i].biggest().as_slice(), key) != Ordering::Less
            });
            if idx >= n {
                self.cur = None;
                return;
            }
            self.set_idx(idx);
        } else {
            // Last table whose smallest key is <= `key`.
            let idx = search(n, |i| {
                compare_key(self.tables[i].smallest().as_slice(), key) == Ordering::Greater
            });
            if idx == 0 {
                self.cur = None;
                return;
            }
            self.set_idx(idx - 1);
        }
        if let Some(it) = &mut self.cur {
            it.seek(key);
            if !it.valid() {
                self.advance_table();
            }
        }
    }

    pub fn next(&mut self) {
        let Some(it) = &mut self.cur else { return };
        it.next();
        if !it.valid() {
            self.advance_table();
        }
    }

    #[inline]
    pub fn valid(&self) -> bool {
        self.cur.as_ref().is_some_and(|it| it.valid())
    }

    #[inline]
    pub fn key(&self) -> &[u8] {
        self.cur.as_ref().unwrap().key()
    }

    #[inline]
    pub fn value(&self) -> Value {
        self.cur.as_ref().unwrap().value()
    }
}

/// K-way merge over child iterators, yielding records in stored-key order.
/// On an exact key tie the earliest child wins and the duplicates from later
/// children are skipped, so sources must be ordered newest first.
pub struct MergeTableIterator {
    children: Vec<TableIterator>,
    winner: Option<usize>,
    reverse: bool,
}

impl MergeTableIterator {
    /// Builds a merge iterator; a single child is returned unwrapped.
    pub fn new(mut children: Vec<TableIterator>, reverse: bool) -> TableIterator {
        if children.len() == 1 {
            return children.pop().unwrap();
        }
        TableIterator::Merge(Box::new(MergeTableIterator {
            children,
            winner: None,
            reverse,
        }))
    }

    fn pick_winner(&mut self) {
        let mut winner: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            let better = match winner {
                None => true,
                Some(w) => {
                    let ord = compare_key(child.key(), self.children[w].key());
                    if self.reverse {
                        ord == Ordering::Greater
                    } else {
                        ord == Ordering::Less
                    }
                }
            };
            if better {
                winner = Some(i);
            }
        }
        self.winner = winner;
    }

    pub fn rewind(&mut self) {
        for child in &mut self.children {
            child.rewind();
        }
        self.pick_winner();
    }

    pub fn seek(&mut self, key: &[u8]) {
        for child in &mut self.children {
            child.seek(key);
        }
        self.pick_winner();
    }

    pub fn next(&mut self) {
        let Some(w) = self.winner else { return };
        let current = Bytes::copy_from_slice(self.children[w].key());
        for child in &mut self.children {
            if child.valid() && compare_key(child.key(), &current) == Ordering::Equal {
                child.next();
            }
        }
        self.pick_winner();
    }

    #[inline]
    pub fn valid(&self) -> bool {
        self.winner.is_some()
    }

    #[inline]
    pub fn key(&self) -> &[u8] {
        self.children[self.winner.unwrap()].key()
    }

    #[inline]
    pub fn value(&self) -> Value {
        self.children[self.winner.unwrap()].value()
    }
}

/// The closed set of iterator shapes the engine composes.
pub enum TableIterator {
    Uni(UniTableIterator),
    Concat(ConcatTableIterator),
    Merge(Box<MergeTableIterator>),
}

impl TableIterator {
    pub fn rewind(&mut self) {
        match self {
            TableIterator::Uni(it) => it.rewind(),
            TableIterator::Concat(it) => it.rewind(),
            TableIterator::Merge(it) => it.rewind(),
        }
    }

    pub fn seek(&mut self, key: &[u8]) {
        match self {
            TableIterator::Uni(it) => it.seek(key),
            TableIterator::Concat(it) => it.seek(key),
            TableIterator::Merge(it) => it.seek(key),
        }
    }

    pub fn next(&mut self) {
        match self {
            TableIterator::Uni(it) => it.next(),
            TableIterator::Concat(it) => it.next(),
            TableIterator::Merge(it) => it.next(),
        }
    }

    pub fn valid(&self) -> bool {
        match self {
            TableIterator::Uni(it) => it.valid(),
            TableIterator::Concat(it) => it.valid(),
            TableIterator::Merge(it) => it.valid(),
        }
    }

    pub fn key(&self) -> &[u8] {
        match self {
            TableIterator::Uni(it) => it.key(),
            TableIterator::Concat(it) => it.key(),
            TableIterator::Merge(it) => it.key(),
        }
    }

    pub fn value(&self) -> Value {
        match self {
            TableIterator::Uni(it) => it.value(),
            TableIterator::Concat(it) => it.value(),
            TableIterator::Merge(it) => it.value(),
        }
    }
}

impl From<UniTableIterator> for TableIterator {
    fn from(it: UniTableIterator) -> Self {
        TableIterator::Uni(it)
    }
}

impl From<ConcatTableIterator> for TableIterator {
    fn from(it: ConcatTableIterator) -> Self {
        TableIterator::Concat(it)
    }
}

fn search(n: usize, pred: impl Fn(usize) -> bool) -> usize {
    let (mut lo, mut hi) = (0, n);
    while lo < hi {
        let mid = (lo + hi) / 2;
        if pred(mid) {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    lo
}
