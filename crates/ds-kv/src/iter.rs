/// A bounded forward cursor over one column family.
///
/// Wraps a `rocksdb::DBRawIterator`, which is the only rocksdb iterator type
/// that supports re-seeking mid-scan — required by the skipstream read path,
/// which repeatedly seeks each of its cursors to a new timestamp as it skips
/// over non-matching ranges.
pub struct CfIterator<'a> {
    inner: rocksdb::DBRawIteratorWithThreadMode<'a, rocksdb::DB>,
}

impl<'a> CfIterator<'a> {
    pub(crate) fn new(inner: rocksdb::DBRawIteratorWithThreadMode<'a, rocksdb::DB>) -> Self {
        Self { inner }
    }

    /// Position the cursor at the first key >= `key` within its configured bounds.
    pub fn seek(&mut self, key: &[u8]) {
        self.inner.seek(key);
    }

    /// Position the cursor at the last key <= `key` within its configured bounds.
    pub fn seek_for_prev(&mut self, key: &[u8]) {
        self.inner.seek_for_prev(key);
    }

    pub fn seek_to_first(&mut self) {
        self.inner.seek_to_first();
    }

    pub fn valid(&self) -> bool {
        self.inner.valid()
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.inner.key()
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.inner.value()
    }

    pub fn advance(&mut self) {
        self.inner.next();
    }
}

/// Inclusive/exclusive key range used to bracket an iterator so that it can
/// never cross into a neighbouring key family (static shape, wildcard
/// level, ...).
#[derive(Debug, Clone)]
pub struct KeyRange {
    pub lower: Vec<u8>,
    pub upper: Vec<u8>,
}

impl KeyRange {
    pub fn new(lower: impl Into<Vec<u8>>, upper: impl Into<Vec<u8>>) -> Self {
        Self {
            lower: lower.into(),
            upper: upper.into(),
        }
    }

    /// A range covering every key sharing `prefix`, i.e. `[prefix, prefix ++ 0xff*)`.
    pub fn prefix(prefix: &[u8]) -> Self {
        let lower = prefix.to_vec();
        let mut upper = prefix.to_vec();
        // Append a single 0xff tail byte: since all our keys are fixed-width
        // per level, an upper bound one byte longer than any real key at this
        // prefix is sufficient to exclude them all while excluding neighbours.
        upper.push(0xff);
        Self { lower, upper }
    }
}
