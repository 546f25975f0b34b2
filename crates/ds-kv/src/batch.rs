/// A single mutation queued against one column family.
///
/// `Batch` accumulates ops by column-family *name* rather than a borrowed
/// `&ColumnFamily` handle, so that callers (the storage layouts) can build a
/// batch without holding a reference into the backend. Column family handles
/// are resolved once, inside [`crate::KvBackend::commit`].
#[derive(Debug, Clone)]
pub enum KvOp {
    Put {
        cf: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        cf: String,
        key: Vec<u8>,
    },
    DeleteRange {
        cf: String,
        from: Vec<u8>,
        to: Vec<u8>,
    },
}

/// An accumulator of KV mutations destined for one atomic write.
///
/// This is the batch-scoped accumulator that a [`crate::KvBackend`] consumer
/// (a storage layout's `prepare_batch`) appends to; nothing is durable until
/// it's passed to [`crate::KvBackend::commit`].
#[derive(Debug, Clone, Default)]
pub struct Batch {
    ops: Vec<KvOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, cf: &str, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(KvOp::Put {
            cf: cf.to_string(),
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, cf: &str, key: impl Into<Vec<u8>>) {
        self.ops.push(KvOp::Delete {
            cf: cf.to_string(),
            key: key.into(),
        });
    }

    pub fn delete_range(&mut self, cf: &str, from: impl Into<Vec<u8>>, to: impl Into<Vec<u8>>) {
        self.ops.push(KvOp::DeleteRange {
            cf: cf.to_string(),
            from: from.into(),
            to: to.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Append another batch's ops onto this one, preserving order.
    pub fn extend(&mut self, other: Batch) {
        self.ops.extend(other.ops);
    }

    pub(crate) fn ops(&self) -> &[KvOp] {
        &self.ops
    }
}

/// Per-batch durability knobs, mirroring the consumer API's
/// `store_batch(db, batch, {sync?, atomic?, durable?})`.
///
/// `atomic` is not represented here: every `Batch` is always written with a
/// single `rocksdb::WriteBatch`, so atomicity is a property of `commit`
/// itself, not a toggle. Splitting a logical batch into several physical
/// ones (the `atomic=false` case) is a decision made by the caller (the
/// shard buffer), which simply calls `commit` more than once.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommitOpts {
    /// Wait for the write to be flushed to the WAL before returning.
    pub sync: bool,
    /// Disable the WAL for this write entirely.
    pub disable_wal: bool,
}
