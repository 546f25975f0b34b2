use ds_storage::{LayoutKind, StorageOpts};

/// Which field of a message determines its shard (§3: "per configuration").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShardKey {
    ClientId,
    Topic,
}

/// `open_db`'s configuration (§6.1): `{backend, storage, n_shards,
/// force_monotonic_timestamps?, atomic_batches?, serialize_by?}`. `backend`
/// is implicit here — the only backend this crate wires up is `ds_kv`'s
/// RocksDB adapter — so this struct covers the remaining fields.
#[derive(Clone, Debug)]
pub struct DbConfig {
    pub n_shards: u32,
    pub storage_opts: StorageOpts,
    /// The layout every generation of this DB is created with. The consumer
    /// API's `add_generation(db)` takes no schema argument (§6.1), so the
    /// choice is fixed for the DB's lifetime rather than per call.
    pub layout_kind: LayoutKind,
    pub force_monotonic_timestamps: bool,
    pub atomic_batches: bool,
    pub serialize_by: ShardKey,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            n_shards: 1,
            storage_opts: StorageOpts::default(),
            layout_kind: LayoutKind::SkipstreamLts,
            force_monotonic_timestamps: true,
            atomic_batches: true,
            serialize_by: ShardKey::Topic,
        }
    }
}

/// Per-call `store_batch` options (§6.1: `{sync?, atomic?, durable?}`).
#[derive(Clone, Copy, Debug)]
pub struct BatchOpts {
    /// Require the whole batch to commit as a single atomic write within
    /// each shard it touches. When false, the shard buffer may split it
    /// into several smaller commits.
    pub atomic: bool,
    /// Wait for the write to be flushed to the WAL before returning.
    pub sync: bool,
    /// Disable the WAL for this batch entirely.
    pub durable: bool,
}

impl Default for BatchOpts {
    fn default() -> Self {
        Self { atomic: true, sync: false, durable: true }
    }
}

impl From<BatchOpts> for ds_kv::CommitOpts {
    fn from(opts: BatchOpts) -> Self {
        ds_kv::CommitOpts { sync: opts.sync, disable_wal: !opts.durable }
    }
}
