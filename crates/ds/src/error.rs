use ds_storage::GenId;

/// The one error type a consumer of this crate needs to match on (§7,
/// AMBIENT note): it composes every child crate's error with `#[from]` and
/// carries enough context (`db`, `shard`, `gen_id`) to log without a second
/// round-trip into the failing layer.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("db {db:?} shard {shard}: {source}")]
    Storage { db: String, shard: u32, source: ds_storage::Error },

    #[error("db {db:?} shard {shard}: {source}")]
    Generation { db: String, shard: u32, source: ds_generation::Error },

    #[error("key-value backend error: {0}")]
    Kv(#[from] ds_kv::Error),

    #[error("filesystem error at {path:?}: {source}")]
    Io { path: std::path::PathBuf, source: std::io::Error },

    #[error("db {0:?} is already open")]
    DbAlreadyOpen(String),

    #[error("db {0:?} is not open")]
    DbNotOpen(String),

    #[error("shard {0} is out of range for this db")]
    UnknownShard(u32),

    #[error("a batch with preconditions must be committed atomically")]
    PreconditionsRequireAtomic,

    #[error("administrative operation on db {db:?} shard {shard} timed out")]
    Timeout { db: String, shard: u32 },

    #[error("open_db({0:?}) timed out")]
    DbTimeout(String),

    #[error("shard ingest task for db {db:?} shard {shard} is no longer running")]
    ShardTaskGone { db: String, shard: u32 },

    #[error("iterator rank (shard={shard}, generation={generation}) does not belong to any live generation")]
    UnknownRank { shard: u32, generation: GenId },

    #[error("db {db:?} shard {shard}: add_generation(since={since}) is behind the shard watermark ({watermark})")]
    GenerationSinceBehindWatermark { db: String, shard: u32, since: u64, watermark: u64 },
}
