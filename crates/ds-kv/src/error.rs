#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("RocksDB error: {0}")]
    Rocks(#[from] rocksdb::Error),
    #[error("column family not found: {0}")]
    UnknownColumnFamily(String),
    #[error("column family already exists: {0}")]
    ColumnFamilyExists(String),
    #[error("I/O error opening database at {path}: {source}")]
    Open {
        path: std::path::PathBuf,
        #[source]
        source: rocksdb::Error,
    },
}
