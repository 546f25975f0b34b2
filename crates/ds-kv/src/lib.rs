//! Thin, ordered key-value backend adapter.
//!
//! This crate is the leaf of the DS storage engine: it knows nothing about
//! messages, topics, or generations. It exposes just enough of RocksDB's
//! surface — column families, atomic write batches, and bounded forward
//! iterators with re-seek — for the layers above to build a log-structured
//! store on top of it.

mod batch;
mod error;
mod iter;

pub use batch::{Batch, CommitOpts, KvOp};
pub use error::Error;
pub use iter::{CfIterator, KeyRange};

use std::path::{Path, PathBuf};

/// An open RocksDB database, shared (via `Arc`) across every shard and
/// generation that was opened against the same on-disk path.
pub struct KvBackend {
    db: rocksdb::DB,
    path: PathBuf,
}

impl KvBackend {
    /// Open (creating if absent) the database at `path`, with `column_families`
    /// pre-declared. Column families discovered on disk but not named here
    /// are still opened, so that a caller which doesn't yet know every
    /// generation's CF names up front (e.g. during startup, before the
    /// generation metadata CF has been read) doesn't lose data.
    #[tracing::instrument(skip(column_families))]
    pub fn open(path: impl AsRef<Path>, column_families: &[String]) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();

        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let mut existing = rocksdb::DB::list_cf(&opts, &path).unwrap_or_default();
        for cf in column_families {
            if !existing.contains(cf) {
                existing.push(cf.clone());
            }
        }
        if !existing.iter().any(|n| n == rocksdb::DEFAULT_COLUMN_FAMILY_NAME) {
            existing.push(rocksdb::DEFAULT_COLUMN_FAMILY_NAME.to_string());
        }

        let db = rocksdb::DB::open_cf(&opts, &path, existing).map_err(|source| Error::Open {
            path: path.clone(),
            source,
        })?;

        tracing::debug!(?path, "opened rocksdb backend");
        Ok(Self { db, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Declare a new column family. No-op (returns Ok) if it already exists,
    /// since callers (the generation manager, replaying administrative
    /// operations) must tolerate re-creation attempts the same way they
    /// tolerate re-drops.
    pub fn create_cf(&self, name: &str) -> Result<(), Error> {
        if self.db.cf_handle(name).is_some() {
            return Ok(());
        }
        let opts = rocksdb::Options::default();
        self.db.create_cf(name, &opts)?;
        tracing::debug!(cf = name, "created column family");
        Ok(())
    }

    pub fn drop_cf(&self, name: &str) -> Result<(), Error> {
        if self.db.cf_handle(name).is_none() {
            return Ok(());
        }
        self.db.drop_cf(name)?;
        tracing::debug!(cf = name, "dropped column family");
        Ok(())
    }

    pub fn cf_names(&self) -> Vec<String> {
        rocksdb::DB::list_cf(&rocksdb::Options::default(), &self.path).unwrap_or_default()
    }

    fn cf_handle(&self, name: &str) -> Result<&rocksdb::ColumnFamily, Error> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::UnknownColumnFamily(name.to_string()))
    }

    /// Atomically apply every op in `batch`. Either all of it becomes
    /// visible, or (on error) none of it does.
    #[tracing::instrument(skip(self, batch), fields(ops = batch.ops().len()))]
    pub fn commit(&self, batch: Batch, opts: CommitOpts) -> Result<(), Error> {
        let mut wb = rocksdb::WriteBatch::default();

        for op in batch.ops() {
            match op {
                KvOp::Put { cf, key, value } => {
                    wb.put_cf(self.cf_handle(cf)?, key, value);
                }
                KvOp::Delete { cf, key } => {
                    wb.delete_cf(self.cf_handle(cf)?, key);
                }
                KvOp::DeleteRange { cf, from, to } => {
                    wb.delete_range_cf(self.cf_handle(cf)?, from, to);
                }
            }
        }

        let mut write_opts = rocksdb::WriteOptions::default();
        write_opts.set_sync(opts.sync);
        write_opts.disable_wal(opts.disable_wal);

        self.db.write_opt(wb, &write_opts)?;
        Ok(())
    }

    pub fn get(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.db.get_cf(self.cf_handle(cf)?, key)?)
    }

    /// A forward iterator over `cf`, bounded to `range` so it can never
    /// cross into a neighbouring key family.
    pub fn iter(&self, cf: &str, range: KeyRange) -> Result<CfIterator<'_>, Error> {
        let cf = self.cf_handle(cf)?;
        let mut read_opts = rocksdb::ReadOptions::default();
        read_opts.set_iterate_lower_bound(range.lower);
        read_opts.set_iterate_upper_bound(range.upper);

        Ok(CfIterator::new(self.db.raw_iterator_cf_opt(cf, read_opts)))
    }

    /// Read every key/value pair in `cf`, unbounded. Used to rebuild an
    /// in-memory mirror (the LTS trie) from its persisted column family on
    /// reopen; not meant for hot paths, which always go through `iter`
    /// with a tight key range.
    pub fn scan_all(&self, cf: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error> {
        let cf_handle = self.cf_handle(cf)?;
        let mut out = Vec::new();
        let iter = self.db.iterator_cf(cf_handle, rocksdb::IteratorMode::Start);
        for item in iter {
            let (k, v) = item?;
            out.push((k.to_vec(), v.to_vec()));
        }
        Ok(out)
    }

    /// Bulk-load a dumped set of key/value pairs into `cf` via a single
    /// write batch. Used to inherit a trie from a prior generation.
    pub fn bulk_load(&self, cf: &str, pairs: impl IntoIterator<Item = (Vec<u8>, Vec<u8>)>) -> Result<(), Error> {
        let mut batch = Batch::new();
        for (k, v) in pairs {
            batch.put(cf, k, v);
        }
        if batch.is_empty() {
            return Ok(());
        }
        self.commit(batch, CommitOpts::default())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Opens an empty RocksDB in a temporary directory, cleaned up on drop.
    pub fn build_test_kv(column_families: &[&str]) -> (tempfile::TempDir, KvBackend) {
        let dir = tempfile::TempDir::new().unwrap();
        let cfs: Vec<String> = column_families.iter().map(|s| s.to_string()).collect();
        let kv = KvBackend::open(dir.path(), &cfs).unwrap();
        (dir, kv)
    }

    #[test]
    fn test_put_get_roundtrip() {
        let (_dir, kv) = build_test_kv(&["data"]);

        let mut batch = Batch::new();
        batch.put("data", b"foo".to_vec(), b"1".to_vec());
        batch.put("data", b"bar".to_vec(), b"2".to_vec());
        kv.commit(batch, CommitOpts::default()).unwrap();

        assert_eq!(kv.get("data", b"foo").unwrap(), Some(b"1".to_vec()));
        assert_eq!(kv.get("data", b"bar").unwrap(), Some(b"2".to_vec()));
        assert_eq!(kv.get("data", b"baz").unwrap(), None);
    }

    #[test]
    fn test_commit_is_atomic_on_unknown_cf() {
        let (_dir, kv) = build_test_kv(&["data"]);

        let mut batch = Batch::new();
        batch.put("data", b"foo".to_vec(), b"1".to_vec());
        batch.put("nope", b"bar".to_vec(), b"2".to_vec());

        assert!(kv.commit(batch, CommitOpts::default()).is_err());
        // Nothing from the batch should have been written: we never even
        // built the underlying WriteBatch for "data" once "nope" failed to
        // resolve, since cf_handle resolution happens before any wb.put_cf.
        assert_eq!(kv.get("data", b"foo").unwrap(), None);
    }

    #[test]
    fn test_create_drop_cf_idempotent() {
        let (_dir, kv) = build_test_kv(&[]);

        kv.create_cf("trie_1").unwrap();
        kv.create_cf("trie_1").unwrap(); // idempotent

        kv.drop_cf("trie_1").unwrap();
        kv.drop_cf("trie_1").unwrap(); // idempotent, no error on re-drop
    }

    #[test]
    fn test_scan_all_reads_every_entry_unbounded() {
        let (_dir, kv) = build_test_kv(&["trie"]);
        let mut batch = Batch::new();
        batch.put("trie", b"\x00".to_vec(), b"a".to_vec());
        batch.put("trie", b"\xff\xff\xff\xff".to_vec(), b"b".to_vec());
        kv.commit(batch, CommitOpts::default()).unwrap();

        let mut all = kv.scan_all("trie").unwrap();
        all.sort();
        assert_eq!(all, vec![(b"\x00".to_vec(), b"a".to_vec()), (b"\xff\xff\xff\xff".to_vec(), b"b".to_vec())]);
    }

    #[test]
    fn test_bounded_iterator_seek_and_skip() {
        let (_dir, kv) = build_test_kv(&["data"]);

        let mut batch = Batch::new();
        for ts in [10u64, 20, 30, 40] {
            batch.put("data", ts.to_be_bytes().to_vec(), vec![]);
        }
        kv.commit(batch, CommitOpts::default()).unwrap();

        let mut it = kv
            .iter("data", KeyRange::new(10u64.to_be_bytes().to_vec(), 41u64.to_be_bytes().to_vec()))
            .unwrap();
        it.seek(&25u64.to_be_bytes());
        assert!(it.valid());
        assert_eq!(it.key().unwrap(), &30u64.to_be_bytes());
        it.advance();
        assert_eq!(it.key().unwrap(), &40u64.to_be_bytes());
        it.advance();
        assert!(!it.valid());
    }
}
