//! `ds`: the consumer-facing crate (§4.6, §6.1). `Ds` is the facade a
//! caller constructs once per process; it owns every open `DbHandle` and
//! routes each call by database name, then (inside `DbHandle`) by shard.
//!
//! ```no_run
//! # async fn demo() -> Result<(), ds::Error> {
//! use std::time::Duration;
//! let engine = ds::Ds::new("/var/lib/ds");
//! engine.open_db("mqtt", ds::DbConfig::default(), Duration::from_secs(5)).await?;
//! engine.add_generation("mqtt", Duration::from_secs(5)).await?;
//! # Ok(()) }
//! ```

mod clock;
mod config;
mod db;
mod error;
mod handle;
mod shard;

pub use clock::{Clock, FrozenClock, SystemClock};
pub use config::{BatchOpts, DbConfig, ShardKey};
pub use error::Error;
pub use handle::{DeleteResult, Iterator, MessageKey, NextResult, Rank, StreamHandle};

use db::DbHandle;
use ds_storage::{FilterSegment, GenId, Matcher, Message, PayloadMatch};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

pub use ds_generation::GenerationLifetime;
pub use ds_storage::{LayoutKind, Matcher as MessageMatcher, Message as StoredMessage, OpBatch, StorageOpts};

/// The top-level facade consumers construct once per process (§4.6).
/// Cheap to clone: every open `DbHandle` lives behind an `Arc` inside a
/// `tokio::sync::RwLock`-guarded registry.
pub struct Ds {
    root: PathBuf,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn ds_metrics::MetricsSink>,
    dbs: RwLock<HashMap<String, Arc<DbHandle>>>,
}

impl Ds {
    /// Every DB opened through this engine is stored under `root`, one
    /// subdirectory per DB and, inside that, one RocksDB instance per shard
    /// (§6.3: "Each shard owns its own ... KV column families" — realized
    /// here as each shard owning its own `KvBackend`, since column family
    /// names are keyed only by generation, not shard).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_collaborators(root, Arc::new(clock::SystemClock), Arc::new(ds_metrics::NoopSink))
    }

    pub fn with_collaborators(root: impl Into<PathBuf>, clock: Arc<dyn Clock>, metrics: Arc<dyn ds_metrics::MetricsSink>) -> Self {
        Self { root: root.into(), clock, metrics, dbs: RwLock::new(HashMap::new()) }
    }

    #[tracing::instrument(skip(self, config), fields(db = name))]
    pub async fn open_db(&self, name: &str, config: DbConfig, deadline: Duration) -> Result<(), Error> {
        let mut dbs = self.dbs.write().await;
        if dbs.contains_key(name) {
            return Err(Error::DbAlreadyOpen(name.to_string()));
        }

        let name_owned = name.to_string();
        let root = self.root.clone();
        let clock = self.clock.clone();
        let metrics = self.metrics.clone();
        let handle = tokio::time::timeout(
            deadline,
            tokio::task::spawn_blocking(move || DbHandle::open(&name_owned, config, &root, clock, metrics)),
        )
        .await
        .map_err(|_| Error::DbTimeout(name.to_string()))?
        .expect("db open task panicked")?;

        dbs.insert(name.to_string(), Arc::new(handle));
        Ok(())
    }

    /// Drops this engine's in-memory handle to `name`'s shards; their
    /// ingest tasks end once the last `Shard` clone (held only by the
    /// removed `DbHandle`) is dropped. On-disk state is untouched — a
    /// subsequent `open_db` of the same name picks up where this left off.
    pub async fn close_db(&self, name: &str) -> Result<(), Error> {
        self.dbs.write().await.remove(name).map(|_| ()).ok_or_else(|| Error::DbNotOpen(name.to_string()))
    }

    /// `close_db` plus removing every byte this DB ever wrote.
    pub async fn drop_db(&self, name: &str) -> Result<(), Error> {
        self.dbs.write().await.remove(name);
        let path = self.root.join(name);
        if path.exists() {
            tokio::task::spawn_blocking(move || std::fs::remove_dir_all(&path))
                .await
                .expect("drop_db task panicked")
                .map_err(|source| Error::Io { path: self.root.join(name), source })?;
        }
        Ok(())
    }

    async fn db(&self, name: &str) -> Result<Arc<DbHandle>, Error> {
        self.dbs.read().await.get(name).cloned().ok_or_else(|| Error::DbNotOpen(name.to_string()))
    }

    pub async fn store_batch(&self, name: &str, batch: OpBatch, opts: BatchOpts) -> Result<(), Error> {
        self.db(name).await?.store_batch(batch, opts).await
    }

    pub async fn add_generation(&self, name: &str, deadline: Duration) -> Result<Vec<(u32, GenId)>, Error> {
        let since = self.clock.now_us();
        let created_at = self.clock.wall_clock_us();
        self.db(name).await?.add_generation(since, created_at, deadline).await
    }

    /// §4.4: not idempotent at the generation manager; a drop of an
    /// already-dropped generation is tolerated here as success rather than
    /// propagated, so callers replaying administrative operations never
    /// see a spurious error.
    pub async fn drop_generation(&self, name: &str, shard: u32, gen_id: GenId, deadline: Duration) -> Result<(), Error> {
        match self.db(name).await?.drop_generation(shard, gen_id, deadline).await {
            Ok(()) => Ok(()),
            Err(Error::Generation { source: ds_generation::Error::GenerationNotFound(_), .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn list_generations_with_lifetimes(
        &self,
        name: &str,
    ) -> Result<BTreeMap<u32, BTreeMap<GenId, GenerationLifetime>>, Error> {
        Ok(self.db(name).await?.list_generations_with_lifetimes().await)
    }

    pub async fn get_streams(&self, name: &str, topic_filter: &[FilterSegment], start_time_us: u64) -> Result<Vec<StreamHandle>, Error> {
        Ok(self.db(name).await?.get_streams(topic_filter, start_time_us).await)
    }

    pub async fn get_delete_streams(
        &self,
        name: &str,
        topic_filter: &[FilterSegment],
        start_time_us: u64,
    ) -> Result<Vec<StreamHandle>, Error> {
        Ok(self.db(name).await?.get_delete_streams(topic_filter, start_time_us).await)
    }

    pub async fn make_iterator(
        &self,
        name: &str,
        stream: &StreamHandle,
        topic_filter: &[FilterSegment],
        start_time_us: u64,
    ) -> Result<Iterator, Error> {
        self.db(name).await?.make_iterator(stream, topic_filter, start_time_us).await
    }

    pub async fn make_delete_iterator(
        &self,
        name: &str,
        stream: &StreamHandle,
        topic_filter: &[FilterSegment],
        start_time_us: u64,
    ) -> Result<Iterator, Error> {
        self.db(name).await?.make_delete_iterator(stream, topic_filter, start_time_us).await
    }

    pub async fn update_iterator(&self, name: &str, iter: Iterator, message_key: &MessageKey) -> Result<Iterator, Error> {
        self.db(name).await?.update_iterator(iter, message_key).await
    }

    pub async fn next(&self, name: &str, iter: Iterator, batch_size: usize) -> Result<NextResult, Error> {
        self.db(name).await?.next(iter, batch_size).await
    }

    pub async fn lookup_message(&self, name: &str, key: &MessageKey) -> Result<Option<Message>, Error> {
        self.db(name).await?.lookup_message(key).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn delete_next(
        &self,
        name: &str,
        iter: Iterator,
        selector: Arc<dyn Fn(&Message) -> bool + Send + Sync>,
        batch_size: usize,
        opts: BatchOpts,
    ) -> Result<DeleteResult, Error> {
        self.db(name).await?.delete_next(iter, selector, batch_size, opts.into()).await
    }
}

/// A selector matching a single `(topic, timestamp, payload)` triple, the
/// common case for `delete_next`'s caller-supplied predicate (§4.2
/// "Deletion"): `store_batch`'s own `Operation::Delete(Matcher)` already
/// deletes like this inside a single generation; this helper lets a caller
/// building its own `delete_next` selector reuse the same matcher type
/// rather than hand-writing a closure.
pub fn matcher_selector(matcher: Matcher) -> Arc<dyn Fn(&Message) -> bool + Send + Sync> {
    Arc::new(move |msg: &Message| matcher.matches(msg))
}

/// Convenience matcher for an exact `(topic, timestamp)` pair with any
/// payload.
pub fn matcher_any_payload(topic: Vec<String>, timestamp: u64) -> Matcher {
    Matcher { topic, timestamp, payload: PayloadMatch::Any }
}

#[cfg(test)]
mod test {
    use super::*;
    use ds_lts::{parse_filter, parse_topic};

    fn msg(topic: &str, ts: u64, payload: &str) -> Message {
        Message { id: None, from: "tester".to_string(), topic: parse_topic(topic), timestamp: ts, payload: payload.as_bytes().to_vec() }
    }

    async fn open(dir: &std::path::Path, n_shards: u32) -> Ds {
        let engine = Ds::new(dir);
        let config = DbConfig { n_shards, ..DbConfig::default() };
        engine.open_db("mqtt", config, Duration::from_secs(5)).await.unwrap();
        engine.add_generation("mqtt", Duration::from_secs(5)).await.unwrap();
        engine
    }

    async fn drain(engine: &Ds, filter_str: &str, start: u64) -> Vec<(u64, String, String)> {
        let filter = parse_filter(filter_str);
        let streams = engine.get_streams("mqtt", &filter, start).await.unwrap();
        let mut out = Vec::new();
        for stream in streams {
            let mut iter = engine.make_iterator("mqtt", &stream, &filter, start).await.unwrap();
            loop {
                match engine.next("mqtt", iter, 100).await.unwrap() {
                    NextResult::EndOfStream => break,
                    NextResult::Messages { iter: next_iter, messages } => {
                        if messages.is_empty() {
                            break;
                        }
                        for (_, m) in messages {
                            out.push((m.timestamp, m.topic_string(), String::from_utf8(m.payload).unwrap()));
                        }
                        iter = next_iter;
                    }
                }
            }
        }
        out.sort();
        out
    }

    /// Only the first of three stored messages survives a
    /// store-then-delete sequence.
    #[tokio::test]
    async fn test_scenario_store_then_delete() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = open(dir.path(), 1).await;

        let batch = OpBatch::new().store(msg("t/1", 100, "M1")).store(msg("t/2", 200, "M2")).store(msg("t/3", 300, "M3"));
        engine.store_batch("mqtt", batch, BatchOpts::default()).await.unwrap();

        let del = OpBatch::new()
            .delete(Matcher { topic: parse_topic("t/2"), timestamp: 200, payload: PayloadMatch::Exact(b"M2".to_vec()) })
            .delete(matcher_any_payload(parse_topic("t/3"), 300))
            .delete(matcher_any_payload(parse_topic("t/4"), 400));
        engine.store_batch("mqtt", del, BatchOpts::default()).await.unwrap();

        let all = drain(&engine, "t/#", 0).await;
        assert_eq!(all, vec![(100, "t/1".to_string(), "M1".to_string())]);
    }

    /// Two topics sharing a two-level prefix replay 10 messages each, in
    /// ascending timestamp order, as two distinct streams.
    #[tokio::test]
    async fn test_scenario_two_topics_two_streams() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = open(dir.path(), 1).await;

        let mut batch = OpBatch::new();
        for i in 1..=10u64 {
            batch = batch.store(msg("foo/bar", i, &format!("bar-{i}")));
            batch = batch.store(msg("foo/bar/baz", i, &format!("baz-{i}")));
        }
        engine.store_batch("mqtt", batch, BatchOpts::default()).await.unwrap();

        let plus_plus = engine.get_streams("mqtt", &parse_filter("+/+"), 0).await.unwrap();
        assert_eq!(plus_plus.len(), 1);

        let foo_hash = engine.get_streams("mqtt", &parse_filter("foo/#"), 0).await.unwrap();
        assert_eq!(foo_hash.len(), 2);

        let all = drain(&engine, "foo/#", 0).await;
        assert_eq!(all.len(), 20);
    }

    /// The current generation reports "nothing more right now" rather than
    /// `end_of_stream` on an immediate re-read.
    #[tokio::test]
    async fn test_current_generation_empty_read_is_not_end_of_stream() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = open(dir.path(), 1).await;

        engine.store_batch("mqtt", OpBatch::new().store(msg("foo/bar", 50, "only")), BatchOpts::default()).await.unwrap();

        let streams = engine.get_streams("mqtt", &parse_filter("foo/bar"), 0).await.unwrap();
        assert_eq!(streams.len(), 1);
        let filter = parse_filter("foo/bar");
        let iter = engine.make_iterator("mqtt", &streams[0], &filter, 0).await.unwrap();
        let NextResult::Messages { iter, messages } = engine.next("mqtt", iter, 10).await.unwrap() else {
            panic!("current generation must not end_of_stream");
        };
        assert_eq!(messages.len(), 1);

        match engine.next("mqtt", iter, 10).await.unwrap() {
            NextResult::Messages { messages, .. } => assert!(messages.is_empty()),
            NextResult::EndOfStream => panic!("open generation must not end_of_stream on empty read"),
        }
    }

    /// 400 messages across 200 learned shapes survive a close/reopen, and
    /// the very next generation inherits the LTS without
    /// writing anything of its own.
    #[tokio::test]
    async fn test_trie_survives_reopen_and_inherits_across_generation() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let engine = open(dir.path(), 1).await;
            let mut batch = OpBatch::new();
            for i in 1..=200u64 {
                batch = batch.store(msg(&format!("wildcard/{i}/suffix/foo"), 100, "x"));
                batch = batch.store(msg(&format!("wildcard/{i}/suffix/bar"), 100, "y"));
            }
            engine.store_batch("mqtt", batch, BatchOpts::default()).await.unwrap();
        }

        let engine = Ds::new(dir.path());
        engine.open_db("mqtt", DbConfig { n_shards: 1, ..DbConfig::default() }, Duration::from_secs(5)).await.unwrap();
        let streams = engine.get_streams("mqtt", &parse_filter("wildcard/#"), 0).await.unwrap();
        assert_eq!(streams.len(), 2);

        engine.add_generation("mqtt", Duration::from_secs(5)).await.unwrap();
        let streams = engine.get_streams("mqtt", &parse_filter("wildcard/#"), 1000).await.unwrap();
        assert_eq!(streams.len(), 2, "LTS must be inherited into the new generation with no writes of its own");
    }

    /// After `drop_generation`, reads on iterators bound to that
    /// generation report `end_of_stream`, never a crash — and a repeated
    /// drop is tolerated as success.
    #[tokio::test]
    async fn test_drop_generation_yields_end_of_stream_and_is_idempotent_at_the_facade() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = open(dir.path(), 1).await;
        engine.store_batch("mqtt", OpBatch::new().store(msg("a/b", 10, "hi")), BatchOpts::default()).await.unwrap();

        let filter = parse_filter("a/b");
        let streams = engine.get_streams("mqtt", &filter, 0).await.unwrap();
        let iter = engine.make_iterator("mqtt", &streams[0], &filter, 0).await.unwrap();

        let gens = engine.list_generations_with_lifetimes("mqtt").await.unwrap();
        let gen_id = *gens[&0].keys().next().unwrap();
        engine.drop_generation("mqtt", 0, gen_id, Duration::from_secs(5)).await.unwrap();
        // Tolerated, not surfaced as an error, even though already dropped.
        engine.drop_generation("mqtt", 0, gen_id, Duration::from_secs(5)).await.unwrap();

        match engine.next("mqtt", iter, 10).await.unwrap() {
            NextResult::EndOfStream => {}
            NextResult::Messages { .. } => panic!("dropped generation must report end_of_stream"),
        }
    }

    /// Storing three messages as a single `atomic=true, sync=true` batch
    /// must surface as exactly one `record_store_batch` call carrying all
    /// three messages, never three separate flushes.
    #[derive(Debug, Default)]
    struct SpySink {
        store_batches: std::sync::Mutex<Vec<(String, u64, u64)>>,
    }

    impl ds_metrics::MetricsSink for SpySink {
        fn record_store_batch(&self, shard: &str, messages: u64, bytes: u64) {
            self.store_batches.lock().unwrap().push((shard.to_string(), messages, bytes));
        }
        fn record_read(&self, _shard: &str, _messages: u64) {}
        fn record_delete(&self, _shard: &str, _messages: u64) {}
        fn record_generation_added(&self, _shard: &str, _gen_id: u64) {}
        fn record_generation_dropped(&self, _shard: &str, _gen_id: u64) {}
        fn record_trie_promotion(&self, _shard: &str) {}
    }

    #[tokio::test]
    async fn test_scenario_one_flush_event_for_a_whole_atomic_synced_batch() {
        let dir = tempfile::TempDir::new().unwrap();
        let spy = Arc::new(SpySink::default());
        let engine = Ds::with_collaborators(dir.path(), Arc::new(clock::SystemClock), spy.clone());
        engine.open_db("mqtt", DbConfig { n_shards: 1, ..DbConfig::default() }, Duration::from_secs(5)).await.unwrap();
        engine.add_generation("mqtt", Duration::from_secs(5)).await.unwrap();

        let batch = OpBatch::new().store(msg("t/1", 100, "M1")).store(msg("t/2", 200, "M2")).store(msg("t/3", 300, "M3"));
        let opts = BatchOpts { atomic: true, sync: true, durable: true };
        engine.store_batch("mqtt", batch, opts).await.unwrap();

        let batches = spy.store_batches.lock().unwrap();
        assert_eq!(batches.len(), 1, "exactly one flush event, got {batches:?}");
        assert_eq!(batches[0].1, 3, "the single flush event must carry all three messages");
    }

    #[tokio::test]
    async fn test_open_db_twice_is_an_error_close_db_then_reopen_succeeds() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = Ds::new(dir.path());
        engine.open_db("mqtt", DbConfig::default(), Duration::from_secs(5)).await.unwrap();
        assert!(matches!(
            engine.open_db("mqtt", DbConfig::default(), Duration::from_secs(5)).await,
            Err(Error::DbAlreadyOpen(_))
        ));

        engine.close_db("mqtt").await.unwrap();
        assert!(matches!(engine.close_db("mqtt").await, Err(Error::DbNotOpen(_))));
        engine.open_db("mqtt", DbConfig::default(), Duration::from_secs(5)).await.unwrap();
    }
}
