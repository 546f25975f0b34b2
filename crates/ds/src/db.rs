//! The DS Facade (§4.6): routes each consumer-API call by database and
//! shard, picks a message's shard by `phash(key) mod N` (§3), fans
//! `get_streams`/`get_delete_streams` out across every shard of the DB, and
//! wraps layout-returned streams/iterators in handles that remember their
//! `(shard, generation)` rank.

use crate::clock::Clock;
use crate::config::{BatchOpts, DbConfig, ShardKey};
use crate::error::Error;
use crate::handle::{DeleteResult, Iterator, MessageKey, NextResult, Rank, StreamHandle};
use crate::shard::Shard;
use ds_generation::{GenerationLifetime, GenerationManager};
use ds_kv::KvBackend;
use ds_storage::{DeleteOutcome, FilterSegment, GenId, Matcher, Message, NextOutcome, OpBatch, Operation};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// One open database: its configuration and its shards.
pub(crate) struct DbHandle {
    name: String,
    config: DbConfig,
    shards: Vec<Shard>,
}

impl DbHandle {
    #[tracing::instrument(skip(clock, metrics), fields(db = %name, n_shards = config.n_shards))]
    pub fn open(
        name: &str,
        config: DbConfig,
        root: &Path,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn ds_metrics::MetricsSink>,
    ) -> Result<Self, Error> {
        let mut shards = Vec::with_capacity(config.n_shards as usize);
        for id in 0..config.n_shards {
            let shard_dir = root.join(name).join(id.to_string());
            std::fs::create_dir_all(&shard_dir).map_err(|source| Error::Io { path: shard_dir.clone(), source })?;

            let kv = Arc::new(KvBackend::open(&shard_dir, &[])?);
            let mgr = GenerationManager::bootstrap(kv, "generations", config.storage_opts)
                .map_err(|source| Error::Generation { db: name.to_string(), shard: id, source })?;
            shards.push(Shard::spawn(id, name.to_string(), mgr, config, clock.clone(), metrics.clone()));
        }
        tracing::debug!("opened db");
        Ok(Self { name: name.to_string(), config, shards })
    }

    fn shard(&self, id: u32) -> Result<&Shard, Error> {
        self.shards.get(id as usize).ok_or(Error::UnknownShard(id))
    }

    fn shard_for_key(&self, key: &str) -> &Shard {
        let idx = (xxhash_rust::xxh3::xxh3_64(key.as_bytes()) % self.config.n_shards as u64) as usize;
        &self.shards[idx]
    }

    fn shard_for_message(&self, msg: &Message) -> &Shard {
        let key = match self.config.serialize_by {
            ShardKey::ClientId => msg.from.as_str(),
            ShardKey::Topic => return self.shard_for_key(&msg.topic_string()),
        };
        self.shard_for_key(key)
    }

    /// Delete matchers carry a topic but no publisher, so a delete always
    /// routes by topic regardless of `serialize_by` — a store routed by
    /// client-id and its later delete by the same client therefore land on
    /// different shards in that configuration. Documented in DESIGN.md.
    fn shard_for_matcher(&self, matcher: &Matcher) -> &Shard {
        self.shard_for_key(&matcher.topic.join("/"))
    }

    #[tracing::instrument(skip(self, batch), fields(db = %self.name, ops = batch.ops.len()))]
    pub async fn store_batch(&self, batch: OpBatch, opts: BatchOpts) -> Result<(), Error> {
        let mut by_shard: BTreeMap<u32, OpBatch> = BTreeMap::new();
        for op in batch.ops {
            let shard_id = match &op {
                Operation::Store(msg) => self.shard_for_message(msg).id,
                Operation::Delete(matcher) => self.shard_for_matcher(matcher).id,
            };
            by_shard.entry(shard_id).or_default().ops.push(op);
        }
        for precondition in &batch.preconditions {
            let shard_id = self.shard_for_matcher(&precondition.matcher).id;
            by_shard.entry(shard_id).or_default().preconditions.push(precondition.clone());
        }

        for (shard_id, shard_batch) in by_shard {
            self.shard(shard_id)?.store_batch(shard_batch, opts).await?;
        }
        Ok(())
    }

    /// Adds a generation on every shard of this DB. §5: administrative
    /// operations carry an explicit deadline from the caller; each shard's
    /// call is bounded individually so one slow shard doesn't starve the
    /// timeout budget of the others.
    pub async fn add_generation(&self, since: u64, created_at: u64, deadline: Duration) -> Result<Vec<(u32, GenId)>, Error> {
        let mut out = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            let gen_id = tokio::time::timeout(deadline, shard.add_generation(since, created_at))
                .await
                .map_err(|_| Error::Timeout { db: self.name.clone(), shard: shard.id })??;
            out.push((shard.id, gen_id));
        }
        Ok(out)
    }

    /// Not idempotent (§4.4): a repeated drop of an already-removed
    /// generation surfaces `GenerationNotFound`, which this facade's caller
    /// (`ds::Ds::drop_generation`) treats as success.
    pub async fn drop_generation(&self, shard_id: u32, gen_id: GenId, deadline: Duration) -> Result<(), Error> {
        tokio::time::timeout(deadline, self.shard(shard_id)?.drop_generation(gen_id))
            .await
            .map_err(|_| Error::Timeout { db: self.name.clone(), shard: shard_id })?
    }

    pub async fn list_generations_with_lifetimes(&self) -> BTreeMap<u32, BTreeMap<GenId, GenerationLifetime>> {
        let mut out = BTreeMap::new();
        for shard in &self.shards {
            out.insert(shard.id, shard.list_generations_with_lifetimes().await);
        }
        out
    }

    pub async fn get_streams(&self, filter: &[FilterSegment], start_time: u64) -> Vec<StreamHandle> {
        let mut out = Vec::new();
        for shard in &self.shards {
            for (gen_id, inner) in shard.get_streams(filter, start_time).await {
                out.push(StreamHandle { rank: Rank { shard: shard.id, generation: gen_id }, inner });
            }
        }
        out
    }

    pub async fn get_delete_streams(&self, filter: &[FilterSegment], start_time: u64) -> Vec<StreamHandle> {
        let mut out = Vec::new();
        for shard in &self.shards {
            for (gen_id, inner) in shard.get_delete_streams(filter, start_time).await {
                out.push(StreamHandle { rank: Rank { shard: shard.id, generation: gen_id }, inner });
            }
        }
        out
    }

    pub async fn make_iterator(&self, stream: &StreamHandle, filter: &[FilterSegment], start_time: u64) -> Result<Iterator, Error> {
        let rank = stream.rank;
        let inner = self
            .shard(rank.shard)?
            .make_iterator(rank.generation, stream.inner.clone(), filter.to_vec(), start_time)
            .await?;
        Ok(Iterator { rank, inner })
    }

    pub async fn make_delete_iterator(
        &self,
        stream: &StreamHandle,
        filter: &[FilterSegment],
        start_time: u64,
    ) -> Result<Iterator, Error> {
        let rank = stream.rank;
        let inner = self
            .shard(rank.shard)?
            .make_delete_iterator(rank.generation, stream.inner.clone(), filter.to_vec(), start_time)
            .await?;
        Ok(Iterator { rank, inner })
    }

    pub async fn next(&self, iter: Iterator, batch_size: usize) -> Result<NextResult, Error> {
        let rank = iter.rank;
        match self.shard(rank.shard)?.next(rank.generation, iter.inner, batch_size).await? {
            NextOutcome::EndOfStream => Ok(NextResult::EndOfStream),
            NextOutcome::Messages { iter: inner, messages } => Ok(NextResult::Messages {
                iter: Iterator { rank, inner },
                messages: messages.into_iter().map(|(key, msg)| (MessageKey { rank, inner: key }, msg)).collect(),
            }),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn delete_next(
        &self,
        iter: Iterator,
        selector: Arc<dyn Fn(&Message) -> bool + Send + Sync>,
        batch_size: usize,
        commit_opts: ds_kv::CommitOpts,
    ) -> Result<DeleteResult, Error> {
        let rank = iter.rank;
        match self.shard(rank.shard)?.delete_next(rank.generation, iter.inner, selector, batch_size, commit_opts).await? {
            DeleteOutcome::EndOfStream => Ok(DeleteResult::EndOfStream),
            DeleteOutcome::Deleted { iter: inner, deleted } => {
                Ok(DeleteResult::Deleted { iter: Iterator { rank, inner }, deleted })
            }
        }
    }

    pub async fn lookup_message(&self, key: &MessageKey) -> Result<Option<Message>, Error> {
        self.shard(key.rank.shard)?.lookup_message(key.rank.generation, &key.inner).await
    }

    /// Rebind a persisted `message_key` to a resumable iterator, validating
    /// that the key's rank matches the iterator's (§4.6) before asking the
    /// layout to validate the key belongs to the iterator's shape.
    pub async fn update_iterator(&self, iter: Iterator, key: &MessageKey) -> Result<Iterator, Error> {
        if iter.rank != key.rank {
            return Err(Error::UnknownRank { shard: key.rank.shard, generation: key.rank.generation });
        }
        let rank = iter.rank;
        let inner = self.shard(rank.shard)?.update_iterator(rank.generation, iter.inner, key.inner.clone()).await?;
        Ok(Iterator { rank, inner })
    }
}
