//! Per-shard ingestion buffer and watermark (§4.5). Writes (`store_batch`,
//! `add_generation`, `drop_generation`) are funnelled through a dedicated
//! `tokio` task reading from an `mpsc` channel — the "single ingest task"
//! serialization §5 requires — while reads (`get_streams`, `next`, ...) go
//! straight against a shared `RwLock<GenerationManager>`, taking only a
//! read lock, so they never wait behind a writer (§5: "Readers are
//! lock-free against writers").

use crate::clock::Clock;
use crate::config::{BatchOpts, DbConfig};
use crate::error::Error;
use ds_generation::{GenerationLifetime, GenerationManager};
use ds_kv::CommitOpts;
use ds_storage::{
    DeleteOutcome, FilterSegment, GenId, Message, NextOutcome, OpBatch, Operation, Stream, StorageLayout, StreamIterator,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};

enum ShardCmd {
    Store { batch: OpBatch, opts: BatchOpts, reply: oneshot::Sender<Result<(), Error>> },
    AddGeneration { since: u64, created_at: u64, reply: oneshot::Sender<Result<GenId, Error>> },
    DropGeneration { gen_id: GenId, reply: oneshot::Sender<Result<(), Error>> },
}

struct ShardState {
    db: String,
    id: u32,
    label: String,
    generations: RwLock<GenerationManager>,
    /// `Latest` (§4.5): the shard's current timestamp watermark, exposed to
    /// readers as `t_max`. Advanced only after a successful commit.
    watermark: AtomicU64,
    config: DbConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn ds_metrics::MetricsSink>,
}

/// A shard's handle: cheap to clone (an `Arc` and a channel sender), owned
/// by the `DbHandle` that routes operations to it.
#[derive(Clone)]
pub(crate) struct Shard {
    pub id: u32,
    state: Arc<ShardState>,
    cmd_tx: mpsc::Sender<ShardCmd>,
}

impl Shard {
    pub fn spawn(
        id: u32,
        db: String,
        mgr: GenerationManager,
        config: DbConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn ds_metrics::MetricsSink>,
    ) -> Self {
        let state = Arc::new(ShardState {
            db,
            id,
            label: id.to_string(),
            generations: RwLock::new(mgr),
            watermark: AtomicU64::new(clock.now_us()),
            config,
            clock,
            metrics,
        });

        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        tokio::spawn(ingest_loop(state.clone(), cmd_rx));

        Shard { id, state, cmd_tx }
    }

    pub fn watermark(&self) -> u64 {
        self.state.watermark.load(Ordering::SeqCst)
    }

    fn task_gone(&self) -> Error {
        Error::ShardTaskGone { db: self.state.db.clone(), shard: self.id }
    }

    pub async fn store_batch(&self, batch: OpBatch, opts: BatchOpts) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(ShardCmd::Store { batch, opts, reply }).await.map_err(|_| self.task_gone())?;
        rx.await.map_err(|_| self.task_gone())?
    }

    pub async fn add_generation(&self, since: u64, created_at: u64) -> Result<GenId, Error> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(ShardCmd::AddGeneration { since, created_at, reply }).await.map_err(|_| self.task_gone())?;
        rx.await.map_err(|_| self.task_gone())?
    }

    /// Not idempotent at the generation manager (§4.4); callers above
    /// (`ds::Db::drop_generation`) must tolerate `GenerationNotFound` as
    /// success when replaying administrative operations.
    pub async fn drop_generation(&self, gen_id: GenId) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(ShardCmd::DropGeneration { gen_id, reply }).await.map_err(|_| self.task_gone())?;
        rx.await.map_err(|_| self.task_gone())?
    }

    pub async fn list_generations_with_lifetimes(&self) -> BTreeMap<GenId, GenerationLifetime> {
        self.state.generations.read().await.list_generations_with_lifetimes()
    }

    /// `None` if `gen_id` was dropped; otherwise whether it's closed. Read
    /// directly against the lock: cheap, no KV I/O.
    async fn generation_closed(&self, gen_id: GenId) -> Option<bool> {
        self.state.generations.read().await.is_closed(gen_id)
    }

    async fn layout_of(&self, gen_id: GenId) -> Option<Arc<dyn StorageLayout>> {
        self.state.generations.read().await.layout(gen_id)
    }

    /// Enumerate every stream (across every live generation whose window
    /// could still hold a message at or after `start_time`) whose messages
    /// might satisfy `filter`. Ranked `(shard, generation)` ascending so a
    /// caller draining ranks in order sees lower generations first (§3).
    pub async fn get_streams(&self, filter: &[FilterSegment], start_time: u64) -> Vec<(GenId, Stream)> {
        let mgr = self.state.generations.read().await;
        let mut out = Vec::new();
        for (gen_id, lifetime) in mgr.list_generations_with_lifetimes() {
            if lifetime.until.is_some_and(|u| u <= start_time) {
                continue;
            }
            if let Some(layout) = mgr.layout(gen_id) {
                out.extend(layout.get_streams(filter).into_iter().map(|s| (gen_id, s)));
            }
        }
        out
    }

    pub async fn get_delete_streams(&self, filter: &[FilterSegment], start_time: u64) -> Vec<(GenId, Stream)> {
        let mgr = self.state.generations.read().await;
        let mut out = Vec::new();
        for (gen_id, lifetime) in mgr.list_generations_with_lifetimes() {
            if lifetime.until.is_some_and(|u| u <= start_time) {
                continue;
            }
            if let Some(layout) = mgr.layout(gen_id) {
                out.extend(layout.get_delete_streams(filter).into_iter().map(|s| (gen_id, s)));
            }
        }
        out
    }

    pub async fn make_iterator(
        &self,
        gen_id: GenId,
        stream: Stream,
        filter: Vec<FilterSegment>,
        start_time: u64,
    ) -> Result<StreamIterator, Error> {
        let layout = self.layout_of(gen_id).await.ok_or(Error::UnknownRank { shard: self.id, generation: gen_id })?;
        blocking(move || layout.make_iterator(&stream, &filter, start_time))
            .await
            .map_err(|source| Error::Storage { db: self.state.db.clone(), shard: self.id, source })
    }

    pub async fn make_delete_iterator(
        &self,
        gen_id: GenId,
        stream: Stream,
        filter: Vec<FilterSegment>,
        start_time: u64,
    ) -> Result<StreamIterator, Error> {
        let layout = self.layout_of(gen_id).await.ok_or(Error::UnknownRank { shard: self.id, generation: gen_id })?;
        blocking(move || layout.make_delete_iterator(&stream, &filter, start_time))
            .await
            .map_err(|source| Error::Storage { db: self.state.db.clone(), shard: self.id, source })
    }

    /// `generation_closed` decides whether an empty result is `EndOfStream`
    /// or "nothing more right now" (I4). A dropped generation always
    /// reports `EndOfStream`, never an error (I5).
    pub async fn next(&self, gen_id: GenId, iter: StreamIterator, batch_size: usize) -> Result<NextOutcome, Error> {
        let Some(generation_closed) = self.generation_closed(gen_id).await else {
            return Ok(NextOutcome::EndOfStream);
        };
        let Some(layout) = self.layout_of(gen_id).await else {
            return Ok(NextOutcome::EndOfStream);
        };
        let kv = { self.state.generations.read().await.kv() };
        let t_max = self.watermark();
        let metrics = self.state.metrics.clone();
        let label = self.state.label.clone();

        let outcome = blocking(move || layout.next(&kv, iter, t_max, batch_size, generation_closed))
            .await
            .map_err(|source| Error::Storage { db: self.state.db.clone(), shard: self.id, source })?;
        if let NextOutcome::Messages { messages, .. } = &outcome {
            metrics.record_read(&label, messages.len() as u64);
        }
        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn delete_next(
        &self,
        gen_id: GenId,
        iter: StreamIterator,
        selector: Arc<dyn Fn(&Message) -> bool + Send + Sync>,
        batch_size: usize,
        commit_opts: CommitOpts,
    ) -> Result<DeleteOutcome, Error> {
        let Some(generation_closed) = self.generation_closed(gen_id).await else {
            return Ok(DeleteOutcome::EndOfStream);
        };
        let Some(layout) = self.layout_of(gen_id).await else {
            return Ok(DeleteOutcome::EndOfStream);
        };
        let kv = { self.state.generations.read().await.kv() };
        let t_max = self.watermark();
        let metrics = self.state.metrics.clone();
        let label = self.state.label.clone();

        let outcome = blocking(move || {
            layout.delete_next(&kv, iter, selector.as_ref(), t_max, batch_size, generation_closed, commit_opts)
        })
        .await
        .map_err(|source| Error::Storage { db: self.state.db.clone(), shard: self.id, source })?;
        if let DeleteOutcome::Deleted { deleted, .. } = &outcome {
            metrics.record_delete(&label, *deleted as u64);
        }
        Ok(outcome)
    }

    pub async fn lookup_message(&self, gen_id: GenId, key: &[u8]) -> Result<Option<Message>, Error> {
        let Some(layout) = self.layout_of(gen_id).await else {
            return Ok(None);
        };
        let kv = { self.state.generations.read().await.kv() };
        let key = key.to_vec();
        blocking(move || layout.lookup_message(&kv, &key))
            .await
            .map_err(|source| Error::Storage { db: self.state.db.clone(), shard: self.id, source })
    }

    pub async fn update_iterator(&self, gen_id: GenId, iter: StreamIterator, key: Vec<u8>) -> Result<StreamIterator, Error> {
        let layout = self.layout_of(gen_id).await.ok_or(Error::UnknownRank { shard: self.id, generation: gen_id })?;
        let kv = { self.state.generations.read().await.kv() };
        blocking(move || layout.update_iterator(&kv, iter, &key))
            .await
            .map_err(|source| Error::Storage { db: self.state.db.clone(), shard: self.id, source })
    }
}

/// Run a CPU/IO-bound `StorageLayout`/`KvBackend` call off the async
/// executor via `tokio::task::spawn_blocking` rather than calling it
/// inline from an async context.
async fn blocking<F, T>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.expect("storage layout task panicked")
}

#[tracing::instrument(skip(state, cmd_rx), fields(db = %state.db, shard = %state.label))]
async fn ingest_loop(state: Arc<ShardState>, mut cmd_rx: mpsc::Receiver<ShardCmd>) {
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            ShardCmd::Store { batch, opts, reply } => {
                let _ = reply.send(do_store(&state, batch, opts).await);
            }
            ShardCmd::AddGeneration { since, created_at, reply } => {
                let _ = reply.send(do_add_generation(&state, since, created_at).await);
            }
            ShardCmd::DropGeneration { gen_id, reply } => {
                let _ = reply.send(do_drop_generation(&state, gen_id).await);
            }
        }
    }
    tracing::debug!("ingest task shutting down: no more handles");
}

/// Assign timestamps (§4.5), hand the batch to the current generation's
/// layout, and — only on success — advance the watermark.
async fn do_store(state: &ShardState, mut batch: OpBatch, opts: BatchOpts) -> Result<(), Error> {
    if !opts.atomic && !batch.preconditions.is_empty() {
        return Err(Error::PreconditionsRequireAtomic);
    }

    let mut latest = state.watermark.load(Ordering::SeqCst);
    let mut bytes = 0u64;
    let mut stored = 0u64;
    for op in batch.ops.iter_mut() {
        match op {
            Operation::Store(msg) => {
                if state.config.force_monotonic_timestamps {
                    latest = msg.timestamp.max(latest + 1);
                } else {
                    latest = latest.max(msg.timestamp);
                }
                msg.timestamp = latest;
                bytes += msg.payload.len() as u64;
                stored += 1;
            }
            Operation::Delete(matcher) => {
                latest = latest.max(matcher.timestamp);
            }
        }
    }

    let (gen_id, layout, kv) = {
        let mgr = state.generations.read().await;
        let (gen_id, layout) = mgr.current_layout().map_err(|source| Error::Generation {
            db: state.db.clone(),
            shard: state.id,
            source,
        })?;
        (gen_id, layout, mgr.kv())
    };

    let sub_batches: Vec<OpBatch> = if opts.atomic {
        vec![batch]
    } else {
        std::mem::take(&mut batch.ops).into_iter().map(|op| OpBatch { ops: vec![op], preconditions: Vec::new() }).collect()
    };
    let commit_opts: CommitOpts = opts.into();

    for sub in sub_batches {
        let layout = layout.clone();
        let kv = kv.clone();
        blocking(move || {
            let prepared = layout.prepare_batch(&kv, &sub)?;
            layout.commit_batch(&kv, prepared, commit_opts)
        })
        .await
        .map_err(|source| Error::Storage { db: state.db.clone(), shard: state.id, source })?;
    }

    state.watermark.store(latest, Ordering::SeqCst);
    state.metrics.record_store_batch(&state.label, stored, bytes);
    tracing::debug!(gen_id, stored, latest, "committed batch");
    Ok(())
}

async fn do_add_generation(state: &ShardState, since: u64, created_at: u64) -> Result<GenId, Error> {
    let watermark = state.watermark.load(Ordering::SeqCst);
    if since < watermark {
        return Err(Error::GenerationSinceBehindWatermark {
            db: state.db.clone(),
            shard: state.id,
            since,
            watermark,
        });
    }

    let mut mgr = state.generations.write().await;
    let gen_id = mgr
        .add_generation(state.config.layout_kind, since, created_at)
        .map_err(|source| Error::Generation { db: state.db.clone(), shard: state.id, source })?;
    state.metrics.record_generation_added(&state.label, gen_id);
    Ok(gen_id)
}

async fn do_drop_generation(state: &ShardState, gen_id: GenId) -> Result<(), Error> {
    let mut mgr = state.generations.write().await;
    mgr.drop_generation(gen_id)
        .map_err(|source| Error::Generation { db: state.db.clone(), shard: state.id, source })?;
    state.metrics.record_generation_dropped(&state.label, gen_id);
    Ok(())
}
