//! Generation lifecycle manager (§4.4): owns the sequence of generations
//! within one shard, their metadata, and the `StorageLayout` instance bound
//! to each. The shard buffer (in `ds`) is the only expected caller; this
//! crate knows nothing about watermarks, timeouts, or routing across shards.

mod error;
mod metadata;

pub use error::Error;
pub use metadata::{GenerationLifetime, GenerationMeta};

use ds_kv::{Batch, CommitOpts, KvBackend};
use ds_storage::{GenId, LayoutKind, StorageLayout, StorageOpts};
use std::collections::BTreeMap;
use std::sync::Arc;

struct Entry {
    meta: GenerationMeta,
    layout: Arc<dyn StorageLayout>,
}

/// One shard's generations, oldest to newest. At most one entry has
/// `until == None` — the generation currently open for writes.
pub struct GenerationManager {
    kv: Arc<KvBackend>,
    meta_cf: String,
    opts: StorageOpts,
    generations: BTreeMap<GenId, Entry>,
}

impl GenerationManager {
    /// Open (or initialize) the generation set backed by `meta_cf`, rebuilding
    /// every generation's layout from its persisted column families. A brand
    /// new shard has no generations yet: callers must `add_generation` before
    /// any write or read is possible.
    #[tracing::instrument(skip(kv, opts), fields(meta_cf))]
    pub fn bootstrap(kv: Arc<KvBackend>, meta_cf: impl Into<String>, opts: StorageOpts) -> Result<Self, Error> {
        let meta_cf = meta_cf.into();
        kv.create_cf(&meta_cf)?;

        let mut generations = BTreeMap::new();
        for (key, value) in kv.scan_all(&meta_cf)? {
            let Some(gen_id) = metadata::gen_id_of_key(&key) else {
                continue;
            };
            let meta: GenerationMeta = serde_json::from_slice(&value)?;
            let kind = LayoutKind::from_schema_name(&meta.layout_schema)
                .ok_or_else(|| Error::UnknownSchema(meta.layout_schema.clone(), gen_id))?;
            let layout: Arc<dyn StorageLayout> = ds_storage::open_layout(kind, &kv, gen_id, opts)?.into();
            generations.insert(gen_id, Entry { meta, layout });
        }

        tracing::debug!(count = generations.len(), "bootstrapped generation manager");
        Ok(Self { kv, meta_cf, opts, generations })
    }

    /// Close the current open generation (if any) at `since`, and open a
    /// fresh one of `kind`. If the new layout's schema matches the closed
    /// generation's, its trie is inherited so the successor starts out
    /// already knowing every shape its predecessor learned.
    #[tracing::instrument(skip(self), fields(kind = kind.schema_name(), since, created_at))]
    pub fn add_generation(&mut self, kind: LayoutKind, since: u64, created_at: u64) -> Result<GenId, Error> {
        let current_id = self.current_generation();

        let inherit_trie = if let Some(cur_id) = current_id {
            let cur = self.generations.get(&cur_id).expect("current_generation points at a live entry");
            if since < cur.meta.since {
                return Err(Error::NonMonotonicSince { since, current_since: cur.meta.since });
            }
            if cur.layout.schema_name() == kind.schema_name() {
                cur.layout.trie_dump()
            } else {
                None
            }
        } else {
            None
        };

        let new_id = self.generations.keys().next_back().map_or(1, |id| id + 1);
        for cf in ds_storage::cf_names(kind, new_id) {
            self.kv.create_cf(&cf)?;
        }
        let layout: Arc<dyn StorageLayout> = ds_storage::create_layout(kind, &self.kv, new_id, self.opts, inherit_trie)?.into();
        let meta = GenerationMeta {
            since,
            until: None,
            created_at,
            layout_schema: kind.schema_name().to_string(),
        };

        let mut batch = Batch::new();
        if let Some(cur_id) = current_id {
            let cur = self.generations.get_mut(&cur_id).unwrap();
            cur.meta.until = Some(since);
            batch.put(&self.meta_cf, metadata::meta_key(cur_id), serde_json::to_vec(&cur.meta)?);
        }
        batch.put(&self.meta_cf, metadata::meta_key(new_id), serde_json::to_vec(&meta)?);
        self.kv.commit(batch, CommitOpts::default())?;

        self.generations.insert(new_id, Entry { meta, layout });
        tracing::debug!(gen_id = new_id, "added generation");
        Ok(new_id)
    }

    /// Drop a generation's column families and its metadata entry. Per §4.4
    /// this is *not idempotent*: a repeated drop of an already-removed
    /// `gen_id` returns `Error::GenerationNotFound`, which the caller (the
    /// `ds` facade, replaying administrative operations) must treat as
    /// success rather than propagate.
    #[tracing::instrument(skip(self))]
    pub fn drop_generation(&mut self, gen_id: GenId) -> Result<(), Error> {
        let entry = self.generations.remove(&gen_id).ok_or(Error::GenerationNotFound(gen_id))?;
        entry.layout.drop_layout(&self.kv)?;

        let mut batch = Batch::new();
        batch.delete(&self.meta_cf, metadata::meta_key(gen_id));
        self.kv.commit(batch, CommitOpts::default())?;

        tracing::debug!(gen_id, "dropped generation");
        Ok(())
    }

    pub fn list_generations_with_lifetimes(&self) -> BTreeMap<GenId, GenerationLifetime> {
        self.generations.iter().map(|(id, e)| (*id, GenerationLifetime::from(&e.meta))).collect()
    }

    /// The generation currently open for writes: the one with the largest id
    /// and no `until`. `None` for a shard with no generations yet.
    pub fn current_generation(&self) -> Option<GenId> {
        self.generations.iter().rev().find(|(_, e)| e.meta.until.is_none()).map(|(id, _)| *id)
    }

    /// Returns an owned, cheaply-cloned handle to a generation's layout
    /// rather than a borrow, so a caller (the `ds` shard ingest task) can
    /// release its lock on the `GenerationManager` before running a
    /// (possibly blocking) KV operation against it — readers stay
    /// lock-free against concurrent writers per §5.
    /// `None` if `gen_id` has no live entry (dropped — I5 callers must treat
    /// this the same as "closed"); otherwise whether `until` is set.
    pub fn is_closed(&self, gen_id: GenId) -> Option<bool> {
        self.generations.get(&gen_id).map(|e| e.meta.until.is_some())
    }

    pub fn layout(&self, gen_id: GenId) -> Option<Arc<dyn StorageLayout>> {
        self.generations.get(&gen_id).map(|e| e.layout.clone())
    }

    pub fn current_layout(&self) -> Result<(GenId, Arc<dyn StorageLayout>), Error> {
        let gen_id = self.current_generation().ok_or(Error::NoOpenGeneration)?;
        Ok((gen_id, self.layout(gen_id).expect("current_generation points at a live entry")))
    }

    /// The shared KV handle backing every generation in this shard, for
    /// callers that need to invoke a layout method themselves (the `ds`
    /// shard ingest task, off the async executor via `spawn_blocking`).
    pub fn kv(&self) -> Arc<KvBackend> {
        self.kv.clone()
    }
}
