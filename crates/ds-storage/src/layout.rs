use crate::message::{Message, OpBatch};
use crate::Error;
use ds_kv::{CommitOpts, KvBackend};
use ds_lts::{FilterSegment, StaticKey};

/// A replayable KV key identifying one stored message within a layout's
/// column families. Opaque to callers; they round-trip it through
/// `lookup_message` / `update_iterator` / delete selectors.
pub type MessageKey = Vec<u8>;

/// A stream handle as returned by `get_streams` / `get_delete_streams`: a
/// subset of messages within *this generation's* layout that must be
/// replayed in timestamp order. The generation manager (§4.4) is what
/// attaches the `(shard, generation)` rank around this; a bare `Stream`
/// only identifies a layout-local replay unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Stream {
    /// The reference layout has exactly one stream: a full scan.
    Reference,
    /// One stream per learned topic shape.
    Skipstream { static_key: StaticKey },
}

/// A resumable cursor over one `Stream`. Small and `Clone`, so callers may
/// persist it (e.g. serialize it) and hand it back to `next` or
/// `update_iterator` later, possibly after a process restart.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamIterator {
    Reference {
        filter: Vec<FilterSegment>,
        next_ts: u64,
    },
    Skipstream {
        static_key: StaticKey,
        filter: Vec<FilterSegment>,
        next_ts: u64,
    },
}

impl StreamIterator {
    pub fn next_ts(&self) -> u64 {
        match self {
            StreamIterator::Reference { next_ts, .. } => *next_ts,
            StreamIterator::Skipstream { next_ts, .. } => *next_ts,
        }
    }
}

/// Outcome of one `next`/`delete_next` scan step. A layout decides
/// `EndOfStream` itself (I4); an empty `messages` vec with the same
/// iterator returned is a legal "nothing new yet" result on the current
/// (open) generation.
#[derive(Debug)]
pub enum NextOutcome {
    Messages {
        iter: StreamIterator,
        messages: Vec<(MessageKey, Message)>,
    },
    EndOfStream,
}

#[derive(Debug)]
pub enum DeleteOutcome {
    Deleted { iter: StreamIterator, deleted: usize },
    EndOfStream,
}

/// A pluggable physical storage + index scheme for one generation.
///
/// One instance is bound to exactly one generation's column families (§4.4:
/// "each generation is owned by a single layout instance"); the generation
/// manager is the only caller that constructs, opens, or drops a
/// `StorageLayout`.
pub trait StorageLayout: Send + Sync {
    /// The name persisted as this generation's `layout_schema` (§6.3); also
    /// used by the generation manager to decide whether a predecessor's
    /// trie can be inherited (`trie_dump`/`trie_restore` require the
    /// successor to share this schema).
    fn schema_name(&self) -> &'static str;

    /// Whether `prepare_batch` honours `OpBatch::preconditions`. Backend
    /// dependent (§9 Open Questions) — the reference layout refuses them.
    fn supports_preconditions(&self) -> bool;

    /// Remove every column family owned by this generation. Not expected to
    /// be idempotent itself; the generation manager is responsible for
    /// tolerating "already dropped" at its own layer (§4.4).
    fn drop_layout(&self, kv: &KvBackend) -> Result<(), Error>;

    /// Resolve `batch` against the current KV state (precondition checks,
    /// LTS interning, delete-candidate lookup) into a single atomic write.
    /// Read-only against `kv`; nothing is durable until `commit_batch`.
    fn prepare_batch(&self, kv: &KvBackend, batch: &OpBatch) -> Result<PreparedBatch, Error>;

    /// Durably apply a batch produced by `prepare_batch`.
    fn commit_batch(
        &self,
        kv: &KvBackend,
        prepared: PreparedBatch,
        commit_opts: CommitOpts,
    ) -> Result<(), Error>;

    /// Enumerate every stream whose messages might satisfy `filter`.
    fn get_streams(&self, filter: &[FilterSegment]) -> Vec<Stream>;

    /// Open an iterator over `stream`, positioned so the first call to
    /// `next` returns messages with `timestamp >= start_time`.
    fn make_iterator(
        &self,
        stream: &Stream,
        filter: &[FilterSegment],
        start_time: u64,
    ) -> Result<StreamIterator, Error>;

    /// Advance `iter`, returning up to `batch_size` matching messages with
    /// `timestamp <= t_max`. `generation_closed` tells the layout whether an
    /// empty result means "nothing more right now" (current generation) or
    /// `EndOfStream` (closed/dropped generation; I4/I5).
    fn next(
        &self,
        kv: &KvBackend,
        iter: StreamIterator,
        t_max: u64,
        batch_size: usize,
        generation_closed: bool,
    ) -> Result<NextOutcome, Error>;

    /// Rebind a persisted `message_key` to a resumable iterator, validating
    /// that the key belongs to `iter`'s shape.
    fn update_iterator(
        &self,
        kv: &KvBackend,
        iter: StreamIterator,
        message_key: &[u8],
    ) -> Result<StreamIterator, Error>;

    fn lookup_message(&self, kv: &KvBackend, message_key: &[u8]) -> Result<Option<Message>, Error>;

    /// Mirrors `get_streams`, for the delete path.
    fn get_delete_streams(&self, filter: &[FilterSegment]) -> Vec<Stream> {
        self.get_streams(filter)
    }

    fn make_delete_iterator(
        &self,
        stream: &Stream,
        filter: &[FilterSegment],
        start_time: u64,
    ) -> Result<StreamIterator, Error> {
        self.make_iterator(stream, filter, start_time)
    }

    /// Walk forward from `iter`, applying `selector` to each candidate
    /// message and removing every key (every index level, for
    /// skipstream-LTS) backing a match. Commits its own removals; does not
    /// hand a batch back to the caller.
    #[allow(clippy::too_many_arguments)]
    fn delete_next(
        &self,
        kv: &KvBackend,
        iter: StreamIterator,
        selector: &dyn Fn(&Message) -> bool,
        t_max: u64,
        batch_size: usize,
        generation_closed: bool,
        commit_opts: CommitOpts,
    ) -> Result<DeleteOutcome, Error>;

    /// A full dump of this layout's LTS trie, for inheritance into a
    /// successor generation sharing this schema. `None` for
    /// layouts with no trie (the reference layout). Inheritance happens at
    /// construction time — see `crate::factory::create_layout` — rather
    /// than via a post-construction load, since the in-memory trie has no
    /// incremental "absorb these extra edges" entry point once built.
    fn trie_dump(&self) -> Option<Vec<(Vec<u8>, Vec<u8>)>> {
        None
    }
}

/// The batch-scoped accumulator produced by `prepare_batch`: everything
/// needed to durably commit, already validated against preconditions. §9's
/// "Source pattern: process-local mutable dictionary used for pending trie
/// persistence ops" is replaced by this struct flowing explicitly from
/// `prepare_batch` to `commit_batch` rather than living in shared mutable
/// state.
pub struct PreparedBatch {
    pub kv_batch: ds_kv::Batch,
}
