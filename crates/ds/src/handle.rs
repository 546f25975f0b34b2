//! Opaque handles the facade hands back to callers (§9: "tagged tuples as
//! opaque handles" replaced with sum types carrying the shard id and the
//! layout-specific payload). A bare `ds_storage::Stream`/`StreamIterator`
//! only identifies a replay unit *within one generation's layout*; these
//! wrappers attach the `(shard, generation)` rank the generation manager
//! and shard buffer track above the layout (§4.6).

use ds_storage::{GenId, MessageKey as RawMessageKey, Message, Stream, StreamIterator};

/// `(X, Y)` from §3: streams with distinct `X` are independent and may be
/// read in parallel; within equal `X`, lower `Y` must be fully drained
/// before higher `Y`. In this facade `X` is the shard id and `Y` is the
/// generation id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rank {
    pub shard: u32,
    pub generation: GenId,
}

/// A stream handle as returned by `get_streams`/`get_delete_streams`,
/// remembering which shard and generation it came from so `make_iterator`
/// can route back to the right layout.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamHandle {
    pub rank: Rank,
    pub(crate) inner: Stream,
}

/// A resumable cursor over one `StreamHandle`. Small and `Clone`, matching
/// `ds_storage::StreamIterator`'s own contract — callers may serialize and
/// persist it across a restart, then hand it back via `update_iterator`.
#[derive(Clone, Debug, PartialEq)]
pub struct Iterator {
    pub rank: Rank,
    pub(crate) inner: StreamIterator,
}

impl Iterator {
    pub fn next_ts(&self) -> u64 {
        self.inner.next_ts()
    }
}

/// A replayable key identifying one stored message, scoped to the shard and
/// generation that produced it — the bare `ds_storage::MessageKey` bytes are
/// only meaningful within that one generation's column families.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageKey {
    pub rank: Rank,
    pub(crate) inner: RawMessageKey,
}

/// Outcome of one `next` call (§6.1). A layout decides `EndOfStream` itself
/// (I4); `Messages` with an empty `messages` vec is a legal "nothing new
/// yet" result on the current (open) generation.
#[derive(Debug)]
pub enum NextResult {
    Messages { iter: Iterator, messages: Vec<(MessageKey, Message)> },
    EndOfStream,
}

#[derive(Debug)]
pub enum DeleteResult {
    Deleted { iter: Iterator, deleted: usize },
    EndOfStream,
}
