#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Kv(#[from] ds_kv::Error),
    #[error(transparent)]
    Lts(#[from] ds_lts::Error),
    #[error("corrupt stored record at key {0:?}")]
    CorruptRecord(Vec<u8>),
    #[error("precondition {kind:?} failed for topic {topic:?} at ts={timestamp}")]
    PreconditionFailed {
        kind: crate::message::PreconditionKind,
        topic: Vec<String>,
        timestamp: u64,
    },
    #[error("the {0} layout does not support preconditions")]
    PreconditionsUnsupported(&'static str),
    #[error("iterator does not belong to static shape {0:?}")]
    IteratorShapeMismatch(ds_lts::StaticKey),
    #[error("message key {0:?} does not belong to any known static shape")]
    UnknownMessageKey(Vec<u8>),
    #[error("topic filter does not match any learned shape")]
    NoMatchingShape,
}
