use ds_storage::GenId;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("key-value backend error: {0}")]
    Kv(#[from] ds_kv::Error),
    #[error("storage layout error: {0}")]
    Storage(#[from] ds_storage::Error),
    #[error("generation metadata codec error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("generation {0} not found")]
    GenerationNotFound(GenId),
    #[error("unknown layout schema {0:?} recorded for generation {1}")]
    UnknownSchema(String, GenId),
    #[error("add_generation: since={since} is not >= current generation's since={current_since}")]
    NonMonotonicSince { since: u64, current_since: u64 },
    #[error("no generation is currently open")]
    NoOpenGeneration,
}
