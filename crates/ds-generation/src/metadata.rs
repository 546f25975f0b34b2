use ds_storage::GenId;
use serde::{Deserialize, Serialize};

/// Persisted generation record (§6.3: "term-encoded `{GenId, {since, until?,
/// created_at, layout_schema}}`"), JSON-encoded per SPEC_FULL §4.4's AMBIENT
/// note rather than a bespoke binary format.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenerationMeta {
    pub since: u64,
    pub until: Option<u64>,
    pub created_at: u64,
    pub layout_schema: String,
}

/// The subset of `GenerationMeta` surfaced by `list_generations_with_lifetimes`
/// (§4.4): callers don't need to know which layout schema backs a generation
/// to reason about its lifetime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerationLifetime {
    pub since: u64,
    pub until: Option<u64>,
    pub created_at: u64,
}

impl From<&GenerationMeta> for GenerationLifetime {
    fn from(meta: &GenerationMeta) -> Self {
        GenerationLifetime {
            since: meta.since,
            until: meta.until,
            created_at: meta.created_at,
        }
    }
}

/// Generation metadata keys sort in `GenId` order, so a bounded scan of the
/// metadata CF enumerates generations oldest-first without needing a
/// separate index.
pub fn meta_key(gen_id: GenId) -> Vec<u8> {
    gen_id.to_be_bytes().to_vec()
}

pub fn gen_id_of_key(key: &[u8]) -> Option<GenId> {
    Some(GenId::from_be_bytes(key.try_into().ok()?))
}
