//! A capability object in place of a source-pattern callback table: a
//! `LayoutKind` selects which concrete `StorageLayout` to construct, and
//! the generation manager holds the result behind `dyn StorageLayout` — it
//! never matches on `LayoutKind` again once a generation is open.

use crate::layout::StorageLayout;
use crate::opts::StorageOpts;
use crate::reference::ReferenceLayout;
use crate::skipstream::SkipstreamLts;
use crate::Error;
use ds_kv::KvBackend;

pub type GenId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayoutKind {
    Reference,
    SkipstreamLts,
}

impl LayoutKind {
    pub fn schema_name(&self) -> &'static str {
        match self {
            LayoutKind::Reference => "reference",
            LayoutKind::SkipstreamLts => "skipstream-lts",
        }
    }

    pub fn from_schema_name(name: &str) -> Option<Self> {
        match name {
            "reference" => Some(LayoutKind::Reference),
            "skipstream-lts" => Some(LayoutKind::SkipstreamLts),
            _ => None,
        }
    }
}

/// Declare the column families a fresh generation of `kind` will need,
/// before any data is written — the generation manager creates these ahead
/// of constructing the layout itself.
pub fn cf_names(kind: LayoutKind, gen_id: GenId) -> Vec<String> {
    match kind {
        LayoutKind::Reference => crate::reference::cf_names(gen_id),
        LayoutKind::SkipstreamLts => crate::skipstream::cf_names(gen_id),
    }
}

/// Construct a fresh generation's layout. `inherit_trie`, when `Some`,
/// carries a predecessor generation's `trie_dump()` — only meaningful (and
/// only ever passed) when the predecessor's `schema_name()` equals `kind`'s;
/// passing it to a `Reference` layout is a no-op since it has no trie to
/// seed.
pub fn create_layout(
    kind: LayoutKind,
    kv: &KvBackend,
    gen_id: GenId,
    opts: StorageOpts,
    inherit_trie: Option<Vec<(Vec<u8>, Vec<u8>)>>,
) -> Result<Box<dyn StorageLayout>, Error> {
    match kind {
        LayoutKind::Reference => Ok(Box::new(ReferenceLayout::create(kv, gen_id)?)),
        LayoutKind::SkipstreamLts => Ok(Box::new(SkipstreamLts::create(kv, gen_id, opts, inherit_trie)?)),
    }
}

/// Reopen an existing generation after a restart, rebuilding any in-memory
/// state (the LTS trie) from its persisted column families.
pub fn open_layout(kind: LayoutKind, kv: &KvBackend, gen_id: GenId, opts: StorageOpts) -> Result<Box<dyn StorageLayout>, Error> {
    match kind {
        LayoutKind::Reference => Ok(Box::new(ReferenceLayout::open(kv, gen_id)?)),
        LayoutKind::SkipstreamLts => Ok(Box::new(SkipstreamLts::open(kv, gen_id, opts)?)),
    }
}
