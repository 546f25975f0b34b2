//! The skipstream-LTS key schema: `static_key ∥ wildcard_level:16 ∥
//! hash_bytes* ∥ timestamp:64`. Level 0 is the data stream (no hash
//! component — nothing to hash for "the whole message"); levels `1..=W`
//! are index streams, one per varying token position, carrying a truncated
//! MD5 of that position's token.

use ds_kv::KeyRange;
use ds_lts::StaticKey;

pub const LEVEL_DATA: u16 = 0;

/// Truncated MD5 of a token, `width` bytes (default 8; §4.2).
pub fn hash_token(token: &str, width: usize) -> Vec<u8> {
    let digest = md5::compute(token.as_bytes());
    digest.0[..width.min(16)].to_vec()
}

fn prefix(static_key: &StaticKey, level: u16) -> Vec<u8> {
    let mut buf = static_key.as_bytes().to_vec();
    buf.extend_from_slice(&level.to_be_bytes());
    buf
}

pub fn data_key(static_key: &StaticKey, ts: u64) -> Vec<u8> {
    let mut k = prefix(static_key, LEVEL_DATA);
    k.extend_from_slice(&ts.to_be_bytes());
    k
}

pub fn index_key(static_key: &StaticKey, level: u16, hash: &[u8], ts: u64) -> Vec<u8> {
    let mut k = prefix(static_key, level);
    k.extend_from_slice(hash);
    k.extend_from_slice(&ts.to_be_bytes());
    k
}

/// Bounds a cursor to exactly the data stream of one static shape, so it can
/// never cross into a neighbouring shape or its own index levels.
pub fn data_range(static_key: &StaticKey) -> KeyRange {
    KeyRange::prefix(&prefix(static_key, LEVEL_DATA))
}

/// Bounds a cursor to exactly one index level's `(static, level, hash)`
/// bucket.
pub fn index_range(static_key: &StaticKey, level: u16, hash: &[u8]) -> KeyRange {
    let mut p = prefix(static_key, level);
    p.extend_from_slice(hash);
    KeyRange::prefix(&p)
}

/// Extract the trailing timestamp from a key known to have `prefix_len`
/// bytes before it (the caller knows its own key shape).
pub fn timestamp_of(key: &[u8]) -> Option<u64> {
    if key.len() < 8 {
        return None;
    }
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&key[key.len() - 8..]);
    Some(u64::from_be_bytes(ts))
}

/// Used internally by the multi-cursor skip algorithm to re-seek every
/// cursor to a single candidate timestamp.
pub fn dec_ts(ts: u64) -> u64 {
    ts.wrapping_sub(1)
}

pub fn inc_ts(ts: u64) -> u64 {
    ts.wrapping_add(1)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_wraparound_helpers() {
        assert_eq!(dec_ts(0), u64::MAX);
        assert_eq!(inc_ts(u64::MAX), 0);
    }

    #[test]
    fn test_data_and_index_keys_share_static_prefix_but_differ() {
        let sk = StaticKey::from_bytes(vec![1, 2, 3, 4, 5, 6, 7, 8].into_boxed_slice());
        let dk = data_key(&sk, 100);
        let ik = index_key(&sk, 1, &hash_token("bar", 8), 100);
        assert_ne!(dk, ik);
        assert_eq!(timestamp_of(&dk), Some(100));
        assert_eq!(timestamp_of(&ik), Some(100));
    }
}
