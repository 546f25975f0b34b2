/// Per-layout tunables threaded through `StorageLayout` construction.
/// Changing any of these requires a new generation (§4.4's schema
/// evolution framing) — they're baked into the key schema a generation's
/// column families already contain.
#[derive(Clone, Copy, Debug)]
pub struct StorageOpts {
    /// Width, in bytes, of a learned topic shape's static key (§4.1).
    pub static_key_width: usize,
    /// Width, in bytes, of the truncated MD5 used for varying-token index
    /// entries (§4.2, "configurable, typically 8 bytes").
    pub hash_width: usize,
    /// Widens the current generation's safe-cutoff horizon
    /// (`t_max := Latest - safety_margin_us`) beyond the watermark itself,
    /// for callers fronting a group-commit writer with batching latency.
    /// Zero by default: the shard buffer only advances `Latest` after a
    /// successful commit, so no margin is required purely for correctness.
    pub safety_margin_us: u64,
}

impl Default for StorageOpts {
    fn default() -> Self {
        Self {
            static_key_width: 8,
            hash_width: 8,
            safety_margin_us: 0,
        }
    }
}
