//! The Clock collaborator (§6.2): microsecond monotonic time for the shard
//! watermark, wall-clock time for `created_at`, injected as an overridable
//! collaborator rather than calling `SystemTime::now()` inline, so tests can
//! freeze time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    /// Monotonically non-decreasing microseconds, used to seed and advance a
    /// shard's watermark.
    fn now_us(&self) -> u64;

    /// Wall-clock microseconds, used for `created_at` timestamps. May jump
    /// (NTP adjustment); never used for ordering decisions.
    fn wall_clock_us(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_us(&self) -> u64 {
        wall_clock_us_now()
    }

    fn wall_clock_us(&self) -> u64 {
        wall_clock_us_now()
    }
}

fn wall_clock_us_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// A settable clock for deterministic tests: `set` never moves time
/// backwards relative to what's already been observed by callers reading
/// `now_us`.
#[derive(Debug, Default)]
pub struct FrozenClock {
    us: AtomicU64,
}

impl FrozenClock {
    pub fn new(start_us: u64) -> Self {
        Self { us: AtomicU64::new(start_us) }
    }

    pub fn set(&self, us: u64) {
        self.us.store(us, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_us: u64) {
        self.us.fetch_add(delta_us, Ordering::SeqCst);
    }
}

impl Clock for FrozenClock {
    fn now_us(&self) -> u64 {
        self.us.load(Ordering::SeqCst)
    }

    fn wall_clock_us(&self) -> u64 {
        self.us.load(Ordering::SeqCst)
    }
}
