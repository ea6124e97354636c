// Lease timestamps
//
// Lease values carry the writer's wall-clock time in nanoseconds since the
// Unix epoch. Nodes compare those stamps against their own clock, so the
// values are only "monotonic-ish" across the cluster:
// - a single clock never hands out the same stamp twice
// - a single clock never goes backwards, even if the system time does
// - clocks on different nodes may disagree (see `skew_grace_multiplier`)

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of lease timestamps
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Nanoseconds since the Unix epoch
    fn now_nanos(&self) -> u64;
}

/// Wall clock that never repeats or regresses
#[derive(Debug, Default)]
pub struct SystemClock {
    last: AtomicU64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    fn physical_now() -> u64 {
        // A pre-epoch system time reads as zero; the `last` floor keeps us moving.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

impl Clock for SystemClock {
    fn now_nanos(&self) -> u64 {
        let physical = Self::physical_now();
        let mut last = self.last.load(Ordering::SeqCst);
        loop {
            // Physical time hasn't advanced past what we already handed out
            let next = if physical > last { physical } else { last + 1 };
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(observed) => last = observed,
            }
        }
    }
}

/// Hand-driven clock for tests and simulations
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_nanos: u64) -> Self {
        Self {
            now: AtomicU64::new(start_nanos),
        }
    }

    pub fn advance(&self, by: Duration) {
        let nanos = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        self.now.fetch_add(nanos, Ordering::SeqCst);
    }

    pub fn set(&self, nanos: u64) {
        self.now.store(nanos, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Age of a stamp relative to `now`; stamps from the future count as fresh.
pub fn age(now_nanos: u64, stamp_nanos: u64) -> Duration {
    Duration::from_nanos(now_nanos.saturating_sub(stamp_nanos))
}
