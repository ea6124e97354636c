use rand::Rng;
use std::time::Duration;

/// Exponential backoff with up to 50% random jitter on each step, so nodes
/// that lost the same race don't come back in lockstep.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial,
            max: max.max(initial),
        }
    }

    /// Delay to sleep now; doubles the base for next time
    pub fn next_delay(&mut self) -> Duration {
        let delay = jittered(self.current);
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

/// `base` plus a random extra of up to half of it
pub fn jittered(base: Duration) -> Duration {
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    // thread_rng is not Send; keep it out of any await point
    let extra = rand::thread_rng().gen_range(0..=base_ms / 2);
    base + Duration::from_millis(extra)
}
