//! Poll backoff: a pure function from attempt index to delay.

use std::time::Duration;

/// Maps a poll attempt counter to the delay applied before that poll.
/// Attempt 0 is the first poll and carries no delay by convention.
pub trait PollBackoff: Send + Sync {
    fn delay(&self, attempt: u32) -> Duration;
}

/// Same delay between every poll.
#[derive(Clone, Debug)]
pub struct FixedBackoff {
    pub interval: Duration,
}

impl PollBackoff for FixedBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            Duration::ZERO
        } else {
            self.interval
        }
    }
}

/// Doubling delay, clamped at `cap` so latency after a reconnection stays
/// bounded.
#[derive(Clone, Debug)]
pub struct CappedExponentialBackoff {
    pub initial: Duration,
    pub cap: Duration,
}

impl CappedExponentialBackoff {
    /// Defaults: 500ms doubling up to 10s.
    pub fn standard() -> Self {
        Self {
            initial: Duration::from_millis(500),
            cap: Duration::from_secs(10),
        }
    }
}

impl PollBackoff for CappedExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(16);
        self.initial
            .saturating_mul(1u32 << exponent)
            .min(self.cap)
    }
}
