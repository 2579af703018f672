use crate::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Bounded exponential backoff: base * 2^n, capped.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
        }
    }

    /// Delay before retry number `attempt` (0-based: the wait after the
    /// first failure is `delay_for_attempt(0)`).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 1u64 << attempt.min(16);
        let delay = self.base_delay.saturating_mul(multiplier as u32);
        delay.min(self.max_delay)
    }

    /// Delay with up to 25% random jitter added.
    pub fn jittered(&self, delay: Duration) -> Duration {
        let ms = delay.as_millis() as u64;
        if ms == 0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0..=ms / 4);
        Duration::from_millis(ms + jitter)
    }
}
