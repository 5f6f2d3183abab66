//! Retry-budget limiter (spec.md §4.5): a leaky bucket per peer that caps
//! reconnect attempt rate and computes exponential backoff with jitter.

use rand::Rng;
use std::time::{Duration, Instant};

use crate::config::TransportConfig;

/// Leaky-bucket token accounting for one peer's reconnect attempts.
///
/// Tokens are restored lazily (on each `try_consume`/`peek` call) based on
/// elapsed wall-clock time rather than via a background task, which keeps
/// the budget cheap to hold per-peer and side-effect-free until consulted.
pub struct RetryBudget {
    capacity: u32,
    restore_interval: Duration,
    base_interval: Duration,
    max_jitter: Duration,
    max_backoff: Duration,
    tokens: f64,
    last_check: Instant,
    attempts: u32,
}

impl RetryBudget {
    pub fn new(config: &TransportConfig) -> Self {
        RetryBudget {
            capacity: config.attempt_budget_capacity,
            restore_interval: config.budget_restore_interval,
            base_interval: config.base_interval,
            max_jitter: config.max_jitter,
            max_backoff: config.max_backoff,
            tokens: config.attempt_budget_capacity as f64,
            last_check: Instant::now(),
            attempts: 0,
        }
    }

    fn replenish(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_check);
        if elapsed.is_zero() {
            return;
        }
        let restore_secs = self.restore_interval.as_secs_f64().max(f64::EPSILON);
        let restored = elapsed.as_secs_f64() / restore_secs;
        if restored > 0.0 {
            self.tokens = (self.tokens + restored).min(self.capacity as f64);
            self.last_check = now;
        }
    }

    /// True if a dial attempt may proceed right now; does not consume.
    pub fn has_budget(&mut self) -> bool {
        self.replenish();
        self.tokens >= 1.0
    }

    /// Consume one token for an attempt about to be made. Panics-free no-op
    /// if the budget is already exhausted (caller must check `has_budget`
    /// first per spec.md §4.5 step 2).
    pub fn consume(&mut self) {
        self.replenish();
        self.tokens = (self.tokens - 1.0).max(0.0);
        self.attempts += 1;
    }

    /// Reset the attempt counter after a successful handshake (spec.md §4.5
    /// step 4: "schedule token restoration" — restoration is continuous
    /// here, so success just resets the exponential-backoff exponent).
    pub fn on_success(&mut self) {
        self.attempts = 0;
    }

    /// `min(base * 2^attempts + rand[0, jitter], maxBackoff)`, using the
    /// attempt count *before* the current one (the first attempt has no
    /// backoff).
    pub fn backoff_delay(&self) -> Duration {
        let exp = self.attempts.min(31);
        let scaled = self.base_interval.as_millis() as u64 * (1u64 << exp);
        let jitter_ms = if self.max_jitter.is_zero() {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.max_jitter.as_millis() as u64)
        };
        let total = scaled.saturating_add(jitter_ms);
        Duration::from_millis(total).min(self.max_backoff)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TransportConfig {
        TransportConfig {
            attempt_budget_capacity: 3,
            budget_restore_interval: Duration::from_millis(50),
            base_interval: Duration::from_millis(100),
            max_jitter: Duration::from_millis(0),
            max_backoff: Duration::from_millis(10_000),
            ..TransportConfig::default()
        }
    }

    #[test]
    fn consumes_tokens_down_to_exhaustion() {
        let mut budget = RetryBudget::new(&config());
        for _ in 0..3 {
            assert!(budget.has_budget());
            budget.consume();
        }
        assert!(!budget.has_budget());
    }

    #[test]
    fn backoff_grows_exponentially_with_no_jitter() {
        let mut budget = RetryBudget::new(&config());
        assert_eq!(budget.backoff_delay(), Duration::from_millis(100));
        budget.consume();
        assert_eq!(budget.backoff_delay(), Duration::from_millis(200));
        budget.consume();
        assert_eq!(budget.backoff_delay(), Duration::from_millis(400));
    }

    #[test]
    fn backoff_is_capped_at_max() {
        let mut budget = RetryBudget::new(&TransportConfig {
            max_backoff: Duration::from_millis(300),
            ..config()
        });
        budget.consume();
        budget.consume();
        assert_eq!(budget.backoff_delay(), Duration::from_millis(300));
    }

    #[test]
    fn on_success_resets_backoff_exponent() {
        let mut budget = RetryBudget::new(&config());
        budget.consume();
        budget.consume();
        budget.on_success();
        assert_eq!(budget.backoff_delay(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn tokens_are_restored_over_time() {
        let mut budget = RetryBudget::new(&config());
        budget.consume();
        budget.consume();
        budget.consume();
        assert!(!budget.has_budget());
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(budget.has_budget(), "two restore intervals should have elapsed");
    }
}
