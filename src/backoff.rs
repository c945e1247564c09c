// ===============================
// src/backoff.rs
// ===============================
//
// Reconnect / retry policy shared by every feed channel and by the store
// persistence retry:
//   failure n (1-based) waits min(base * 2^(n-1), cap) + jitter
//   failure max_attempts+1 means the budget is exhausted
//
use rand::Rng;
use std::time::Duration;

use crate::config::ReconnectParams;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    max_attempts: u32,
    base: Duration,
    cap: Duration,
    jitter: Duration,
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, base: Duration, cap: Duration, jitter: Duration) -> Self {
        Self { max_attempts, base, cap: cap.max(base), jitter }
    }

    pub fn from_params(p: &ReconnectParams) -> Self {
        Self::new(p.max_attempts, p.base, p.cap, p.jitter)
    }

    /// Deterministic part of the delay after the `failure`-th consecutive failure.
    pub fn delay(&self, failure: u32) -> Duration {
        let shift = failure.saturating_sub(1).min(20);
        self.base.saturating_mul(1u32 << shift).min(self.cap)
    }

    pub fn jittered(&self, failure: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.delay(failure);
        }
        // no ThreadRng held across an await: drawn and dropped here
        let extra = rand::thread_rng().gen_range(0..=jitter_ms);
        self.delay(failure) + Duration::from_millis(extra)
    }

    pub fn exhausted(&self, failures: u32) -> bool { failures > self.max_attempts }
}

/// Consecutive-failure counter driven by a [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self { Self { policy, failures: 0 } }

    pub fn failures(&self) -> u32 { self.failures }

    /// Record a failure. `None` once the retry budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.policy.exhausted(self.failures) {
            None
        } else {
            Some(self.policy.jittered(self.failures))
        }
    }

    pub fn reset(&mut self) { self.failures = 0; }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(5, Duration::from_millis(500), Duration::from_secs(4), Duration::ZERO)
    }

    #[test]
    fn delay_doubles_then_caps() {
        let p = policy();
        let got: Vec<u64> = (1..=6).map(|n| p.delay(n).as_millis() as u64).collect();
        assert_eq!(got, vec![500, 1000, 2000, 4000, 4000, 4000]);
    }

    #[test]
    fn huge_failure_counts_do_not_overflow() {
        let p = policy();
        assert_eq!(p.delay(u32::MAX), Duration::from_secs(4));
    }

    #[test]
    fn budget_allows_exactly_max_attempts_retries() {
        let mut b = Backoff::new(policy());
        for _ in 0..5 {
            assert!(b.next_delay().is_some());
        }
        assert_eq!(b.next_delay(), None);
        assert_eq!(b.failures(), 6);
    }

    #[test]
    fn reset_restores_full_budget() {
        let mut b = Backoff::new(policy());
        for _ in 0..3 {
            b.next_delay();
        }
        b.reset();
        assert_eq!(b.next_delay(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let p = BackoffPolicy::new(5, Duration::from_millis(100), Duration::from_secs(1), Duration::from_millis(50));
        for _ in 0..100 {
            let d = p.jittered(1);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(150));
        }
    }
}
