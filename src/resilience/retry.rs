//! Retry with configurable backoff.
//!
//! Wraps gateway operations and retries transient failures only. Permanent
//! failures, insufficient balance and open-circuit rejections surface
//! immediately so the caller can decide what they mean.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{GatewayError, GatewayResult};

/// Backoff strategy mapping attempt number to wait time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// base_delay on every attempt
    Fixed,
    /// base_delay * attempt
    Linear,
    /// base_delay * 2^(attempt - 1), capped at max_delay
    Exponential,
    /// base_delay * fib(attempt), capped at max_delay
    Fibonacci,
    /// base_delay plus a uniform random offset in (0, base_delay)
    Jittered,
}

/// Retry policy applied around gateway calls and task requeues
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub strategy: BackoffStrategy,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Total attempts including the first call
    pub max_attempts: u32,
    /// Add a uniform random offset in (0, base_delay) to any strategy,
    /// desynchronizing retries across accounts
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 3,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(base_delay_ms: u64, max_attempts: u32) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            base_delay_ms,
            max_delay_ms: base_delay_ms,
            max_attempts,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Deterministic part of the delay before `attempt`'s retry (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1) as u64;
        let base = self.base_delay_ms;
        let raw = match self.strategy {
            BackoffStrategy::Fixed | BackoffStrategy::Jittered => base,
            BackoffStrategy::Linear => base.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let factor = 1u64.checked_shl((attempt - 1) as u32).unwrap_or(u64::MAX);
                base.saturating_mul(factor)
            }
            BackoffStrategy::Fibonacci => base.saturating_mul(fib(attempt)),
        };
        Duration::from_millis(raw.min(self.max_delay_ms))
    }

    /// Full delay including any random jitter.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let mut delay = self.delay_for(attempt);
        let jittered = self.jitter || self.strategy == BackoffStrategy::Jittered;
        if jittered && self.base_delay_ms > 0 {
            let offset = rand::thread_rng().gen_range(0..self.base_delay_ms);
            delay += Duration::from_millis(offset);
        }
        delay
    }
}

fn fib(n: u64) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 2..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    if n <= 2 {
        1
    } else {
        b
    }
}

/// Drives an operation through its retry policy
#[derive(Debug, Clone)]
pub struct RetryManager {
    policy: RetryPolicy,
}

impl RetryManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op`, retrying transient failures with backoff until
    /// `max_attempts` is exhausted. The last failure surfaces unchanged.
    pub async fn execute<T, F, Fut>(&self, label: &str, mut op: F) -> GatewayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(%label, attempt, "operation recovered after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_retryable() && attempt < self.policy.max_attempts => {
                    let mut delay = self.policy.next_delay(attempt);
                    // A rate-limit response may demand a longer wait than
                    // the policy computed.
                    if let GatewayError::RateLimited { retry_after_secs } = &err {
                        delay = delay.max(Duration::from_secs(*retry_after_secs));
                    }
                    warn!(
                        %label,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(strategy: BackoffStrategy, base_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy {
            strategy,
            base_delay_ms: base_ms,
            max_delay_ms: max_ms,
            max_attempts: 10,
            jitter: false,
        }
    }

    #[test]
    fn exponential_delays_double_then_cap() {
        let p = policy(BackoffStrategy::Exponential, 1_000, 30_000);
        let delays: Vec<u64> = (1..=8).map(|a| p.delay_for(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn linear_delays_grow_by_base() {
        let p = policy(BackoffStrategy::Linear, 500, 10_000);
        assert_eq!(p.delay_for(1), Duration::from_millis(500));
        assert_eq!(p.delay_for(2), Duration::from_millis(1_000));
        assert_eq!(p.delay_for(4), Duration::from_millis(2_000));
    }

    #[test]
    fn fibonacci_delays_follow_the_sequence() {
        let p = policy(BackoffStrategy::Fibonacci, 1_000, 60_000);
        let delays: Vec<u64> = (1..=6).map(|a| p.delay_for(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 1, 2, 3, 5, 8]);
    }

    #[test]
    fn fixed_delay_never_changes() {
        let p = policy(BackoffStrategy::Fixed, 250, 30_000);
        assert_eq!(p.delay_for(1), p.delay_for(9));
    }

    #[test]
    fn jitter_adds_at_most_base_delay() {
        let p = policy(BackoffStrategy::Fixed, 1_000, 30_000).with_jitter();
        for attempt in 1..=20 {
            let delay = p.next_delay(attempt);
            assert!(delay >= Duration::from_millis(1_000));
            assert!(delay < Duration::from_millis(2_000));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_success() {
        let manager = RetryManager::new(RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 10,
            ..Default::default()
        });
        let calls = AtomicU32::new(0);

        let result = manager
            .execute("test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(GatewayError::Timeout { elapsed_ms: 100 })
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.expect("third attempt should succeed"), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_attempts_surface_the_last_error() {
        let manager = RetryManager::new(RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 10,
            ..Default::default()
        });
        let calls = AtomicU32::new(0);

        let result: GatewayResult<()> = manager
            .execute("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(GatewayError::Timeout { elapsed_ms: 42 }) }
            })
            .await;

        assert!(matches!(
            result,
            Err(GatewayError::Timeout { elapsed_ms: 42 })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let manager = RetryManager::new(RetryPolicy::default());
        let calls = AtomicU32::new(0);

        let result: GatewayResult<()> = manager
            .execute("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(GatewayError::PermissionDenied("key revoked".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(GatewayError::PermissionDenied(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn circuit_open_surfaces_immediately() {
        let manager = RetryManager::new(RetryPolicy::default());
        let calls = AtomicU32::new(0);

        let result: GatewayResult<()> = manager
            .execute("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(GatewayError::ServiceUnavailable {
                        service: "gateway:acct-1".into(),
                    })
                }
            })
            .await;

        assert!(matches!(
            result,
            Err(GatewayError::ServiceUnavailable { .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
