// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use aria_config::RetryConfig;

/// Exponential-backoff retry with jitter.
///
/// The policy is outcome-agnostic: callers supply a `retryable` predicate
/// over their own error type.  Permission, validation, and quota failures
/// must never be passed as retryable — the predicate is where that rule
/// is enforced.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    /// Fractional jitter: each delay is scaled by a uniform factor in
    /// `[1 - jitter, 1 + jitter]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            multiplier: cfg.multiplier,
            jitter: cfg.jitter.clamp(0.0, 1.0),
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `n + 1` (0-based `n`), jitter applied.
    pub fn delay_for(&self, completed_attempts: u32) -> Duration {
        let exp = self.multiplier.powi(completed_attempts.saturating_sub(1) as i32);
        let base = self.base_delay.as_secs_f64() * exp;
        let factor = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter)
        } else {
            1.0
        };
        Duration::from_secs_f64((base * factor).max(0.0))
    }

    /// Run `op` up to `max_attempts` times.  A failed attempt is retried only
    /// when `retryable(&err)` accepts it; the final error is returned as-is.
    pub async fn run<T, E, F, Fut, P>(&self, mut op: F, retryable: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt < self.max_attempts && retryable(&e) => {
                    let delay = self.delay_for(attempt);
                    debug!(attempt, %e, ?delay, "retrying after transient failure");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[tokio::test]
    async fn succeeds_first_try_without_retrying() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let res: Result<u32, String> = fast_policy(3)
            .run(
                move || {
                    let c = Arc::clone(&c);
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Ok(42)
                    }
                },
                |_| true,
            )
            .await;
        assert_eq!(res.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let res: Result<&str, String> = fast_policy(3)
            .run(
                move || {
                    let c = Arc::clone(&c);
                    async move {
                        if c.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err("transient".to_string())
                        } else {
                            Ok("ok")
                        }
                    }
                },
                |_| true,
            )
            .await;
        assert_eq!(res.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let res: Result<(), String> = fast_policy(3)
            .run(
                move || {
                    let c = Arc::clone(&c);
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Err("always".to_string())
                    }
                },
                |_| true,
            )
            .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_fails_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let res: Result<(), String> = fast_policy(3)
            .run(
                move || {
                    let c = Arc::clone(&c);
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Err("permission denied".to_string())
                    }
                },
                |e: &String| !e.contains("permission"),
            )
            .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delay_grows_exponentially_without_jitter() {
        let p = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: 0.0,
        };
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let p = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            multiplier: 1.0,
            jitter: 0.2,
        };
        for _ in 0..100 {
            let d = p.delay_for(1).as_millis() as f64;
            assert!((800.0..=1200.0).contains(&d), "delay {d} out of ±20% band");
        }
    }
}
