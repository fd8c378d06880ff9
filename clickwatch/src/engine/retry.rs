// clickwatch/src/engine/retry.rs
//
// Fixed-delay retry. No backoff growth, optional attempt cap.
//
// The worker's store connection retries forever; the one-shot CLI modes use a
// bounded policy. Detector passes never go through here: a failed pass waits
// for the next cycle.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay:        Duration,
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn forever(delay: Duration) -> Self {
        Self { delay, max_attempts: None }
    }

    pub fn bounded(delay: Duration, max_attempts: u32) -> Self {
        Self { delay, max_attempts: Some(max_attempts.max(1)) }
    }
}

/// Call `op(attempt)` (attempts count from 1) until it succeeds, sleeping
/// `policy.delay` between failures. Returns the last error once the cap is hit.
pub async fn retry<T, E, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, E>
where
    F:   FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E:   Display,
{
    let mut attempt = 1u32;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if policy.max_attempts.is_some_and(|max| attempt >= max) {
                    return Err(e);
                }
                warn!(
                    attempt,
                    error = %e,
                    retry_in_secs = policy.delay.as_secs_f64(),
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(policy.delay).await;
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn forever_keeps_going_until_success() {
        let started = Instant::now();
        let result: Result<u32, String> = retry(RetryPolicy::forever(Duration::from_secs(10)), |attempt| async move {
            if attempt < 5 { Err(format!("down #{attempt}")) } else { Ok(attempt) }
        })
        .await;
        assert_eq!(result, Ok(5));
        assert!(started.elapsed() >= Duration::from_secs(40));
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_returns_last_error() {
        let mut calls = 0;
        let result: Result<(), String> = retry(RetryPolicy::bounded(Duration::from_secs(1), 3), |attempt| {
            calls += 1;
            async move { Err(format!("down #{attempt}")) }
        })
        .await;
        assert_eq!(result, Err("down #3".to_string()));
        assert_eq!(calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn first_success_does_not_sleep() {
        let started = Instant::now();
        let result: Result<&str, String> = retry(RetryPolicy::forever(Duration::from_secs(10)), |_| async { Ok("up") }).await;
        assert_eq!(result, Ok("up"));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
