//! Retry policy (C1) — exponential backoff with jitter around idempotent
//! operations, plus error classification.
//!
//! Modeled on the teacher's `cook::retry_v2::RetryExecutor`, generalized so
//! the classifier works off [`crate::error::ErrorKind`] instead of
//! string-matching stderr, and with the three named profiles the spec calls
//! for (`default`, `rate_limit`, `read_operation`).

use crate::error::{ErrorKind, OrchestraError};
use rand::Rng;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Configuration for [`with_retry`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl RetryConfig {
    /// The general-purpose profile: moderate backoff, a handful of retries.
    pub fn default_profile() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// HTTP 429 follows a distinct profile per §4.1: more retries, a much
    /// longer initial delay. Applied automatically by `with_retry`/
    /// `with_retry_hook` whenever an error's kind is
    /// `ErrorKind::NetworkRateLimited`, overriding whatever profile the call
    /// site chose for the operation itself.
    pub fn rate_limit_profile() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(5000),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Pure reads can afford to retry more aggressively with a shorter
    /// initial delay, since they can't leave the server in a bad state.
    pub fn read_operation_profile() -> Self {
        Self {
            max_retries: 4,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(20),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::default_profile()
    }
}

/// One recorded retry attempt, returned by [`with_retry_detailed`].
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub delay: Duration,
    pub error: String,
    pub total_time: Duration,
}

/// Result of [`with_retry_detailed`]: the successful value plus the full
/// attempt history.
#[derive(Debug, Clone)]
pub struct DetailedRetryResult<T> {
    pub result: T,
    pub attempts: Vec<RetryAttempt>,
    pub total_time: Duration,
}

/// Classify an error as retryable or not, per the rules in §4.1. Agent
/// timeouts are retryable by policy default; callers that want otherwise
/// should check `ErrorKind::AgentTimeout` themselves before calling
/// `with_retry`.
pub fn is_retryable(kind: ErrorKind) -> bool {
    match kind {
        ErrorKind::NetworkConnection
        | ErrorKind::NetworkTimeout
        | ErrorKind::NetworkServer
        | ErrorKind::NetworkRateLimited => true,
        ErrorKind::AgentTimeout => true,
        ErrorKind::AuthMissing | ErrorKind::AuthInvalid | ErrorKind::AuthExpired => false,
        ErrorKind::PlanningValidation | ErrorKind::PlanningNotFound | ErrorKind::PlanningConflict => {
            false
        }
        ErrorKind::AgentSpawn => false,
        ErrorKind::AgentInactive | ErrorKind::AgentExecution => false,
        ErrorKind::CheckpointCorrupted
        | ErrorKind::CheckpointVersionMismatch
        | ErrorKind::CheckpointExpired
        | ErrorKind::CheckpointIo => false,
        ErrorKind::Cycle | ErrorKind::Cancelled | ErrorKind::Config => false,
    }
}

fn compute_delay(cfg: &RetryConfig, attempt: u32) -> Duration {
    let raw = cfg.initial_delay.as_secs_f64() * cfg.backoff_multiplier.powi(attempt as i32 - 1);
    let capped = raw.min(cfg.max_delay.as_secs_f64());
    let delay = Duration::from_secs_f64(capped.max(0.0));

    if !cfg.jitter {
        return delay;
    }

    let mut rng = rand::rng();
    let low = delay.as_secs_f64() * 0.75;
    let high = delay.as_secs_f64() * 1.25;
    Duration::from_secs_f64(rng.random_range(low..=high))
}

/// Execute `op` (which must be idempotent) with retry per `cfg`. `on_retry`
/// is invoked with `(attempt, delay, &error)` before each sleep.
pub async fn with_retry<T, F, Fut>(
    cfg: &RetryConfig,
    description: &str,
    op: F,
) -> Result<T, OrchestraError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, OrchestraError>>,
{
    with_retry_hook(cfg, description, op, |_, _, _| {}).await
}

/// Like [`with_retry`] but invokes `on_retry(attempt, delay, error)` before
/// each sleep, and returns the full attempt history.
pub async fn with_retry_detailed<T, F, Fut>(
    cfg: &RetryConfig,
    description: &str,
    op: F,
) -> Result<DetailedRetryResult<T>, OrchestraError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, OrchestraError>>,
{
    let start = Instant::now();
    let mut attempts = Vec::new();
    let result = with_retry_hook(cfg, description, op, |attempt, delay, error| {
        attempts.push(RetryAttempt {
            attempt,
            delay,
            error: error.to_string(),
            total_time: start.elapsed(),
        });
    })
    .await?;
    Ok(DetailedRetryResult {
        result,
        attempts,
        total_time: start.elapsed(),
    })
}

async fn with_retry_hook<T, F, Fut>(
    cfg: &RetryConfig,
    description: &str,
    mut op: F,
    mut on_retry: impl FnMut(u32, Duration, &OrchestraError),
) -> Result<T, OrchestraError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, OrchestraError>>,
{
    let mut attempt: u32 = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !is_retryable(err.kind) {
                    warn!(
                        "{description} failed permanently after {attempt} attempt(s): {err}"
                    );
                    return Err(err);
                }

                // A 429 always follows its own profile (§4.1), regardless of
                // which profile the call site picked for this operation.
                let active = if err.kind == ErrorKind::NetworkRateLimited {
                    RetryConfig::rate_limit_profile()
                } else {
                    cfg.clone()
                };

                if attempt > active.max_retries {
                    warn!(
                        "{description} failed permanently after {attempt} attempt(s): {err}"
                    );
                    return Err(err);
                }

                let delay = compute_delay(&active, attempt);
                debug!(
                    "{description} attempt {attempt}/{} failed ({err}); retrying in {delay:?}",
                    active.max_retries
                );
                on_retry(attempt, delay, &err);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_cfg(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn succeeds_first_try() {
        let result: Result<u32, OrchestraError> =
            with_retry(&fast_cfg(3), "test", || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result = with_retry(&fast_cfg(5), "test", move || {
            let calls = calls2.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(OrchestraError::new(ErrorKind::NetworkTimeout, "timeout"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_propagates_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<u32, OrchestraError> = with_retry(&fast_cfg(5), "test", move || {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(OrchestraError::new(ErrorKind::AuthInvalid, "bad token"))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_retries_and_propagates() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<u32, OrchestraError> = with_retry(&fast_cfg(2), "test", move || {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(OrchestraError::new(ErrorKind::NetworkServer, "500"))
            }
        })
        .await;
        assert!(result.is_err());
        // attempt 1 (fails) + retries 2 and 3 = 3 invocations total (maxRetries+1)
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn detailed_variant_records_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let detailed = with_retry_detailed(&fast_cfg(5), "test", move || {
            let calls = calls2.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(OrchestraError::new(ErrorKind::NetworkConnection, "refused"))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(detailed.result, 2);
        assert_eq!(detailed.attempts.len(), 2);
        assert_eq!(detailed.attempts[0].attempt, 1);
        assert_eq!(detailed.attempts[1].attempt, 2);
    }

    #[test]
    fn classification_matches_spec_table() {
        assert!(is_retryable(ErrorKind::NetworkConnection));
        assert!(is_retryable(ErrorKind::NetworkTimeout));
        assert!(is_retryable(ErrorKind::NetworkServer));
        assert!(is_retryable(ErrorKind::NetworkRateLimited));
        assert!(is_retryable(ErrorKind::AgentTimeout));
        assert!(!is_retryable(ErrorKind::AuthMissing));
        assert!(!is_retryable(ErrorKind::AuthInvalid));
        assert!(!is_retryable(ErrorKind::AuthExpired));
        assert!(!is_retryable(ErrorKind::PlanningValidation));
        assert!(!is_retryable(ErrorKind::PlanningNotFound));
        assert!(!is_retryable(ErrorKind::PlanningConflict));
        assert!(!is_retryable(ErrorKind::AgentSpawn));
        assert!(!is_retryable(ErrorKind::Cycle));
        assert!(!is_retryable(ErrorKind::Cancelled));
        assert!(!is_retryable(ErrorKind::Config));
    }

    #[tokio::test]
    async fn rate_limited_error_uses_rate_limit_profile_even_with_a_tighter_caller_cfg() {
        // A caller-supplied config with max_retries: 1 would normally give up
        // after one retry; a NetworkRateLimited error must still get the
        // dedicated profile's larger budget (5 retries) instead.
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let tight_cfg = RetryConfig {
            max_retries: 1,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: false,
        };
        let result: Result<u32, OrchestraError> = with_retry(&tight_cfg, "test", move || {
            let calls = calls2.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 3 {
                    Err(OrchestraError::new(ErrorKind::NetworkRateLimited, "429"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn delay_respects_max_delay_cap() {
        let cfg = RetryConfig {
            max_retries: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
            backoff_multiplier: 2.0,
            jitter: false,
        };
        // attempt 5 would be 16s uncapped; must cap at 4s.
        assert_eq!(compute_delay(&cfg, 5), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn jittered_delay_stays_in_bounds() {
        let cfg = RetryConfig {
            max_retries: 1,
            initial_delay: Duration::from_secs(4),
            max_delay: Duration::from_secs(100),
            backoff_multiplier: 1.0,
            jitter: true,
        };
        for _ in 0..20 {
            let d = compute_delay(&cfg, 1);
            assert!(d.as_secs_f64() >= 3.0 && d.as_secs_f64() <= 5.0);
        }
    }
}
