//! Bounded retry with pluggable backoff
//!
//! Shared by catalog listing, downloads and the SQL load adapter. Every loop
//! here is bounded by `max_attempts`; nothing retries forever.

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Delay to wait after a failed attempt (1-based) before the next one
pub trait Backoff: Send + Sync {
    fn delay(&self, attempt: u32) -> Duration;
}

/// `base * 2^(attempt-1)`, capped, optionally with jitter in `[d/2, d]`
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
    pub jitter: bool,
}

impl Backoff for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let raw = self.base.saturating_mul(1u32 << exp);
        let capped = raw.min(self.max);
        if !self.jitter || capped.is_zero() {
            return capped;
        }
        let half = capped / 2;
        let spread = (capped - half).as_millis() as u64;
        half + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }
}

/// Fixed delay; handy in tests
#[derive(Debug, Clone)]
pub struct ConstantBackoff(pub Duration);

impl Backoff for ConstantBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        self.0
    }
}

#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    backoff: Arc<dyn Backoff>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// Exponential backoff with jitter
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self::with_backoff(
            max_attempts,
            ExponentialBackoff {
                base: base_delay,
                max: max_delay,
                jitter: true,
            },
        )
    }

    pub fn with_backoff(max_attempts: u32, backoff: impl Backoff + 'static) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Arc::new(backoff),
        }
    }

    /// Retry immediately; used by tests
    pub fn immediate(max_attempts: u32) -> Self {
        Self::with_backoff(max_attempts, ConstantBackoff(Duration::ZERO))
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }
}

/// Result of a bounded retry loop
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    Succeeded { value: T, attempts: u32 },
    Exhausted { error: E, attempts: u32 },
}

impl<T, E> RetryOutcome<T, E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Succeeded { attempts, .. } | RetryOutcome::Exhausted { attempts, .. } => {
                *attempts
            },
        }
    }

    pub fn into_result(self) -> Result<T, E> {
        match self {
            RetryOutcome::Succeeded { value, .. } => Ok(value),
            RetryOutcome::Exhausted { error, .. } => Err(error),
        }
    }
}

/// Run `op` until it succeeds or `policy.max_attempts` is reached.
///
/// `op` receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> RetryOutcome<T, E>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max = policy.max_attempts;
    let mut attempt = 1;
    loop {
        debug!(target: "cnpj_ingest::retry", %label, attempt, max, "Attempt starting");
        match op(attempt).await {
            Ok(value) => {
                return RetryOutcome::Succeeded {
                    value,
                    attempts: attempt,
                }
            },
            Err(error) if attempt >= max => {
                warn!(%label, attempt, max, error = %error, "Giving up");
                return RetryOutcome::Exhausted {
                    error,
                    attempts: attempt,
                };
            },
            Err(error) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    %label,
                    attempt,
                    max,
                    error = %error,
                    delay_ms = delay.as_millis() as u64,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            },
        }
    }
}
