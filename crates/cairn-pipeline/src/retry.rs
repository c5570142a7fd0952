//! Retry logic with configurable backoff policies for step execution.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use cairn_types::{Outcome, Result};

/// Backoff policy controlling the delay between retry attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Fixed delay between retries.
    Fixed {
        #[serde(with = "cairn_types::duration_serde")]
        delay: Duration,
    },
    /// Exponential backoff: base * 2^attempt, capped at max.
    Exponential {
        #[serde(with = "cairn_types::duration_serde")]
        base: Duration,
        #[serde(with = "cairn_types::duration_serde")]
        max: Duration,
    },
    /// No delay between retries.
    None,
}

impl BackoffPolicy {
    /// Compute the delay for a given retry number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            BackoffPolicy::Fixed { delay } => *delay,
            BackoffPolicy::Exponential { base, max } => {
                let millis = (base.as_millis() as u64).saturating_mul(2u64.saturating_pow(attempt));
                Duration::from_millis(millis).min(*max)
            }
            BackoffPolicy::None => Duration::ZERO,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

/// Per-step retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

fn default_max_attempts() -> u32 {
    1
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: BackoffPolicy) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(default_max_attempts(), BackoffPolicy::default())
    }
}

/// The terminal outcome of a step together with how many attempts it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted {
    pub outcome: Outcome,
    pub attempts: u32,
}

/// Execute a step attempt with retry logic.
///
/// `f` receives the 1-based attempt number and is called up to
/// `policy.max_attempts` times. Only `Outcome::Failed { retryable: true, .. }`
/// is retried; an `Err` is fatal and returned immediately. When the attempts
/// run out, the last failed outcome becomes the terminal one.
///
/// `on_retry` is invoked with the failed attempt number and the upcoming delay
/// before each sleep.
pub async fn execute_with_retry<F, Fut, R>(
    mut f: F,
    policy: Option<&RetryPolicy>,
    step: &str,
    mut on_retry: R,
) -> Result<Attempted>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Outcome>>,
    R: FnMut(u32, Duration, &Outcome),
{
    let max_attempts = policy.map(|p| p.max_attempts.max(1)).unwrap_or(1);
    let mut attempt = 1;
    loop {
        let outcome = f(attempt).await?;
        if outcome.is_retryable_failure() && attempt < max_attempts {
            let delay = policy
                .map(|p| p.backoff.delay_for_attempt(attempt - 1))
                .unwrap_or(Duration::ZERO);
            tracing::warn!(
                step = %step,
                attempt,
                max_attempts,
                delay_ms = %delay.as_millis(),
                "Retryable failure, retrying"
            );
            on_retry(attempt, delay, &outcome);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            attempt += 1;
            continue;
        }
        if outcome.is_retryable_failure() && max_attempts > 1 {
            tracing::warn!(step = %step, attempts = attempt, "Retries exhausted");
        }
        return Ok(Attempted {
            outcome,
            attempts: attempt,
        });
    }
}
