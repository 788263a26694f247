//! Retry executor
//!
//! One generic, policy-parameterized wrapper for every external call:
//! - transient failures are retried with exponential backoff and jitter
//! - permanent failures abort immediately
//! - each attempt may carry its own timeout, classified transient
//! - non-idempotent operations are never repeated

use crate::error::{CallError, RetryError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Backoff policy for one external call type
///
/// Durations are expressed in milliseconds in configuration files; `0` turns
/// an optional bound off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total tries, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(rename = "base_delay_ms", with = "millis")]
    pub base_delay: Duration,
    /// Growth factor per attempt
    pub multiplier: f64,
    /// Upper bound of the random delay added to each wait
    #[serde(rename = "jitter_ms", with = "opt_millis")]
    pub jitter: Option<Duration>,
    /// Cap on the computed backoff
    #[serde(rename = "max_delay_ms", with = "opt_millis")]
    pub max_delay: Option<Duration>,
    /// Timeout applied to each attempt
    #[serde(rename = "attempt_timeout_ms", with = "opt_millis")]
    pub attempt_timeout: Option<Duration>,
}

impl RetryPolicy {
    /// Create policy without jitter, cap or timeout
    #[inline]
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            multiplier,
            jitter: None,
            max_delay: None,
            attempt_timeout: None,
        }
    }

    /// Single attempt, no waiting
    #[inline]
    #[must_use]
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, 1.0)
    }

    /// With jitter bound
    #[inline]
    #[must_use]
    pub fn with_jitter(mut self, jitter: Option<Duration>) -> Self {
        self.jitter = jitter;
        self
    }

    /// With backoff cap
    #[inline]
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Option<Duration>) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// With per-attempt timeout
    #[inline]
    #[must_use]
    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Deterministic wait after failed attempt `attempt` (1-based)
    ///
    /// `base_delay * multiplier^(attempt-1)`, capped by `max_delay`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    fn wait_for(&self, attempt: u32) -> Duration {
        let base = self.delay_for(attempt);
        match self.jitter {
            Some(bound) if !bound.is_zero() => {
                let max_ms = u64::try_from(bound.as_millis()).unwrap_or(u64::MAX);
                let extra = rand::rng().random_range(0..=max_ms);
                base.saturating_add(Duration::from_millis(extra))
            }
            _ => base,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), 2.0)
            .with_jitter(Some(Duration::from_millis(250)))
            .with_max_delay(Some(Duration::from_secs(30)))
            .with_attempt_timeout(Some(Duration::from_secs(120)))
    }
}

/// Whether repeating an operation is safe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Idempotency {
    /// Repeating has no additional effect
    Idempotent,
    /// May leave partial effects; run at most once
    NonIdempotent,
}

/// Successful result plus the attempt it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    /// Operation result
    pub value: T,
    /// 1-based attempt that succeeded
    pub attempts: u32,
}

/// Run `op` under `policy`
///
/// `op` receives the 1-based attempt number. `label` names the call in log
/// events.
///
/// # Errors
/// [`RetryError`] carrying the last error and the number of attempts made.
pub async fn retry<T, F, Fut>(
    label: &str,
    policy: &RetryPolicy,
    idempotency: Idempotency,
    mut op: F,
) -> Result<Retried<T>, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, CallError>>,
{
    let max_attempts = match idempotency {
        Idempotency::Idempotent => policy.max_attempts.max(1),
        Idempotency::NonIdempotent => 1,
    };

    let mut attempt = 1;
    loop {
        let outcome = match policy.attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, op(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(CallError::transient(format!(
                    "{label} timed out after {}ms",
                    limit.as_millis()
                ))),
            },
            None => op(attempt).await,
        };

        match outcome {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(call = label, attempt, "succeeded after retry");
                }
                return Ok(Retried {
                    value,
                    attempts: attempt,
                });
            }
            Err(error) if error.is_retryable() && attempt < max_attempts => {
                let wait = policy.wait_for(attempt);
                tracing::warn!(
                    call = label,
                    attempt,
                    max_attempts,
                    delay_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                    %error,
                    "transient failure, retrying"
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(error) => {
                tracing::warn!(call = label, attempt, %error, "giving up");
                return Err(RetryError {
                    error,
                    attempts: attempt,
                });
            }
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[allow(clippy::ref_option)]
    pub(super) fn serialize<S: Serializer>(
        value: &Option<Duration>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        let ms = value.map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        s.serialize_u64(ms)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<Duration>, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok((ms > 0).then(|| Duration::from_millis(ms)))
    }
}
