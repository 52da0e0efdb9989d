//! Bounded retry for transient failures.
//!
//! [`RetryPolicy::decide`] maps (failures so far, error class) to a decision;
//! [`retry`] drives an operation through that policy with an injected
//! [`Sleep`] so tests do not wait on the wall clock.

use std::{fmt::Display, future::Future, time::Duration};

use {async_trait::async_trait, tally_config::RetryConfig, tracing::warn};

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Linear backoff: retry `n` (1-based) waits `initial + (n - 1) * step`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            initial_delay: Duration::from_millis(cfg.initial_delay_ms),
            step: Duration::from_millis(cfg.step_ms),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::ZERO,
            step: Duration::ZERO,
        }
    }

    /// `failures` counts failed attempts so far, including the one just seen.
    #[must_use]
    pub fn decide(&self, failures: u32, class: ErrorClass) -> RetryDecision {
        if class == ErrorClass::Terminal || failures == 0 || failures > self.max_retries {
            return RetryDecision::GiveUp;
        }
        let delay = self.initial_delay + self.step.saturating_mul(failures - 1);
        RetryDecision::RetryAfter(delay)
    }
}

/// Clock seam for retry delays.
#[async_trait]
pub trait Sleep: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleep;

#[async_trait]
impl Sleep for TokioSleep {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Why [`retry`] stopped.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Transient failures used up the policy.
    Exhausted { attempts: u32, source: E },
    /// A failure the classifier marked terminal.
    Terminal(E),
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { source, .. } | Self::Terminal(source) => source,
        }
    }
}

/// Run `op` until it succeeds, fails terminally, or the policy gives up.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleep,
    classify: impl Fn(&E) -> ErrorClass,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut failures = 0u32;
    loop {
        let error = match op().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        failures += 1;
        let class = classify(&error);
        match policy.decide(failures, class) {
            RetryDecision::RetryAfter(delay) => {
                warn!(
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "transient failure, retrying"
                );
                sleeper.sleep(delay).await;
            },
            RetryDecision::GiveUp => {
                return Err(match class {
                    ErrorClass::Terminal => RetryError::Terminal(error),
                    ErrorClass::Transient => RetryError::Exhausted {
                        attempts: failures,
                        source: error,
                    },
                });
            },
        }
    }
}
