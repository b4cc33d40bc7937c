//! Bounded retry with exponential backoff.
//!
//! Retryability is read from the structured [`ApiError`] fields the adapter
//! set at the boundary. Cancellation is never retried.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::gateway::ApiError;

/// Retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    /// Add up to 10% random jitter to each backoff.
    pub jitter: bool,
    /// Overall ceiling on time spent in one retried operation.
    pub max_elapsed_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            backoff_multiplier: 2.0,
            max_delay_ms: 16_000,
            jitter: true,
            max_elapsed_ms: Some(120_000),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff before attempt `attempt + 1`, without jitter.
    ///
    /// `attempt` is 1-based: the delay after the first failure is
    /// `initial_delay_ms`, then it grows geometrically until `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let multiplier = self.backoff_multiplier.max(1.0);
        let ms = (self.initial_delay_ms as f64) * multiplier.powi(exp);
        let capped = ms.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    fn jittered(&self, base: Duration) -> Duration {
        if !self.jitter || base.is_zero() {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0.0..0.1);
        let delay = base.mul_f64(1.0 + extra);
        delay.min(Duration::from_millis(self.max_delay_ms).max(base))
    }

    fn max_elapsed(&self) -> Option<Duration> {
        self.max_elapsed_ms.map(Duration::from_millis)
    }
}

/// Which retry rule applies to an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryScope {
    /// Generation: retry on the adapter's flag or on a transport failure.
    Generate,
    /// Upload / cache creation: retry only on an explicit signal.
    SideEffect,
}

impl RetryScope {
    pub fn allows(&self, err: &ApiError) -> bool {
        match self {
            RetryScope::Generate => err.is_retryable(),
            RetryScope::SideEffect => err.is_retryable_side_effect(),
        }
    }
}

/// A successful retried operation.
#[derive(Debug, Clone)]
pub struct Retried<T> {
    pub value: T,
    /// Attempts used, including the successful one.
    pub attempts: u32,
}

/// Run `op` under `policy`.
///
/// `op` receives the 1-based attempt number. Only [`PipelineError::Api`]
/// errors accepted by `scope` are retried. A provider `retry_after` hint
/// lengthens the wait when it exceeds the computed backoff. When the next
/// wait would cross the elapsed ceiling the last error is returned.
pub async fn retry_with_policy<T, F, Fut>(
    policy: &RetryPolicy,
    scope: RetryScope,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<Retried<T>, PipelineError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, PipelineError>>,
{
    let started = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        attempt += 1;

        let err = match op(attempt).await {
            Ok(value) => {
                return Ok(Retried {
                    value,
                    attempts: attempt,
                })
            }
            Err(e) => e,
        };

        let api = match &err {
            PipelineError::Api(api) if scope.allows(api) => api,
            _ => return Err(err),
        };
        if attempt >= max_attempts {
            return Err(err);
        }

        let mut delay = policy.jittered(policy.delay_for_attempt(attempt));
        if let Some(hint) = api.retry_after {
            delay = delay.max(hint);
        }
        if let Some(ceiling) = policy.max_elapsed() {
            if started.elapsed() + delay > ceiling {
                tracing::warn!(
                    attempt,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "retry budget exhausted"
                );
                return Err(err);
            }
        }

        tracing::warn!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            code = api.code(),
            error = %api,
            "retrying provider call"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
