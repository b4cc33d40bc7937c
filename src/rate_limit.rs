//! Dual request/token micro-limiter.
//!
//! One limiter per `(provider, model, tier)` key. Each holds the timestamp
//! of its last admitted event behind an async mutex, so acquisitions on one
//! key are strictly serialized and interleaved waits never double-count the
//! elapsed time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::gateway::TierLimits;

/// Rate limits attached to a plan when real invocation is enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateConstraint {
    pub requests_per_minute: u32,
    #[serde(default)]
    pub tokens_per_minute: Option<u64>,
    #[serde(default)]
    pub min_interval_ms: u64,
    /// Multiplier applied to `requests_per_minute` when greater than 1.
    #[serde(default = "default_burst_factor")]
    pub burst_factor: f64,
}

fn default_burst_factor() -> f64 {
    1.0
}

impl RateConstraint {
    pub fn new(requests_per_minute: u32) -> Self {
        Self {
            requests_per_minute,
            tokens_per_minute: None,
            min_interval_ms: 0,
            burst_factor: 1.0,
        }
    }

    pub fn with_tokens_per_minute(mut self, tpm: u64) -> Self {
        self.tokens_per_minute = Some(tpm);
        self
    }

    pub fn with_min_interval(mut self, ms: u64) -> Self {
        self.min_interval_ms = ms;
        self
    }

    pub fn with_burst_factor(mut self, factor: f64) -> Self {
        self.burst_factor = factor;
        self
    }

    /// Spacing the token budget requires for an estimate of `tokens`.
    pub fn token_spacing(&self, tokens: u64) -> Duration {
        match self.tokens_per_minute {
            Some(tpm) if tpm > 0 && tokens > 0 => {
                spacing_secs(60.0 * tokens as f64 / tpm as f64)
            }
            _ => Duration::ZERO,
        }
    }

    /// Minimum spacing between two requests.
    pub fn request_spacing(&self) -> Duration {
        let burst = if self.burst_factor > 1.0 {
            self.burst_factor
        } else {
            1.0
        };
        let effective_rpm = self.requests_per_minute as f64 * burst;
        if effective_rpm <= 0.0 {
            return Duration::ZERO;
        }
        spacing_secs(60.0 / effective_rpm)
    }
}

/// Saturates instead of panicking on absurd ratios.
fn spacing_secs(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

impl From<TierLimits> for RateConstraint {
    fn from(limits: TierLimits) -> Self {
        Self {
            requests_per_minute: limits.requests_per_minute,
            tokens_per_minute: limits.tokens_per_minute,
            min_interval_ms: 0,
            burst_factor: 1.0,
        }
    }
}

// =============================================================================
// LIMITER
// =============================================================================

/// Limiter for a single key.
#[derive(Debug, Default)]
pub struct MicroLimiter {
    last_event: tokio::sync::Mutex<Option<Instant>>,
}

impl MicroLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until a request with `estimated_tokens` may proceed.
    ///
    /// Returns the total time spent waiting.
    pub async fn acquire(
        &self,
        constraint: &RateConstraint,
        estimated_tokens: u64,
        cancel: &CancellationToken,
    ) -> Result<Duration, PipelineError> {
        let mut last_event = self.last_event.lock().await;
        let mut waited = Duration::ZERO;

        // Every shortfall is measured from the previous admitted event, so
        // later steps only sleep for what earlier steps did not cover.
        if let Some(last) = *last_event {
            // Token budget.
            let token_spacing = constraint.token_spacing(estimated_tokens);
            waited += pause(token_spacing.saturating_sub(last.elapsed()), cancel).await?;

            // Request rate.
            let request_spacing = constraint.request_spacing();
            waited += pause(request_spacing.saturating_sub(last.elapsed()), cancel).await?;

            // Minimum interval, when stricter than the request spacing.
            let min_interval = Duration::from_millis(constraint.min_interval_ms);
            if min_interval > request_spacing {
                waited += pause(min_interval.saturating_sub(last.elapsed()), cancel).await?;
            }
        }

        *last_event = Some(Instant::now());
        Ok(waited)
    }
}

async fn pause(wait: Duration, cancel: &CancellationToken) -> Result<Duration, PipelineError> {
    if wait.is_zero() {
        return Ok(Duration::ZERO);
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        _ = tokio::time::sleep(wait) => Ok(wait),
    }
}

/// Key identifying one limiter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimiterKey {
    pub provider: String,
    pub model: String,
    pub tier: String,
}

impl LimiterKey {
    pub fn new(provider: &str, model: &str, tier: &str) -> Self {
        Self {
            provider: provider.to_string(),
            model: model.to_string(),
            tier: tier.to_ascii_lowercase(),
        }
    }
}

/// Per-key limiters owned by one executor.
#[derive(Debug, Default)]
pub struct RateLimiters {
    limiters: Mutex<HashMap<LimiterKey, Arc<MicroLimiter>>>,
}

impl RateLimiters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn limiter(&self, key: &LimiterKey) -> Arc<MicroLimiter> {
        let mut limiters = self.limiters.lock().unwrap_or_else(|e| e.into_inner());
        limiters
            .entry(key.clone())
            .or_insert_with(|| Arc::new(MicroLimiter::new()))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.limiters.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// STAGE
// =============================================================================

/// Admission for every provider request of one plan.
///
/// The rate-limit stage admits the first request before invocation starts;
/// the invocation stage admits every later one (further calls, retries, the
/// fallback) through the same pacer. Plans without a constraint get no pacer.
#[derive(Debug)]
pub struct Pacer {
    key: LimiterKey,
    limiter: Arc<MicroLimiter>,
    constraint: RateConstraint,
    tokens_per_request: u64,
    prepaid: AtomicBool,
    waited_ms: AtomicU64,
}

impl Pacer {
    pub fn new(
        limiters: &RateLimiters,
        key: LimiterKey,
        constraint: RateConstraint,
        tokens_per_request: u64,
    ) -> Self {
        Self {
            limiter: limiters.limiter(&key),
            key,
            constraint,
            tokens_per_request,
            prepaid: AtomicBool::new(false),
            waited_ms: AtomicU64::new(0),
        }
    }

    /// Admit the first request ahead of invocation. The slot is consumed by
    /// the next [`Pacer::admit`].
    pub async fn admit_first(&self, cancel: &CancellationToken) -> Result<Duration, PipelineError> {
        let waited = self.acquire(cancel).await?;
        self.prepaid.store(true, Ordering::SeqCst);
        Ok(waited)
    }

    /// Wait until one provider request may go out.
    pub async fn admit(&self, cancel: &CancellationToken) -> Result<Duration, PipelineError> {
        if self.prepaid.swap(false, Ordering::SeqCst) {
            return Ok(Duration::ZERO);
        }
        self.acquire(cancel).await
    }

    /// Total time spent waiting so far.
    pub fn waited(&self) -> Duration {
        Duration::from_millis(self.waited_ms.load(Ordering::SeqCst))
    }

    async fn acquire(&self, cancel: &CancellationToken) -> Result<Duration, PipelineError> {
        let waited = self
            .limiter
            .acquire(&self.constraint, self.tokens_per_request, cancel)
            .await?;
        if !waited.is_zero() {
            let ms = waited.as_millis() as u64;
            self.waited_ms.fetch_add(ms, Ordering::SeqCst);
            tracing::debug!(
                provider = %self.key.provider,
                model = %self.key.model,
                waited_ms = ms,
                "rate limiter wait"
            );
        }
        Ok(waited)
    }
}
