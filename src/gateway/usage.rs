//! Usage tracking via the UsageSink trait.
//!
//! The invocation stage logs every provider call through a UsageSink. This
//! decouples the engine from any reporting backend:
//! - Library callers plug in their own sink (database, metrics exporter)
//! - `TracingUsageSink` emits one structured `tracing` event per call
//! - Tests use `NoopUsageSink` or a collecting sink

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::error::ApiPhase;
use super::types::Usage;

/// Status of a provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Success,
    Error,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Success => "success",
            CallStatus::Error => "error",
        }
    }
}

/// Record of a provider API call for logging.
#[derive(Debug, Clone)]
pub struct ProviderCallRecord {
    /// Pipeline run this call belongs to.
    pub run_id: Uuid,
    /// Provider name: "gemini", "openai", etc.
    pub provider: String,
    /// Adapter operation.
    pub phase: ApiPhase,
    /// Model used.
    pub model: String,
    /// Index of the call within its plan, if any.
    pub call_index: Option<usize>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// Latency in milliseconds.
    pub latency_ms: u64,
    /// 1-based attempt number.
    pub attempt: u32,
    pub status: CallStatus,
    /// Error code if status is Error.
    pub error_code: Option<String>,
    /// Provider request ID (for debugging).
    pub request_id: Option<String>,
    /// When the call finished.
    pub timestamp: DateTime<Utc>,
}

impl ProviderCallRecord {
    /// Create a new record with required fields, defaulting others.
    pub fn new(
        run_id: Uuid,
        provider: impl Into<String>,
        phase: ApiPhase,
        model: impl Into<String>,
    ) -> Self {
        Self {
            run_id,
            provider: provider.into(),
            phase,
            model: model.into(),
            call_index: None,
            prompt_tokens: 0,
            completion_tokens: 0,
            latency_ms: 0,
            attempt: 1,
            status: CallStatus::Success,
            error_code: None,
            request_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn call(mut self, index: usize) -> Self {
        self.call_index = Some(index);
        self
    }

    pub fn usage(mut self, usage: &Usage) -> Self {
        self.prompt_tokens = usage.prompt_tokens;
        self.completion_tokens = usage.completion_tokens;
        self
    }

    pub fn latency(mut self, ms: u64) -> Self {
        self.latency_ms = ms;
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn error(mut self, code: impl Into<String>) -> Self {
        self.status = CallStatus::Error;
        self.error_code = Some(code.into());
        self
    }

    pub fn request_id(mut self, id: Option<String>) -> Self {
        self.request_id = id;
        self
    }
}

/// Trait for recording provider call usage.
///
/// Implement this trait to customize where usage data is stored.
#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Record a provider call. This should be fire-and-forget:
    /// failures should be logged but not propagated.
    async fn record(&self, record: ProviderCallRecord);
}

/// No-op usage sink that discards all records.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: ProviderCallRecord) {}
}

/// Usage sink that emits one `tracing` event per call.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingUsageSink;

#[async_trait]
impl UsageSink for TracingUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        tracing::info!(
            run_id = %record.run_id,
            provider = %record.provider,
            phase = record.phase.as_str(),
            model = %record.model,
            call_index = ?record.call_index,
            tokens = record.prompt_tokens + record.completion_tokens,
            latency_ms = record.latency_ms,
            attempt = record.attempt,
            status = record.status.as_str(),
            error_code = ?record.error_code,
            "provider call"
        );
    }
}
