//! Error values produced at the provider-adapter boundary.
//!
//! Adapters translate SDK/HTTP failures into an [`ApiError`] once, at the
//! boundary. Everything downstream (retry, fallback, single-flight fan-out)
//! reads the structured fields and never inspects messages or nested causes.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Which adapter operation produced the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiPhase {
    Generate,
    Upload,
    Cache,
    Download,
}

impl ApiPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiPhase::Generate => "generate",
            ApiPhase::Upload => "upload",
            ApiPhase::Cache => "cache",
            ApiPhase::Download => "download",
        }
    }
}

impl fmt::Display for ApiPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse classification of an adapter failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorKind {
    /// The provider answered and reported a failure.
    Provider,
    /// The request never got a provider answer (connect reset, DNS, timeout).
    Transport,
    /// The adapter does not implement the requested capability.
    Unsupported,
}

/// Additional context from provider errors for debugging.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorContext {
    /// Provider-specific error code (e.g. "RESOURCE_EXHAUSTED").
    pub provider_code: Option<String>,
    /// Request ID reported by the provider.
    pub request_id: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.provider_code = Some(code.into());
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }
}

/// Status codes that mark a provider failure as transient.
pub const RETRYABLE_STATUS_CODES: &[u16] = &[408, 429, 500, 502, 503, 504];

/// Structured provider failure.
#[derive(Debug, Clone, Error, PartialEq, Serialize)]
#[error("{provider} {phase} error: {message}")]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub provider: String,
    pub phase: ApiPhase,
    pub message: String,
    /// Set by the adapter; the core never guesses retryability from text.
    pub retryable: bool,
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<Duration>,
    pub call_index: Option<usize>,
    pub context: Option<ErrorContext>,
}

impl ApiError {
    fn base(kind: ApiErrorKind, provider: &str, phase: ApiPhase, message: String) -> Self {
        Self {
            kind,
            provider: provider.to_string(),
            phase,
            message,
            retryable: false,
            status_code: None,
            retry_after: None,
            call_index: None,
            context: None,
        }
    }

    /// Provider-reported failure. Retryability is explicit.
    pub fn provider(
        provider: &str,
        phase: ApiPhase,
        message: impl Into<String>,
        retryable: bool,
    ) -> Self {
        let mut err = Self::base(ApiErrorKind::Provider, provider, phase, message.into());
        err.retryable = retryable;
        err
    }

    /// Provider-reported failure classified by HTTP status.
    pub fn from_status(
        provider: &str,
        phase: ApiPhase,
        status: u16,
        message: impl Into<String>,
    ) -> Self {
        Self::provider(provider, phase, message, RETRYABLE_STATUS_CODES.contains(&status))
            .with_status(status)
    }

    /// Failure below the provider (no answer received).
    pub fn transport(provider: &str, phase: ApiPhase, message: impl Into<String>) -> Self {
        Self::base(ApiErrorKind::Transport, provider, phase, message.into())
    }

    /// The adapter lacks the capability needed for `phase`.
    pub fn unsupported(provider: &str, phase: ApiPhase) -> Self {
        Self::base(
            ApiErrorKind::Unsupported,
            provider,
            phase,
            format!("{phase} is not supported by this adapter"),
        )
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    /// Provider-supplied backoff hint. A hint marks the error retryable.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self.retryable = true;
        self
    }

    pub fn with_call_index(mut self, index: usize) -> Self {
        self.call_index = Some(index);
        self
    }

    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Whether a generation call may be retried.
    ///
    /// Unwrapped transport failures are retried as a narrow fallback.
    pub fn is_retryable(&self) -> bool {
        self.retryable || self.kind == ApiErrorKind::Transport
    }

    /// Whether a side-effectful call (upload, cache creation) may be retried.
    ///
    /// Requires an explicit signal so an ambiguous failure never creates a
    /// duplicate remote artifact.
    pub fn is_retryable_side_effect(&self) -> bool {
        self.retryable
            && self.kind == ApiErrorKind::Provider
            && (self.retry_after.is_some()
                || self
                    .status_code
                    .is_some_and(|s| RETRYABLE_STATUS_CODES.contains(&s)))
    }

    /// Short error code for logging and usage records.
    pub fn code(&self) -> &'static str {
        match (self.kind, self.status_code) {
            (ApiErrorKind::Unsupported, _) => "unsupported",
            (ApiErrorKind::Transport, _) => "transport_error",
            (ApiErrorKind::Provider, Some(429)) => "rate_limited",
            (ApiErrorKind::Provider, Some(s)) if s >= 500 => "provider_unavailable",
            (ApiErrorKind::Provider, _) => "provider_error",
        }
    }

    /// Get the request ID if available.
    pub fn request_id(&self) -> Option<&str> {
        self.context.as_ref().and_then(|c| c.request_id.as_deref())
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => {
                ApiError::from_status("http", ApiPhase::Download, status.as_u16(), e.to_string())
            }
            None => ApiError::transport("http", ApiPhase::Download, e.to_string()),
        }
    }
}
