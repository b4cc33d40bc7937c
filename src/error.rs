//! Pipeline error taxonomy.

use std::fmt;

use thiserror::Error;

use crate::gateway::ApiError;

const REPORT_HINT: &str = "this is a bug in batchline, please report it";

/// Errors a pipeline stage can produce.
///
/// `Clone` so a single-flight producer's failure reaches every waiter.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    /// Invalid or missing setup. Fails fast, never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A bad input reference (unreadable file, malformed identifier).
    #[error("source error: {0}")]
    Source(String),

    /// No valid execution plan could be built.
    #[error("planning error: {0}")]
    Planning(String),

    /// Provider-reported failure carrying retry metadata.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// Invariant violation. Always surfaced, never swallowed.
    #[error("internal error: {0} ({REPORT_HINT})")]
    Internal(String),

    /// The run (or the single-flight producer being awaited) was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn source(message: impl Into<String>) -> Self {
        Self::Source(message.into())
    }

    pub fn planning(message: impl Into<String>) -> Self {
        Self::Planning(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn as_api(&self) -> Option<&ApiError> {
        match self {
            Self::Api(e) => Some(e),
            _ => None,
        }
    }

    /// Short error code for diagnostics.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::Source(_) => "source_error",
            Self::Planning(_) => "planning_error",
            Self::Api(e) => e.code(),
            Self::Internal(_) => "internal_error",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Pipeline stage names, used to attribute failures and durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageName {
    /// Configuration checks before any stage runs.
    Validation,
    SourceResolution,
    Planning,
    RemoteMaterialization,
    RateLimit,
    Cache,
    ApiInvocation,
    ResultReduction,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Validation => "validation",
            StageName::SourceResolution => "source_resolution",
            StageName::Planning => "planning",
            StageName::RemoteMaterialization => "remote_materialization",
            StageName::RateLimit => "rate_limit",
            StageName::Cache => "cache",
            StageName::ApiInvocation => "api_invocation",
            StageName::ResultReduction => "result_reduction",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single, stage-attributed error an execution returns.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{stage} stage failed: {error}")]
pub struct ExecutionError {
    pub stage: StageName,
    #[source]
    pub error: PipelineError,
}

impl ExecutionError {
    pub fn new(stage: StageName, error: PipelineError) -> Self {
        Self { stage, error }
    }

    pub fn is_cancelled(&self) -> bool {
        self.error.is_cancelled()
    }
}
