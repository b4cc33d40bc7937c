//! Staged command records and the execution plan.
//!
//! A command moves forward through immutable records:
//! `Initial -> Resolved -> Planned -> Finalized`. Each record embeds its
//! predecessor, so the finalized record carries the full provenance of a
//! run. Stages take a record by value and return a new one.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::EngineConfig;
use crate::error::PipelineError;
use crate::gateway::{GenerationConfig, Part};
use crate::rate_limit::RateConstraint;
use crate::source::Source;
use crate::tokens::TokenEstimate;

// =============================================================================
// OPTIONS
// =============================================================================

/// One prior conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: String,
    pub content: String,
}

impl HistoryTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Render history as the text of a shared context part.
pub fn render_history(history: &[HistoryTurn]) -> String {
    history
        .iter()
        .map(|turn| format!("{}: {}", turn.role, turn.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Explicit caching policy. Supplying one opts in to caching even when the
/// engine config leaves caching disabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    /// Only cache when there is no conversation history yet.
    pub first_turn_only: bool,
    /// Skip caching below the model's minimum cacheable size.
    pub respect_floor: bool,
    /// Minimum estimate confidence needed to trust a floor skip.
    pub confidence_floor: f64,
    /// Floor override in tokens; defaults to the model's published floor.
    pub min_tokens_floor: Option<u32>,
    pub ttl_seconds: Option<u64>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            first_turn_only: false,
            respect_floor: true,
            confidence_floor: 0.7,
            min_tokens_floor: None,
            ttl_seconds: None,
        }
    }
}

/// Expectations the reduced answers are checked against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultContract {
    pub expected_count: Option<usize>,
    pub min_answer_len: Option<usize>,
    pub max_answer_len: Option<usize>,
    /// Fields each structured payload must carry.
    pub required_fields: Vec<String>,
}

/// Per-execution options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionOptions {
    pub system_instruction: Option<String>,
    pub history: Vec<HistoryTurn>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub reasoning_effort: Option<String>,
    pub response_schema: Option<Value>,
    pub cache_policy: Option<CachePolicy>,
    /// Use this provider cache as-is; skips lookup and creation.
    pub cache_override_name: Option<String>,
    /// Use this identity instead of the content-derived key.
    pub cache_key_override: Option<String>,
    /// Reuse an existing cache but never create one.
    pub reuse_only: bool,
    /// Try the JSON-array extractor before any other.
    pub prefer_json_array: bool,
    pub contract: Option<ResultContract>,
    /// Model for the single fallback attempt after a primary failure.
    pub fallback_model: Option<String>,
}

impl ExecutionOptions {
    pub fn history_text(&self) -> String {
        render_history(&self.history)
    }
}

// =============================================================================
// PLAN
// =============================================================================

/// One provider call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiCall {
    pub model: String,
    pub prompt: String,
    /// Call-specific parts; shared context lives on the plan.
    pub parts: Vec<Part>,
    pub config: GenerationConfig,
    pub cache_name_to_use: Option<String>,
}

impl ApiCall {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>, config: GenerationConfig) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            parts: Vec::new(),
            config,
            cache_name_to_use: None,
        }
    }

    pub fn with_cache(mut self, name: impl Into<String>) -> Self {
        self.cache_name_to_use = Some(name.into());
        self
    }
}

/// What the invocation stage executes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionPlan {
    calls: Vec<ApiCall>,
    /// Context common to every call (history, attached sources).
    pub shared_parts: Vec<Part>,
    /// Template for the fallback attempt; parts come from the failing call.
    pub fallback_call: Option<ApiCall>,
    pub rate_constraint: Option<RateConstraint>,
    pub cache_key: Option<String>,
    /// Indices into `shared_parts` left out of the provider cache. These are
    /// still sent with every call when a cache is in use.
    pub cache_excluded: Vec<usize>,
}

impl ExecutionPlan {
    /// Build a plan. Fails if `calls` is empty.
    pub fn new(calls: Vec<ApiCall>, shared_parts: Vec<Part>) -> Result<Self, PipelineError> {
        if calls.is_empty() {
            return Err(PipelineError::planning("execution plan has no calls"));
        }
        Ok(Self {
            calls,
            shared_parts,
            fallback_call: None,
            rate_constraint: None,
            cache_key: None,
            cache_excluded: Vec::new(),
        })
    }

    pub fn calls(&self) -> &[ApiCall] {
        &self.calls
    }

    /// Rewrite every call; the call count is preserved.
    pub fn map_calls(mut self, f: impl FnMut(ApiCall) -> ApiCall) -> Self {
        self.calls = self.calls.into_iter().map(f).collect();
        self
    }

    /// Parts sent with `call`, in order: shared context (minus what the
    /// provider cache already holds), call parts, then the prompt.
    pub fn assemble_parts(&self, call: &ApiCall) -> Vec<Part> {
        let mut parts = Vec::with_capacity(self.shared_parts.len() + call.parts.len() + 1);
        if call.cache_name_to_use.is_some() {
            parts.extend(
                self.cache_excluded
                    .iter()
                    .filter_map(|&i| self.shared_parts.get(i).cloned()),
            );
        } else {
            parts.extend(self.shared_parts.iter().cloned());
        }
        parts.extend(call.parts.iter().cloned());
        parts.push(Part::text(call.prompt.clone()));
        parts
    }

    /// Parts that went into the provider cache.
    pub fn cached_parts(&self) -> Vec<Part> {
        self.shared_parts
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.cache_excluded.contains(i))
            .map(|(_, p)| p.clone())
            .collect()
    }
}

// =============================================================================
// STAGED RECORDS
// =============================================================================

/// What the caller asked for.
#[derive(Debug, Clone)]
pub struct InitialCommand {
    pub prompts: Vec<String>,
    pub sources: Vec<Source>,
    pub config: Arc<EngineConfig>,
    pub options: ExecutionOptions,
}

impl InitialCommand {
    pub fn new(prompts: Vec<String>, sources: Vec<Source>, config: Arc<EngineConfig>) -> Self {
        Self {
            prompts,
            sources,
            config,
            options: ExecutionOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }
}

/// Sources materialized by the source resolver.
#[derive(Debug, Clone)]
pub struct ResolvedCommand {
    pub initial: InitialCommand,
    pub resolved_sources: Vec<Source>,
}

/// A command with its execution plan.
#[derive(Debug, Clone)]
pub struct PlannedCommand {
    pub resolved: ResolvedCommand,
    pub plan: ExecutionPlan,
    /// Whole-plan estimate, used by the rate limiter.
    pub estimate: TokenEstimate,
    /// Shared-context estimate, used by the cache floor policy.
    pub context_estimate: TokenEstimate,
}

impl PlannedCommand {
    pub fn options(&self) -> &ExecutionOptions {
        &self.resolved.initial.options
    }

    pub fn config(&self) -> &EngineConfig {
        &self.resolved.initial.config
    }

    /// The same command with a rewritten plan.
    pub fn with_plan(self, plan: ExecutionPlan) -> Self {
        Self { plan, ..self }
    }
}

/// Outcome of one call in the invocation stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallMetrics {
    pub index: usize,
    pub model: String,
    pub duration_ms: u64,
    pub attempts: u32,
    pub used_fallback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_name: Option<String>,
    pub usage: BTreeMap<String, u64>,
}

/// Everything the invocation stage produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InvocationReport {
    /// Raw value handed to the reducer.
    pub raw_output: Value,
    /// Summed key-wise over every call.
    pub usage: BTreeMap<String, u64>,
    pub per_call: Vec<CallMetrics>,
    pub diagnostics: Vec<Value>,
}

/// Durations and flags collected while the command moved through stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageTelemetry {
    pub durations: BTreeMap<String, u64>,
    pub cache_used: bool,
    pub rate_limit_wait_ms: u64,
    pub diagnostics: Vec<Value>,
}

impl StageTelemetry {
    pub fn record(&mut self, stage: &str, elapsed: Duration) {
        self.durations
            .insert(format!("{stage}_ms"), elapsed.as_millis() as u64);
    }
}

/// Provider response plus telemetry; input to the result reducer.
#[derive(Debug, Clone)]
pub struct FinalizedCommand {
    pub planned: PlannedCommand,
    pub invocation: InvocationReport,
    pub telemetry: StageTelemetry,
}
