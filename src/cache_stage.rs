//! Cache stage.
//!
//! Decides whether the plan's shared context should live in a provider-side
//! cache, creates it at most once per identity key, and annotates every
//! call with the cache name. Caching is an optimization: apart from
//! provider errors, nothing here fails the pipeline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use crate::command::PlannedCommand;
use crate::error::PipelineError;
use crate::gateway::{models, ApiPhase, Part, ProviderCallRecord};
use crate::pipeline::RunContext;
use crate::registry::CacheRegistry;
use crate::retry::{retry_with_policy, RetryScope};
use crate::single_flight::SingleFlight;

/// Local files up to this size are inlined into the cache payload. Larger
/// files stay out of the cache and are uploaded per call.
pub const INLINE_MAX_BYTES: u64 = 20 * 1024 * 1024;

/// What the stage decided.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheDecision {
    /// Caller-supplied cache name applied without lookup.
    Override(String),
    /// Existing cache reused.
    Hit(String),
    /// New cache created.
    Created(String),
    /// No cache used.
    Skipped(&'static str),
}

impl CacheDecision {
    pub fn cache_name(&self) -> Option<&str> {
        match self {
            CacheDecision::Override(n) | CacheDecision::Hit(n) | CacheDecision::Created(n) => {
                Some(n)
            }
            CacheDecision::Skipped(_) => None,
        }
    }

    pub fn to_diagnostic(&self) -> Value {
        match self {
            CacheDecision::Override(name) => {
                json!({"event": "cache", "decision": "override", "name": name})
            }
            CacheDecision::Hit(name) => json!({"event": "cache", "decision": "hit", "name": name}),
            CacheDecision::Created(name) => {
                json!({"event": "cache", "decision": "created", "name": name})
            }
            CacheDecision::Skipped(reason) => {
                json!({"event": "cache", "decision": "skipped", "reason": reason})
            }
        }
    }
}

/// Cache stage bound to one executor's cache registry.
pub struct CacheStage {
    flights: SingleFlight<String>,
}

impl CacheStage {
    pub fn new(registry: Arc<CacheRegistry>) -> Self {
        Self {
            flights: SingleFlight::new(registry),
        }
    }

    pub fn registry(&self) -> &Arc<CacheRegistry> {
        self.flights.registry()
    }

    pub async fn run(
        &self,
        planned: PlannedCommand,
        ctx: &RunContext,
    ) -> Result<(PlannedCommand, CacheDecision), PipelineError> {
        let options = planned.options().clone();

        // (a) Explicit cache name: apply as-is, no adapter needed.
        if let Some(name) = options.cache_override_name.clone() {
            let decision = CacheDecision::Override(name.clone());
            return Ok((apply(planned, &name), decision));
        }

        // (b) Caching-capable adapter.
        if !ctx.adapter.capabilities().caching {
            return Ok((planned, CacheDecision::Skipped("adapter_without_caching")));
        }

        // (c) Shape the shared context.
        let excluded = match excluded_parts(&planned.plan.shared_parts).await {
            Ok(excluded) => excluded,
            Err(e) => {
                tracing::warn!(error = %e, "cache payload shaping failed");
                return Ok((planned, CacheDecision::Skipped("payload_error")));
            }
        };
        if planned.plan.shared_parts.len() == excluded.len() {
            return Ok((planned, CacheDecision::Skipped("no_shared_context")));
        }
        // Recorded before creation so the cache payload leaves these out.
        let planned = exclude(planned, excluded);

        // (d) Identity key, computed by the planner when eligible.
        let Some(key) = planned.plan.cache_key.clone() else {
            return Ok((planned, CacheDecision::Skipped("no_cache_key")));
        };

        // (e) Registry lookup.
        if let Some(name) = self.registry().get(&key) {
            tracing::debug!(key = %key, name = %name, "cache hit");
            let decision = CacheDecision::Hit(name.clone());
            return Ok((apply(planned, &name), decision));
        }

        // (f) Policy gates on a miss.
        if let Some(reason) = skip_reason(&planned) {
            tracing::debug!(key = %key, reason, "cache creation skipped");
            return Ok((planned, CacheDecision::Skipped(reason)));
        }

        // (g) Create under single-flight.
        let config = planned.config();
        let ttl = Duration::from_secs(
            options
                .cache_policy
                .as_ref()
                .and_then(|p| p.ttl_seconds)
                .unwrap_or(config.ttl_seconds),
        );
        let model = planned.plan.calls()[0].model.clone();
        let cached_parts = planned.plan.cached_parts();
        let system_instruction = options.system_instruction.clone();

        let created = self
            .flights
            .run(&key, Some(ttl), &ctx.cancel, || {
                create_cache(ctx, &model, cached_parts, system_instruction.as_deref(), ttl)
            })
            .await;

        match created {
            Ok(name) => {
                let decision = CacheDecision::Created(name.clone());
                Ok((apply(planned, &name), decision))
            }
            Err(e @ (PipelineError::Api(_) | PipelineError::Cancelled)) => Err(e),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "cache creation failed, continuing uncached");
                Ok((planned, CacheDecision::Skipped("creation_failed")))
            }
        }
    }
}

fn apply(planned: PlannedCommand, name: &str) -> PlannedCommand {
    let plan = planned.plan.clone().map_calls(|call| call.with_cache(name));
    planned.with_plan(plan)
}

fn exclude(planned: PlannedCommand, excluded: Vec<usize>) -> PlannedCommand {
    let mut plan = planned.plan.clone();
    plan.cache_excluded = excluded;
    planned.with_plan(plan)
}

/// Indices of shared parts too large to inline into the cache.
async fn excluded_parts(shared: &[Part]) -> Result<Vec<usize>, PipelineError> {
    let mut excluded = Vec::new();
    for (i, part) in shared.iter().enumerate() {
        if let Part::File { path, .. } = part {
            let metadata = tokio::fs::metadata(path).await.map_err(|e| {
                PipelineError::source(format!("cannot stat {}: {e}", path.display()))
            })?;
            if metadata.len() > INLINE_MAX_BYTES {
                excluded.push(i);
            }
        }
    }
    Ok(excluded)
}

fn skip_reason(planned: &PlannedCommand) -> Option<&'static str> {
    let options = planned.options();
    if options.reuse_only {
        return Some("reuse_only");
    }
    if !planned.config().enable_caching && options.cache_policy.is_none() {
        return Some("caching_disabled");
    }
    let policy = options.cache_policy.clone().unwrap_or_default();
    if policy.first_turn_only && !options.history.is_empty() {
        return Some("not_first_turn");
    }
    if policy.respect_floor {
        let model = &planned.plan.calls()[0].model;
        let floor = policy
            .min_tokens_floor
            .or_else(|| models::min_cache_tokens(model));
        let estimate = &planned.context_estimate;
        if let Some(floor) = floor {
            let trusted = estimate.confidence >= policy.confidence_floor;
            if estimate.expected < u64::from(floor) && trusted {
                return Some("below_token_floor");
            }
        }
    }
    None
}

async fn create_cache(
    ctx: &RunContext,
    model: &str,
    parts: Vec<Part>,
    system_instruction: Option<&str>,
    ttl: Duration,
) -> Result<String, PipelineError> {
    let parts = inline_files(parts).await?;

    let parts = &parts;
    let retried = retry_with_policy(&ctx.retry, RetryScope::SideEffect, &ctx.cancel, move |attempt| {
        async move {
            let started = Instant::now();
            let result = ctx
                .adapter
                .create_cache(model, parts, system_instruction, ttl)
                .await;
            let mut record =
                ProviderCallRecord::new(ctx.run_id, ctx.adapter.name(), ApiPhase::Cache, model)
                    .latency(started.elapsed().as_millis() as u64)
                    .attempt(attempt);
            if let Err(e) = &result {
                record = record.error(e.code()).request_id(e.request_id().map(str::to_string));
            }
            ctx.usage.record(record).await;
            result.map_err(PipelineError::from)
        }
    })
    .await?;

    tracing::info!(
        name = %retried.value,
        model = %model,
        ttl_s = ttl.as_secs(),
        attempts = retried.attempts,
        "provider cache created"
    );
    Ok(retried.value)
}

/// Replace local files with inline bytes.
async fn inline_files(parts: Vec<Part>) -> Result<Vec<Part>, PipelineError> {
    let mut out = Vec::with_capacity(parts.len());
    for part in parts {
        match part {
            Part::File { path, mime_type } => {
                let data = tokio::fs::read(&path).await.map_err(|e| {
                    PipelineError::source(format!("cannot read {}: {e}", path.display()))
                })?;
                out.push(Part::Inline { data, mime_type });
            }
            other => out.push(other),
        }
    }
    Ok(out)
}
