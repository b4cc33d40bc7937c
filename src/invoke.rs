//! API invocation stage.
//!
//! Executes every call of a plan under bounded concurrency. Pending local
//! files are resolved to provider uploads through the single-flight
//! coordinator, so a file shared by many calls is uploaded once. Retryable
//! failures are retried per policy; a call that still fails gets one
//! fallback attempt when the plan carries a fallback template. Any call
//! that cannot be recovered fails the whole stage.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::{json, Value};

use crate::command::{ApiCall, CallMetrics, ExecutionPlan, InvocationReport, PlannedCommand};
use crate::error::PipelineError;
use crate::gateway::{
    ApiError, ApiPhase, FileRef, GenerateResponse, GenerationConfig, Part, ProviderCallRecord,
};
use crate::pipeline::RunContext;
use crate::rate_limit::Pacer;
use crate::registry::FileRegistry;
use crate::retry::{retry_with_policy, RetryScope};
use crate::single_flight::SingleFlight;

/// Outcome of one call before aggregation.
struct CallOutcome {
    index: usize,
    response: GenerateResponse,
    metrics: CallMetrics,
    diagnostics: Vec<Value>,
}

/// Invocation stage bound to one executor's file registry.
pub struct InvokeStage {
    uploads: SingleFlight<FileRef>,
}

impl InvokeStage {
    pub fn new(registry: Arc<FileRegistry>) -> Self {
        Self {
            uploads: SingleFlight::new(registry),
        }
    }

    pub fn registry(&self) -> &Arc<FileRegistry> {
        self.uploads.registry()
    }

    /// Run every call and aggregate the results in call order.
    pub async fn run(
        &self,
        planned: &PlannedCommand,
        ctx: &RunContext,
        pacer: Option<&Pacer>,
    ) -> Result<InvocationReport, PipelineError> {
        let plan = &planned.plan;
        // Constrained plans go one request at a time; the pacer spaces them.
        let fan_out = if pacer.is_some() {
            1
        } else {
            planned.config().request_concurrency.max(1)
        };

        tracing::debug!(
            calls = plan.calls().len(),
            fan_out,
            run_id = %ctx.run_id,
            "invoking provider"
        );

        let mut outcomes: Vec<CallOutcome> = stream::iter(plan.calls().iter().enumerate())
            .map(|(index, call)| self.execute_call(plan, index, call, ctx, pacer))
            .buffer_unordered(fan_out)
            .try_collect()
            .await?;
        outcomes.sort_by_key(|o| o.index);

        let mut report = InvocationReport::default();
        let mut raws = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            for (key, value) in outcome.response.usage.counters() {
                *report.usage.entry(key).or_insert(0) += value;
            }
            raws.push(outcome.response.raw_output());
            report.per_call.push(outcome.metrics);
            report.diagnostics.extend(outcome.diagnostics);
        }
        report.raw_output = if raws.len() == 1 {
            raws.pop().unwrap_or(Value::Null)
        } else {
            json!({ "batch": raws })
        };
        Ok(report)
    }

    async fn execute_call(
        &self,
        plan: &ExecutionPlan,
        index: usize,
        call: &ApiCall,
        ctx: &RunContext,
        pacer: Option<&Pacer>,
    ) -> Result<CallOutcome, PipelineError> {
        let started = Instant::now();
        let mut diagnostics = Vec::new();

        let parts = self.resolve_uploads(plan.assemble_parts(call), ctx).await?;
        let config = effective_config(call, ctx, &mut diagnostics);

        let primary = retry_with_policy(
            &ctx.retry,
            RetryScope::Generate,
            &ctx.cancel,
            |attempt| generate_once(ctx, pacer, index, &call.model, &parts, &config, attempt),
        )
        .await;

        let (response, attempts, used_fallback, model) = match primary {
            Ok(retried) => (retried.value, retried.attempts, false, call.model.clone()),
            Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(primary_err) => {
                let Some(template) = &plan.fallback_call else {
                    return Err(primary_err);
                };
                let fallback = fallback_for(template, call);
                tracing::info!(
                    call_index = index,
                    primary_model = %call.model,
                    fallback_model = %fallback.model,
                    error = %primary_err,
                    "primary call failed, trying fallback"
                );
                let parts = self.resolve_uploads(plan.assemble_parts(&fallback), ctx).await?;
                let config = effective_config(&fallback, ctx, &mut diagnostics);
                // Exactly one attempt; a failure here surfaces the primary error.
                match generate_once(ctx, pacer, index, &fallback.model, &parts, &config, 1).await {
                    Ok(response) => {
                        diagnostics.push(json!({
                            "event": "fallback",
                            "call_index": index,
                            "used_fallback": true,
                            "fallback_model": fallback.model,
                            "primary_error": {
                                "code": primary_err.code(),
                                "message": primary_err.to_string(),
                            },
                        }));
                        (response, 1, true, fallback.model)
                    }
                    Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                    Err(fallback_err) => {
                        tracing::warn!(
                            call_index = index,
                            error = %fallback_err,
                            "fallback call failed"
                        );
                        return Err(primary_err);
                    }
                }
            }
        };

        let metrics = CallMetrics {
            index,
            model,
            duration_ms: started.elapsed().as_millis() as u64,
            attempts,
            used_fallback,
            cache_name: if used_fallback {
                None
            } else {
                call.cache_name_to_use.clone()
            },
            usage: response.usage.counters(),
        };
        Ok(CallOutcome {
            index,
            response,
            metrics,
            diagnostics,
        })
    }

    /// Replace pending local files with upload references (or inline bytes
    /// when the adapter cannot upload).
    async fn resolve_uploads(
        &self,
        parts: Vec<Part>,
        ctx: &RunContext,
    ) -> Result<Vec<Part>, PipelineError> {
        if !parts.iter().any(Part::is_pending_file) {
            return Ok(parts);
        }
        let can_upload = ctx.adapter.capabilities().uploads;

        let mut resolved = Vec::with_capacity(parts.len());
        for part in parts {
            let (path, mime_type) = match part {
                Part::File { path, mime_type } => (path, mime_type),
                other => {
                    resolved.push(other);
                    continue;
                }
            };
            if !can_upload {
                let data = tokio::fs::read(&path).await.map_err(|e| {
                    PipelineError::source(format!("cannot read {}: {e}", path.display()))
                })?;
                resolved.push(Part::Inline { data, mime_type });
                continue;
            }
            let key = format!("{}|{mime_type}", path.display());
            let file = self
                .uploads
                .run(&key, None, &ctx.cancel, || upload(ctx, &path, &mime_type))
                .await?;
            resolved.push(Part::Uploaded { file, mime_type });
        }
        Ok(resolved)
    }
}

/// Call config with the cache applied and unsupported settings removed.
fn effective_config(
    call: &ApiCall,
    ctx: &RunContext,
    diagnostics: &mut Vec<Value>,
) -> GenerationConfig {
    let caps = ctx.adapter.capabilities();
    let mut config = call.config.clone();
    config.cached_content = call.cache_name_to_use.clone();

    if config.response_schema.is_some() && !caps.structured_output {
        config.response_schema = None;
        diagnostics.push(json!({
            "event": "capability_dropped",
            "setting": "response_schema",
        }));
    }
    if config.reasoning_effort.is_some() && !caps.reasoning_effort {
        config.reasoning_effort = None;
        diagnostics.push(json!({
            "event": "capability_dropped",
            "setting": "reasoning_effort",
        }));
    }
    config
}

/// Fallback call for `call`: the template's model and config, the failing
/// call's parts and prompt, and no cache.
fn fallback_for(template: &ApiCall, call: &ApiCall) -> ApiCall {
    ApiCall {
        model: template.model.clone(),
        prompt: call.prompt.clone(),
        parts: call.parts.clone(),
        config: template.config.clone(),
        cache_name_to_use: None,
    }
}

async fn generate_once(
    ctx: &RunContext,
    pacer: Option<&Pacer>,
    index: usize,
    model: &str,
    parts: &[Part],
    config: &GenerationConfig,
    attempt: u32,
) -> Result<GenerateResponse, PipelineError> {
    if let Some(pacer) = pacer {
        pacer.admit(&ctx.cancel).await?;
    }
    let started = Instant::now();
    let result = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => return Err(PipelineError::Cancelled),
        result = ctx.adapter.generate(model, parts, config) => result,
    };
    let latency = started.elapsed();

    let record = ProviderCallRecord::new(ctx.run_id, ctx.adapter.name(), ApiPhase::Generate, model)
        .call(index)
        .attempt(attempt)
        .latency(latency.as_millis() as u64);
    match result {
        Ok(mut response) => {
            ctx.usage
                .record(
                    record
                        .usage(&response.usage)
                        .request_id(response.response_id.clone()),
                )
                .await;
            if response.latency.is_zero() {
                response.latency = latency;
            }
            Ok(response)
        }
        Err(e) => {
            let e = attribute(e, index);
            ctx.usage
                .record(
                    record
                        .error(e.code())
                        .request_id(e.request_id().map(str::to_string)),
                )
                .await;
            Err(PipelineError::Api(e))
        }
    }
}

fn attribute(e: ApiError, index: usize) -> ApiError {
    if e.call_index.is_some() {
        e
    } else {
        e.with_call_index(index)
    }
}

async fn upload(ctx: &RunContext, path: &Path, mime_type: &str) -> Result<FileRef, PipelineError> {
    let label = path.display().to_string();
    let label = label.as_str();
    let retried = retry_with_policy(
        &ctx.retry,
        RetryScope::SideEffect,
        &ctx.cancel,
        move |attempt| async move {
            let started = Instant::now();
            let result = ctx.adapter.upload(path, mime_type).await;
            let mut record =
                ProviderCallRecord::new(ctx.run_id, ctx.adapter.name(), ApiPhase::Upload, label)
                    .attempt(attempt)
                    .latency(started.elapsed().as_millis() as u64);
            if let Err(e) = &result {
                record = record
                    .error(e.code())
                    .request_id(e.request_id().map(str::to_string));
            }
            ctx.usage.record(record).await;
            result.map_err(PipelineError::from)
        },
    )
    .await?;

    tracing::debug!(
        path = %label,
        file = %retried.value.as_str(),
        attempts = retried.attempts,
        "file uploaded"
    );
    Ok(retried.value)
}
