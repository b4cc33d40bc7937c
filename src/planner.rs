//! Execution planner.
//!
//! Turns a resolved command into an [`ExecutionPlan`]: one call per prompt,
//! shared context built once from history and sources, token estimates for
//! the limiter and the cache floor, the cache identity key, the rate
//! constraint, and the optional fallback template.

use crate::cache::CacheIdentityKey;
use crate::command::{ApiCall, ExecutionOptions, ExecutionPlan, PlannedCommand, ResolvedCommand};
use crate::error::PipelineError;
use crate::gateway::{models, GenerationConfig, Part};
use crate::rate_limit::RateConstraint;
use crate::tokens::{estimate_context, estimate_plan};

fn generation_config(options: &ExecutionOptions) -> GenerationConfig {
    GenerationConfig {
        system_instruction: options.system_instruction.clone(),
        temperature: options.temperature,
        max_output_tokens: options.max_output_tokens,
        response_schema: options.response_schema.clone(),
        reasoning_effort: options.reasoning_effort.clone(),
        cached_content: None,
    }
}

/// Build the plan for `resolved`.
pub async fn plan(resolved: ResolvedCommand) -> Result<PlannedCommand, PipelineError> {
    let initial = &resolved.initial;
    let config = &initial.config;
    let options = &initial.options;

    if initial.prompts.is_empty() {
        return Err(PipelineError::planning("command has no prompts"));
    }
    if let Some(i) = initial.prompts.iter().position(|p| p.trim().is_empty()) {
        return Err(PipelineError::planning(format!("prompt {i} is empty")));
    }

    let call_config = generation_config(options);
    let calls = initial
        .prompts
        .iter()
        .map(|prompt| ApiCall::new(config.model.clone(), prompt.clone(), call_config.clone()))
        .collect();

    // Shared context: history first, then sources in caller order.
    let history_text = options.history_text();
    let mut shared_parts = Vec::with_capacity(resolved.resolved_sources.len() + 1);
    if !history_text.is_empty() {
        shared_parts.push(Part::text(history_text.clone()));
    }
    for source in &resolved.resolved_sources {
        shared_parts.push(source.to_part().await?);
    }

    let mut plan = ExecutionPlan::new(calls, shared_parts)?;

    let context_estimate =
        estimate_context(&config.provider, &resolved.resolved_sources, &history_text);
    let estimate = estimate_plan(&config.provider, &context_estimate, &initial.prompts);

    plan.cache_key = match &options.cache_key_override {
        Some(key) => Some(CacheIdentityKey::from_override(&config.model, key)),
        None if !plan.shared_parts.is_empty() => Some(
            CacheIdentityKey::for_sources(
                &config.model,
                options.system_instruction.as_deref(),
                &history_text,
                &resolved.resolved_sources,
            )
            .await?
            .key_hash,
        ),
        None => None,
    };

    // Dry runs are never throttled.
    if config.use_real_api {
        plan.rate_constraint = models::model_profile(&config.model)
            .and_then(|profile| profile.tier_limits(&config.tier))
            .map(RateConstraint::from);
        if plan.rate_constraint.is_none() {
            tracing::debug!(
                model = %config.model,
                tier = %config.tier,
                "no published rate limits, running unthrottled"
            );
        }
    }

    plan.fallback_call = options
        .fallback_model
        .as_ref()
        .map(|model| ApiCall::new(model.clone(), String::new(), call_config.clone()));

    tracing::debug!(
        calls = plan.calls().len(),
        shared_parts = plan.shared_parts.len(),
        expected_tokens = estimate.expected,
        cache_key = ?plan.cache_key,
        "plan built"
    );

    Ok(PlannedCommand {
        resolved,
        plan,
        estimate,
        context_estimate,
    })
}
