//! Staged execution pipeline.
//!
//! ```text
//! Initial Command -> Source Resolution -> Planning -> Remote Materialization
//!   -> Rate Limit -> Cache -> API Invocation -> Result Reduction -> Envelope
//! ```
//!
//! Each stage consumes the previous record and either returns the next one
//! or fails with a [`PipelineError`], which the executor attributes to the
//! stage as an [`ExecutionError`]. The only value that leaves a successful
//! run is a [`ResponseEnvelope`], built once at the end.
//!
//! Registries and rate limiters live on the [`Executor`] and are shared by
//! every concurrent `execute` call on it.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache_stage::CacheStage;
use crate::command::{
    FinalizedCommand, InitialCommand, ResolvedCommand, StageTelemetry,
};
use crate::config::EngineConfig;
use crate::envelope::ResponseEnvelope;
use crate::error::{ExecutionError, PipelineError, StageName};
use crate::extract::{ExtractionContext, ResultReducer};
use crate::gateway::{MockAdapter, NoopUsageSink, ProviderAdapter, UsageSink};
use crate::invoke::InvokeStage;
use crate::materialize::{HttpFetcher, Materializer, RemoteFetcher};
use crate::planner;
use crate::rate_limit::{LimiterKey, Pacer, RateLimiters};
use crate::registry::{CacheRegistry, FileRegistry, Registry};
use crate::retry::RetryPolicy;
use crate::source::{Source, SourceKind};

// =============================================================================
// RUN CONTEXT
// =============================================================================

/// Per-run handles the provider-facing stages share.
#[derive(Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub adapter: Arc<dyn ProviderAdapter>,
    pub usage: Arc<dyn UsageSink>,
    pub retry: RetryPolicy,
    pub cancel: CancellationToken,
}

// =============================================================================
// SOURCE RESOLUTION
// =============================================================================

/// Turns caller-supplied sources into sources the planner can use.
#[async_trait]
pub trait SourceResolver: Send + Sync {
    async fn resolve(&self, sources: &[Source]) -> Result<Vec<Source>, PipelineError>;
}

/// Keeps sources as given, checking that local files still exist.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughResolver;

#[async_trait]
impl SourceResolver for PassthroughResolver {
    async fn resolve(&self, sources: &[Source]) -> Result<Vec<Source>, PipelineError> {
        for source in sources.iter().filter(|s| s.kind == SourceKind::File) {
            tokio::fs::metadata(&source.identifier).await.map_err(|e| {
                PipelineError::source(format!("{}: {e}", source.identifier))
            })?;
        }
        Ok(sources.to_vec())
    }
}

// =============================================================================
// EXECUTOR
// =============================================================================

/// Runs commands through the stage pipeline.
pub struct Executor {
    config: Arc<EngineConfig>,
    adapter: Arc<dyn ProviderAdapter>,
    usage: Arc<dyn UsageSink>,
    resolver: Arc<dyn SourceResolver>,
    limiters: RateLimiters,
    materializer: Materializer,
    cache: CacheStage,
    invoke: InvokeStage,
    reducer: ResultReducer,
}

impl Executor {
    /// Dry-run executor backed by [`MockAdapter`].
    ///
    /// Fails when `config.use_real_api` is set; real runs need
    /// [`with_adapter`](Self::with_adapter).
    pub fn new(config: EngineConfig) -> Result<Self, PipelineError> {
        if config.use_real_api {
            return Err(PipelineError::configuration(format!(
                "use_real_api is set but no adapter was supplied for provider {}",
                config.provider
            )));
        }
        Self::with_adapter(config, Arc::new(MockAdapter::new()))
    }

    /// Executor over an explicit provider adapter.
    pub fn with_adapter(
        config: EngineConfig,
        adapter: Arc<dyn ProviderAdapter>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let fetcher = HttpFetcher::new(Duration::from_secs(config.remote_files.timeout_seconds))?;
        Ok(Self {
            config: Arc::new(config),
            adapter,
            usage: Arc::new(NoopUsageSink),
            resolver: Arc::new(PassthroughResolver),
            limiters: RateLimiters::new(),
            materializer: Materializer::new(Arc::new(fetcher)),
            cache: CacheStage::new(Arc::new(Registry::new())),
            invoke: InvokeStage::new(Arc::new(Registry::new())),
            reducer: ResultReducer::default(),
        })
    }

    pub fn with_usage_sink(mut self, usage: Arc<dyn UsageSink>) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn SourceResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Replace the HTTP fetcher used for remote materialization.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn RemoteFetcher>) -> Self {
        self.materializer = Materializer::new(fetcher);
        self
    }

    pub fn with_reducer(mut self, reducer: ResultReducer) -> Self {
        self.reducer = reducer;
        self
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    pub fn adapter(&self) -> &Arc<dyn ProviderAdapter> {
        &self.adapter
    }

    pub fn cache_registry(&self) -> &Arc<CacheRegistry> {
        self.cache.registry()
    }

    pub fn file_registry(&self) -> &Arc<FileRegistry> {
        self.invoke.registry()
    }

    pub fn rate_limiters(&self) -> &RateLimiters {
        &self.limiters
    }

    /// A command bound to this executor's config.
    pub fn command(&self, prompts: Vec<String>, sources: Vec<Source>) -> InitialCommand {
        InitialCommand::new(prompts, sources, Arc::clone(&self.config))
    }

    /// Run `command` through every stage.
    pub async fn execute(
        &self,
        command: InitialCommand,
        cancel: &CancellationToken,
    ) -> Result<ResponseEnvelope, ExecutionError> {
        let ctx = RunContext {
            run_id: Uuid::new_v4(),
            adapter: Arc::clone(&self.adapter),
            usage: Arc::clone(&self.usage),
            retry: command.config.retry.clone(),
            cancel: cancel.clone(),
        };
        let mut telemetry = StageTelemetry::default();
        tracing::debug!(
            run_id = %ctx.run_id,
            prompts = command.prompts.len(),
            sources = command.sources.len(),
            "execution started"
        );

        stage(StageName::Validation, &mut telemetry, cancel, async {
            command.config.validate()
        })
        .await?;

        let resolved_sources = stage(
            StageName::SourceResolution,
            &mut telemetry,
            cancel,
            self.resolver.resolve(&command.sources),
        )
        .await?;
        let resolved = ResolvedCommand {
            initial: command,
            resolved_sources,
        };

        let planned = stage(
            StageName::Planning,
            &mut telemetry,
            cancel,
            planner::plan(resolved),
        )
        .await?;

        let policy = planned.config().remote_files.clone();
        let (plan, report) = stage(
            StageName::RemoteMaterialization,
            &mut telemetry,
            cancel,
            self.materializer.run(planned.plan.clone(), &policy, cancel),
        )
        .await?;
        let planned = planned.with_plan(plan);
        telemetry.diagnostics.extend(report.diagnostics);

        let pacer = planned.plan.rate_constraint.clone().map(|constraint| {
            let key = LimiterKey::new(
                self.adapter.name(),
                &planned.config().model,
                &planned.config().tier,
            );
            let calls = planned.plan.calls().len().max(1) as u64;
            Pacer::new(
                &self.limiters,
                key,
                constraint,
                planned.estimate.expected.div_ceil(calls),
            )
        });
        stage(StageName::RateLimit, &mut telemetry, cancel, async {
            match &pacer {
                Some(pacer) => pacer.admit_first(cancel).await,
                None => Ok(Duration::ZERO),
            }
        })
        .await?;

        let (planned, decision) = stage(
            StageName::Cache,
            &mut telemetry,
            cancel,
            self.cache.run(planned, &ctx),
        )
        .await?;
        telemetry.cache_used = decision.cache_name().is_some();
        telemetry.diagnostics.push(decision.to_diagnostic());

        let invocation = stage(
            StageName::ApiInvocation,
            &mut telemetry,
            cancel,
            self.invoke.run(&planned, &ctx, pacer.as_ref()),
        )
        .await?;
        if let Some(pacer) = &pacer {
            telemetry.rate_limit_wait_ms = pacer.waited().as_millis() as u64;
        }

        let started = Instant::now();
        let extraction = ExtractionContext {
            expected_count: planned.plan.calls().len(),
            prefer_json_array: planned.options().prefer_json_array,
        };
        let reduction = self.reducer.reduce(
            Some(&invocation.raw_output),
            &extraction,
            planned.options().contract.as_ref(),
        );
        telemetry.record(StageName::ResultReduction.as_str(), started.elapsed());

        tracing::debug!(
            run_id = %ctx.run_id,
            method = %reduction.method,
            cache_used = telemetry.cache_used,
            "execution finished"
        );

        let finalized = FinalizedCommand {
            planned,
            invocation,
            telemetry,
        };
        Ok(ResponseEnvelope::build(finalized, reduction))
    }
}

/// Run one stage: refuse to start after cancellation, time it, and
/// attribute any failure to `name`.
async fn stage<T>(
    name: StageName,
    telemetry: &mut StageTelemetry,
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, PipelineError>>,
) -> Result<T, ExecutionError> {
    if cancel.is_cancelled() {
        return Err(ExecutionError::new(name, PipelineError::Cancelled));
    }
    let started = Instant::now();
    let result = fut.await;
    telemetry.record(name.as_str(), started.elapsed());
    result.map_err(|error| {
        if !error.is_cancelled() {
            tracing::warn!(stage = %name, error = %error, "stage failed");
        }
        ExecutionError::new(name, error)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Status;

    #[tokio::test]
    async fn dry_run_echoes_each_prompt() {
        let executor = Executor::new(EngineConfig::default()).unwrap();
        let command = executor.command(
            vec!["Q1".into(), "Q2".into()],
            vec![Source::text("shared doc")],
        );
        let envelope = executor
            .execute(command, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(envelope.status, Status::Ok);
        assert_eq!(envelope.answers, vec!["echo: Q1", "echo: Q2"]);
        assert_eq!(envelope.metrics.per_call.len(), 2);
        assert!(envelope.usage["total_tokens"] > 0);
        assert!(envelope.metrics.durations.contains_key("api_invocation_ms"));
    }

    #[tokio::test]
    async fn real_api_without_adapter_is_rejected() {
        let config = EngineConfig {
            use_real_api: true,
            api_key: Some("k".into()),
            ..EngineConfig::default()
        };
        assert!(matches!(
            Executor::new(config),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn cancelled_runs_fail_at_the_first_stage() {
        let executor = Executor::new(EngineConfig::default()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = executor
            .execute(executor.command(vec!["Q".into()], Vec::new()), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.stage, StageName::Validation);
    }

    #[tokio::test]
    async fn planning_errors_are_attributed() {
        let executor = Executor::new(EngineConfig::default()).unwrap();
        let err = executor
            .execute(executor.command(Vec::new(), Vec::new()), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.stage, StageName::Planning);
        assert!(matches!(err.error, PipelineError::Planning(_)));
    }
}
