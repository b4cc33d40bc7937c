use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use batchline::cache_stage::INLINE_MAX_BYTES;
use batchline::gateway::{
    ApiPhase, FileRef, GenerateResponse, GenerationConfig, Part, ProviderCallRecord, Usage,
};
use batchline::{
    ApiError, CachePolicy, Capabilities, EngineConfig, ExecutionOptions, Executor, HistoryTurn,
    MockAdapter, PipelineError, ProviderAdapter, ResultContract, Source, StageName, Status,
    UsageSink,
};
use serde_json::{json, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Scripted adapters
// =============================================================================

/// Answers "answer to {prompt}"; rejects listed models; can fail transiently.
#[derive(Default)]
struct ScriptedAdapter {
    rejected_models: Vec<&'static str>,
    transient_failures: AtomicUsize,
    generate_calls: AtomicUsize,
    seen: Mutex<Vec<(String, usize)>>,
}

impl ScriptedAdapter {
    fn rejecting(models: &[&'static str]) -> Self {
        Self {
            rejected_models: models.to_vec(),
            ..Self::default()
        }
    }

    fn flaky(failures: usize) -> Self {
        Self {
            transient_failures: AtomicUsize::new(failures),
            ..Self::default()
        }
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        "scripted"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            structured_output: true,
            ..Capabilities::text_only()
        }
    }

    async fn generate(
        &self,
        model: &str,
        parts: &[Part],
        _config: &GenerationConfig,
    ) -> Result<GenerateResponse, ApiError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .push((model.to_string(), parts.len()));

        if self.rejected_models.contains(&model) {
            return Err(ApiError::from_status(
                "scripted",
                ApiPhase::Generate,
                400,
                format!("model {model} rejected the request"),
            ));
        }
        if self.transient_failures.load(Ordering::SeqCst) > 0 {
            self.transient_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(ApiError::from_status(
                "scripted",
                ApiPhase::Generate,
                503,
                "overloaded",
            ));
        }

        let prompt = parts.iter().rev().find_map(Part::as_text).unwrap_or("");
        let response = if prompt.contains("blank") {
            GenerateResponse::text("", Usage::new(10, 0))
        } else if let Some(rest) = prompt.strip_prefix("score:") {
            GenerateResponse::text(format!("scored {rest}"), Usage::new(10, 5))
                .with_structured(json!({"score": rest.trim().len()}))
        } else {
            GenerateResponse::text(format!("answer to {prompt}"), Usage::new(10, 5))
        };
        Ok(response)
    }
}

/// Never answers.
struct HangingAdapter;

#[async_trait]
impl ProviderAdapter for HangingAdapter {
    fn name(&self) -> &str {
        "hanging"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::text_only()
    }

    async fn generate(
        &self,
        _model: &str,
        _parts: &[Part],
        _config: &GenerationConfig,
    ) -> Result<GenerateResponse, ApiError> {
        std::future::pending().await
    }
}

/// Caches and uploads everything; remembers what each call carried.
#[derive(Default)]
struct RecordingAdapter {
    cache_payloads: Mutex<Vec<Vec<String>>>,
    generate_payloads: Mutex<Vec<Vec<String>>>,
}

fn describe(part: &Part) -> String {
    match part {
        Part::Text { text } => format!("text:{}", text.len()),
        Part::File { .. } => "file".to_string(),
        Part::Uri { uri, .. } => format!("uri:{uri}"),
        Part::Uploaded { file, .. } => format!("uploaded:{}", file.as_str()),
        Part::Inline { data, .. } => format!("inline:{}", data.len()),
    }
}

#[async_trait]
impl ProviderAdapter for RecordingAdapter {
    fn name(&self) -> &str {
        "recording"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    async fn generate(
        &self,
        _model: &str,
        parts: &[Part],
        _config: &GenerationConfig,
    ) -> Result<GenerateResponse, ApiError> {
        self.generate_payloads
            .lock()
            .unwrap()
            .push(parts.iter().map(describe).collect());
        Ok(GenerateResponse::text("ok", Usage::new(1, 1)))
    }

    async fn upload(&self, _path: &Path, _mime_type: &str) -> Result<FileRef, ApiError> {
        Ok(FileRef::new("files/big"))
    }

    async fn create_cache(
        &self,
        _model: &str,
        parts: &[Part],
        _system_instruction: Option<&str>,
        _ttl: Duration,
    ) -> Result<String, ApiError> {
        self.cache_payloads
            .lock()
            .unwrap()
            .push(parts.iter().map(describe).collect());
        Ok("cachedContents/recorded".to_string())
    }
}

#[derive(Default)]
struct CollectingSink {
    records: Mutex<Vec<ProviderCallRecord>>,
}

#[async_trait]
impl UsageSink for CollectingSink {
    async fn record(&self, record: ProviderCallRecord) {
        self.records.lock().unwrap().push(record);
    }
}

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry.jitter = false;
    config
}

fn prompts(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn caching_options() -> ExecutionOptions {
    ExecutionOptions {
        cache_policy: Some(CachePolicy {
            respect_floor: false,
            ..CachePolicy::default()
        }),
        ..ExecutionOptions::default()
    }
}

fn cache_event(diagnostics: &[Value]) -> Value {
    events(diagnostics, "cache")[0].clone()
}

fn events<'a>(diagnostics: &'a [Value], event: &str) -> Vec<&'a Value> {
    diagnostics.iter().filter(|d| d["event"] == event).collect()
}

// =============================================================================
// Caching
// =============================================================================

#[tokio::test]
async fn shared_sources_are_cached_once_for_all_calls() {
    let mock = Arc::new(MockAdapter::new());
    let executor = Executor::with_adapter(config(), mock.clone()).unwrap();
    let options = ExecutionOptions {
        cache_policy: Some(CachePolicy {
            respect_floor: false,
            ..CachePolicy::default()
        }),
        ..ExecutionOptions::default()
    };
    let sources = vec![Source::text("first document"), Source::text("second document")];

    let command = executor
        .command(prompts(&["Q1", "Q2"]), sources.clone())
        .with_options(options.clone());
    let envelope = executor
        .execute(command, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(envelope.status, Status::Ok);
    assert_eq!(envelope.answers, vec!["echo: Q1", "echo: Q2"]);
    assert!(envelope.metrics.cache_used);
    assert_eq!(mock.cache_calls(), 1);
    let names: Vec<_> = envelope
        .metrics
        .per_call
        .iter()
        .map(|c| c.cache_name.clone())
        .collect();
    assert!(names[0].is_some());
    assert_eq!(names[0], names[1]);
    assert_eq!(events(&envelope.diagnostics, "cache")[0]["decision"], "created");

    // Same content again: registry hit, no new cache.
    let command = executor
        .command(prompts(&["Q3"]), sources)
        .with_options(options);
    let envelope = executor
        .execute(command, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(mock.cache_calls(), 1);
    assert_eq!(events(&envelope.diagnostics, "cache")[0]["decision"], "hit");
    assert_eq!(executor.cache_registry().len(), 1);
}

#[tokio::test]
async fn concurrent_runs_create_one_cache() {
    let mock = Arc::new(MockAdapter::new());
    let executor = Executor::with_adapter(config(), mock.clone()).unwrap();
    let options = ExecutionOptions {
        cache_policy: Some(CachePolicy {
            respect_floor: false,
            ..CachePolicy::default()
        }),
        ..ExecutionOptions::default()
    };
    let executor = &executor;
    let run = |prompt: &str| {
        let command = executor
            .command(prompts(&[prompt]), vec![Source::text("shared corpus")])
            .with_options(options.clone());
        async move { executor.execute(command, &CancellationToken::new()).await }
    };

    let (a, b, c) = tokio::join!(run("A"), run("B"), run("C"));
    for envelope in [a.unwrap(), b.unwrap(), c.unwrap()] {
        assert!(envelope.metrics.cache_used);
    }
    assert_eq!(mock.cache_calls(), 1);
}

#[tokio::test]
async fn small_context_stays_uncached_under_the_floor() {
    let mock = Arc::new(MockAdapter::new());
    let executor = Executor::with_adapter(config(), mock.clone()).unwrap();
    let command = executor
        .command(prompts(&["Q"]), vec![Source::text("tiny")])
        .with_options(ExecutionOptions {
            cache_policy: Some(CachePolicy::default()),
            ..ExecutionOptions::default()
        });

    let envelope = executor
        .execute(command, &CancellationToken::new())
        .await
        .unwrap();
    assert!(!envelope.metrics.cache_used);
    assert_eq!(mock.cache_calls(), 0);
    assert_eq!(
        events(&envelope.diagnostics, "cache")[0]["reason"],
        "below_token_floor"
    );
}

#[tokio::test]
async fn cache_override_applies_without_lookup() {
    let mock = Arc::new(MockAdapter::with_capabilities(Capabilities::text_only()));
    let executor = Executor::with_adapter(config(), mock.clone()).unwrap();
    let command = executor
        .command(prompts(&["Q1", "Q2"]), vec![Source::text("doc")])
        .with_options(ExecutionOptions {
            cache_override_name: Some("cachedContents/manual".into()),
            ..ExecutionOptions::default()
        });

    let envelope = executor
        .execute(command, &CancellationToken::new())
        .await
        .unwrap();
    assert!(envelope.metrics.cache_used);
    assert_eq!(mock.cache_calls(), 0);
    for call in &envelope.metrics.per_call {
        assert_eq!(call.cache_name.as_deref(), Some("cachedContents/manual"));
    }
}

#[tokio::test]
async fn oversized_files_stay_out_of_the_cache_payload() {
    let dir = tempfile::tempdir().unwrap();
    let big = dir.path().join("big.pdf");
    std::fs::File::create(&big)
        .unwrap()
        .set_len(INLINE_MAX_BYTES + 1)
        .unwrap();

    let adapter = Arc::new(RecordingAdapter::default());
    let executor = Executor::with_adapter(config(), adapter.clone()).unwrap();
    let command = executor
        .command(
            prompts(&["Q"]),
            vec![Source::text("small doc"), Source::file(&big).unwrap()],
        )
        .with_options(caching_options());

    let envelope = executor
        .execute(command, &CancellationToken::new())
        .await
        .unwrap();
    assert!(envelope.metrics.cache_used);

    let cached = adapter.cache_payloads.lock().unwrap().clone();
    assert_eq!(cached, vec![vec!["text:9".to_string()]]);

    // The large file travels with the call instead.
    let sent = adapter.generate_payloads.lock().unwrap().clone();
    assert_eq!(
        sent,
        vec![vec!["uploaded:files/big".to_string(), "text:1".to_string()]]
    );
}

#[tokio::test]
async fn reuse_only_never_creates_but_reuses() {
    let mock = Arc::new(MockAdapter::new());
    let executor = Executor::with_adapter(config(), mock.clone()).unwrap();
    let sources = vec![Source::text("corpus")];
    let reuse_only = ExecutionOptions {
        reuse_only: true,
        ..caching_options()
    };

    let cancel = CancellationToken::new();
    let (executor, sources, cancel) = (&executor, &sources, &cancel);
    let run = move |options: ExecutionOptions| {
        let command = executor
            .command(prompts(&["Q"]), sources.clone())
            .with_options(options);
        executor.execute(command, cancel)
    };

    let missed = run(reuse_only.clone()).await.unwrap();
    assert_eq!(cache_event(&missed.diagnostics)["reason"], "reuse_only");
    assert!(!missed.metrics.cache_used);
    assert_eq!(mock.cache_calls(), 0);

    run(caching_options()).await.unwrap();
    assert_eq!(mock.cache_calls(), 1);

    let reused = run(reuse_only).await.unwrap();
    assert_eq!(cache_event(&reused.diagnostics)["decision"], "hit");
    assert!(reused.metrics.cache_used);
    assert_eq!(mock.cache_calls(), 1);
}

#[tokio::test]
async fn disabled_caching_without_policy_skips() {
    let mock = Arc::new(MockAdapter::new());
    let mut cfg = config();
    cfg.enable_caching = false;
    let executor = Executor::with_adapter(cfg, mock.clone()).unwrap();
    let command = executor.command(prompts(&["Q"]), vec![Source::text("corpus")]);

    let envelope = executor
        .execute(command, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(cache_event(&envelope.diagnostics)["reason"], "caching_disabled");
    assert_eq!(mock.cache_calls(), 0);
}

#[tokio::test]
async fn first_turn_only_skips_once_history_exists() {
    let mock = Arc::new(MockAdapter::new());
    let executor = Executor::with_adapter(config(), mock.clone()).unwrap();
    let command = executor
        .command(prompts(&["Q"]), vec![Source::text("corpus")])
        .with_options(ExecutionOptions {
            history: vec![HistoryTurn::user("earlier question")],
            cache_policy: Some(CachePolicy {
                first_turn_only: true,
                respect_floor: false,
                ..CachePolicy::default()
            }),
            ..ExecutionOptions::default()
        });

    let envelope = executor
        .execute(command, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(cache_event(&envelope.diagnostics)["reason"], "not_first_turn");
    assert_eq!(mock.cache_calls(), 0);
}

#[tokio::test]
async fn adapter_without_caching_is_skipped() {
    let mock = Arc::new(MockAdapter::with_capabilities(Capabilities::text_only()));
    let executor = Executor::with_adapter(config(), mock.clone()).unwrap();
    let command = executor
        .command(prompts(&["Q"]), vec![Source::text("corpus")])
        .with_options(caching_options());

    let envelope = executor
        .execute(command, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        cache_event(&envelope.diagnostics)["reason"],
        "adapter_without_caching"
    );
    assert_eq!(mock.cache_calls(), 0);
}

#[tokio::test]
async fn unreadable_cache_payload_continues_uncached() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.txt");
    std::fs::write(&path, "field notes").unwrap();
    // Stats fine as a small entry but cannot be read as a file.
    let mut source = Source::file(&path).unwrap();
    source.identifier = dir.path().display().to_string();

    let mock = Arc::new(MockAdapter::new());
    let executor = Executor::with_adapter(config(), mock.clone()).unwrap();
    let command = executor
        .command(prompts(&["Q"]), vec![source])
        .with_options(caching_options());

    let envelope = executor
        .execute(command, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(cache_event(&envelope.diagnostics)["reason"], "creation_failed");
    assert!(!envelope.metrics.cache_used);
    assert_eq!(mock.cache_calls(), 0);
    assert_eq!(envelope.answers, vec!["echo: Q"]);
}

// =============================================================================
// Uploads
// =============================================================================

#[tokio::test]
async fn shared_file_is_uploaded_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.txt");
    std::fs::write(&path, "field notes").unwrap();

    let mock = Arc::new(MockAdapter::with_capabilities(Capabilities {
        uploads: true,
        ..Capabilities::text_only()
    }));
    let executor = Executor::with_adapter(config(), mock.clone()).unwrap();
    let command = executor.command(
        prompts(&["Q1", "Q2", "Q3"]),
        vec![Source::file(&path).unwrap()],
    );

    let envelope = executor
        .execute(command, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(envelope.answers.len(), 3);
    assert_eq!(mock.upload_calls(), 1);
    assert_eq!(mock.generate_calls(), 3);
    assert_eq!(executor.file_registry().len(), 1);
}

#[tokio::test]
async fn missing_file_fails_source_resolution() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gone.txt");
    std::fs::write(&path, "soon deleted").unwrap();
    let source = Source::file(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    let executor = Executor::new(config()).unwrap();
    let err = executor
        .execute(
            executor.command(prompts(&["Q"]), vec![source]),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.stage, StageName::SourceResolution);
    assert!(matches!(err.error, PipelineError::Source(_)));
}

// =============================================================================
// Failures, retries, fallback
// =============================================================================

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried() {
    let adapter = Arc::new(ScriptedAdapter::flaky(2));
    let executor = Executor::with_adapter(config(), adapter.clone()).unwrap();

    let envelope = executor
        .execute(
            executor.command(prompts(&["Q"]), Vec::new()),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(envelope.answers, vec!["answer to Q"]);
    assert_eq!(envelope.metrics.per_call[0].attempts, 3);
    assert_eq!(adapter.generate_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn constrained_plans_pace_every_request() {
    let mut cfg = config();
    cfg.use_real_api = true;
    cfg.api_key = Some("test-key".into());
    cfg.model = "gemini-2.5-flash".into();
    cfg.tier = "free".into();
    let executor = Executor::with_adapter(cfg, Arc::new(ScriptedAdapter::default())).unwrap();
    let started = Instant::now();

    let envelope = executor
        .execute(
            executor.command(prompts(&["Q1", "Q2", "Q3"]), Vec::new()),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    // Free tier allows 10 requests per minute: 6s between the three calls.
    assert!(started.elapsed() >= Duration::from_secs(12));
    assert!(envelope.metrics.durations["rate_limit_wait_ms"] >= 11_900);
    assert_eq!(envelope.answers.len(), 3);
}

#[tokio::test]
async fn non_retryable_primary_uses_fallback_once() {
    let adapter = Arc::new(ScriptedAdapter::rejecting(&["primary-model"]));
    let mut cfg = config();
    cfg.model = "primary-model".into();
    let executor = Executor::with_adapter(cfg, adapter.clone()).unwrap();
    let command = executor
        .command(prompts(&["Q1"]), vec![Source::text("ctx")])
        .with_options(ExecutionOptions {
            fallback_model: Some("backup-model".into()),
            ..ExecutionOptions::default()
        });

    let envelope = executor
        .execute(command, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(envelope.answers, vec!["answer to Q1"]);
    let call = &envelope.metrics.per_call[0];
    assert!(call.used_fallback);
    assert_eq!(call.model, "backup-model");

    let fallback = events(&envelope.diagnostics, "fallback");
    assert_eq!(fallback.len(), 1);
    assert_eq!(fallback[0]["used_fallback"], true);
    assert_eq!(fallback[0]["primary_error"]["code"], "provider_error");

    let seen = adapter.seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![("primary-model".to_string(), 2), ("backup-model".to_string(), 2)]
    );
}

#[tokio::test]
async fn failed_fallback_surfaces_primary_error() {
    let adapter = Arc::new(ScriptedAdapter::rejecting(&["primary-model", "backup-model"]));
    let mut cfg = config();
    cfg.model = "primary-model".into();
    let executor = Executor::with_adapter(cfg, adapter.clone()).unwrap();
    let command = executor
        .command(prompts(&["Q1", "Q2"]), Vec::new())
        .with_options(ExecutionOptions {
            fallback_model: Some("backup-model".into()),
            ..ExecutionOptions::default()
        });

    let err = executor
        .execute(command, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.stage, StageName::ApiInvocation);
    let api = err.error.as_api().unwrap();
    assert!(api.message.contains("primary-model"));
    assert!(api.call_index.is_some());
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_in_flight_calls() {
    let executor = Executor::with_adapter(config(), Arc::new(HangingAdapter)).unwrap();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let err = executor
        .execute(executor.command(prompts(&["Q1", "Q2"]), Vec::new()), &cancel)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(err.stage, StageName::ApiInvocation);
}

// =============================================================================
// Envelope
// =============================================================================

#[tokio::test]
async fn empty_answers_drive_status() {
    let executor =
        Executor::with_adapter(config(), Arc::new(ScriptedAdapter::default())).unwrap();

    let partial = executor
        .execute(
            executor.command(prompts(&["Q1", "blank Q2"]), Vec::new()),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(partial.status, Status::Partial);
    assert_eq!(partial.answers, vec!["answer to Q1", ""]);

    let error = executor
        .execute(
            executor.command(prompts(&["blank 1", "blank 2"]), Vec::new()),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(error.status, Status::Error);
    assert_eq!(error.to_json()["status"], "error");
}

#[tokio::test]
async fn structured_payloads_and_contract_diagnostics() {
    let executor =
        Executor::with_adapter(config(), Arc::new(ScriptedAdapter::default())).unwrap();
    let command = executor
        .command(prompts(&["score: abc", "plain"]), Vec::new())
        .with_options(ExecutionOptions {
            response_schema: Some(json!({"type": "object"})),
            contract: Some(ResultContract {
                required_fields: vec!["score".into()],
                ..ResultContract::default()
            }),
            ..ExecutionOptions::default()
        });

    let envelope = executor
        .execute(command, &CancellationToken::new())
        .await
        .unwrap();
    let structured = envelope.structured.clone().unwrap();
    assert_eq!(structured[0], json!({"score": 3}));
    assert_eq!(structured[1], Value::Null);

    let violations = events(&envelope.diagnostics, "contract_violation");
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0]["detail"]["index"], 1);
}

#[tokio::test]
async fn unsupported_settings_are_dropped_with_diagnostic() {
    let executor = Executor::with_adapter(
        config(),
        Arc::new(MockAdapter::with_capabilities(Capabilities::text_only())),
    )
    .unwrap();
    let command = executor
        .command(prompts(&["Q"]), Vec::new())
        .with_options(ExecutionOptions {
            reasoning_effort: Some("high".into()),
            ..ExecutionOptions::default()
        });

    let envelope = executor
        .execute(command, &CancellationToken::new())
        .await
        .unwrap();
    let dropped = events(&envelope.diagnostics, "capability_dropped");
    assert_eq!(dropped[0]["setting"], "reasoning_effort");
}

#[tokio::test]
async fn every_provider_call_is_recorded() {
    let sink = Arc::new(CollectingSink::default());
    let executor = Executor::new(config())
        .unwrap()
        .with_usage_sink(sink.clone());

    let envelope = executor
        .execute(
            executor.command(prompts(&["Q1", "Q2"]), Vec::new()),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let records = sink.records.lock().unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.phase == ApiPhase::Generate));
    let mut indices: Vec<_> = records.iter().filter_map(|r| r.call_index).collect();
    indices.sort();
    assert_eq!(indices, vec![0, 1]);

    let summed: u64 = envelope
        .metrics
        .per_call
        .iter()
        .map(|c| c.usage["total_tokens"])
        .sum();
    assert_eq!(envelope.usage["total_tokens"], summed);
}
