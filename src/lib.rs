#![forbid(unsafe_code)]

//! # batchline
//!
//! Batch execution of prompts against LLM provider APIs, without paying
//! twice for the same work.
//!
//! Callers submit prompts plus optional shared content (text, local files,
//! URLs, YouTube videos, arXiv papers). The engine plans one provider call
//! per prompt, downloads eligible remote files, waits on a dual
//! request/token rate limiter, puts the shared context in a provider-side
//! cache at most once per content identity, uploads each file at most once,
//! retries transient failures, and reduces whatever came back into a single
//! [`ResponseEnvelope`].
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use batchline::{EngineConfig, Executor, Source};
//! use tokio_util::sync::CancellationToken;
//!
//! let executor = Executor::new(EngineConfig::default())?;
//! let command = executor.command(
//!     vec!["Summarize the paper".into(), "List its datasets".into()],
//!     vec![Source::arxiv("2401.00001")?],
//! );
//! let envelope = executor.execute(command, &CancellationToken::new()).await?;
//! println!("{}", envelope.to_json());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod cache_stage;
pub mod command;
pub mod config;
pub mod envelope;
pub mod error;
pub mod extract;
pub mod gateway;
pub mod invoke;
pub mod materialize;
pub mod pipeline;
pub mod planner;
pub mod rate_limit;
pub mod registry;
pub mod retry;
pub mod single_flight;
pub mod source;
pub mod tokens;

pub use cache::CacheIdentityKey;
pub use cache_stage::CacheDecision;
pub use command::{
    ApiCall, CachePolicy, ExecutionOptions, ExecutionPlan, HistoryTurn, InitialCommand,
    ResultContract,
};
pub use config::EngineConfig;
pub use envelope::{ResponseEnvelope, Status};
pub use error::{ExecutionError, PipelineError, StageName};
pub use extract::{ResultReducer, Transform};
pub use gateway::{
    ApiError, ApiErrorKind, ApiPhase, Capabilities, MockAdapter, ProviderAdapter, UsageSink,
};
pub use materialize::{RemoteFetcher, RemoteFilePolicy};
pub use pipeline::{Executor, PassthroughResolver, SourceResolver};
pub use rate_limit::RateConstraint;
pub use retry::RetryPolicy;
pub use single_flight::SingleFlight;
pub use source::{Source, SourceKind};
pub use tokens::TokenEstimate;
