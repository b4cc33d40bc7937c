//! Provider adapter contract.
//!
//! One adapter is implemented per backend. The core consumes adapters only
//! through [`ProviderAdapter`] and its declared [`Capabilities`]; HTTP
//! transport lives entirely inside adapters.

pub mod error;
pub mod mock;
pub mod models;
pub mod types;
pub mod usage;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use error::{ApiError, ApiErrorKind, ApiPhase, ErrorContext};
pub use mock::MockAdapter;
pub use models::{model_profile, ModelProfile, TierLimits};
pub use types::*;
pub use usage::{NoopUsageSink, ProviderCallRecord, TracingUsageSink, UsageSink};

// =============================================================================
// TRAIT
// =============================================================================

/// A provider backend.
///
/// `upload` and `create_cache` are capability-gated: adapters that do not
/// declare the capability keep the default implementations, which report
/// [`ApiErrorKind::Unsupported`].
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider name used in errors, usage records and rate-limit keys.
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    async fn generate(
        &self,
        model: &str,
        parts: &[Part],
        config: &GenerationConfig,
    ) -> Result<GenerateResponse, ApiError>;

    async fn upload(&self, _path: &Path, _mime_type: &str) -> Result<FileRef, ApiError> {
        Err(ApiError::unsupported(self.name(), ApiPhase::Upload))
    }

    async fn create_cache(
        &self,
        _model: &str,
        _parts: &[Part],
        _system_instruction: Option<&str>,
        _ttl: Duration,
    ) -> Result<String, ApiError> {
        Err(ApiError::unsupported(self.name(), ApiPhase::Cache))
    }
}

// =============================================================================
// BLOCKING SDK OFF-LOADING
// =============================================================================

/// Synchronous provider binding (e.g. a blocking SDK client).
pub trait BlockingProvider: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    fn generate(
        &self,
        model: &str,
        parts: &[Part],
        config: &GenerationConfig,
    ) -> Result<GenerateResponse, ApiError>;

    fn upload(&self, _path: &Path, _mime_type: &str) -> Result<FileRef, ApiError> {
        Err(ApiError::unsupported(self.name(), ApiPhase::Upload))
    }

    fn create_cache(
        &self,
        _model: &str,
        _parts: &[Part],
        _system_instruction: Option<&str>,
        _ttl: Duration,
    ) -> Result<String, ApiError> {
        Err(ApiError::unsupported(self.name(), ApiPhase::Cache))
    }
}

/// Runs a [`BlockingProvider`] on the blocking thread pool so SDK calls
/// never stall the async scheduler.
pub struct BlockingAdapter<P: BlockingProvider> {
    inner: Arc<P>,
    name: String,
}

impl<P: BlockingProvider> BlockingAdapter<P> {
    pub fn new(inner: P) -> Self {
        let name = inner.name().to_string();
        Self {
            inner: Arc::new(inner),
            name,
        }
    }

    async fn off_load<T, F>(&self, phase: ApiPhase, f: F) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnOnce(&P) -> Result<T, ApiError> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(inner.as_ref()))
            .await
            .map_err(|e| ApiError::transport(&self.name, phase, format!("worker join error: {e}")))?
    }
}

#[async_trait]
impl<P: BlockingProvider> ProviderAdapter for BlockingAdapter<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    async fn generate(
        &self,
        model: &str,
        parts: &[Part],
        config: &GenerationConfig,
    ) -> Result<GenerateResponse, ApiError> {
        let model = model.to_string();
        let parts = parts.to_vec();
        let config = config.clone();
        self.off_load(ApiPhase::Generate, move |p| p.generate(&model, &parts, &config))
            .await
    }

    async fn upload(&self, path: &Path, mime_type: &str) -> Result<FileRef, ApiError> {
        let path = path.to_path_buf();
        let mime_type = mime_type.to_string();
        self.off_load(ApiPhase::Upload, move |p| p.upload(&path, &mime_type))
            .await
    }

    async fn create_cache(
        &self,
        model: &str,
        parts: &[Part],
        system_instruction: Option<&str>,
        ttl: Duration,
    ) -> Result<String, ApiError> {
        let model = model.to_string();
        let parts = parts.to_vec();
        let system_instruction = system_instruction.map(str::to_string);
        self.off_load(ApiPhase::Cache, move |p| {
            p.create_cache(&model, &parts, system_instruction.as_deref(), ttl)
        })
        .await
    }
}
