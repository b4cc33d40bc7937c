//! Remote materialization stage.
//!
//! Downloads eligible remote references (PDF links, arXiv abstract pages)
//! into local files so the invocation stage can upload them like any other
//! file. Off unless enabled. Every URL is downloaded at most once per wave
//! through the single-flight coordinator.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::command::{ApiCall, ExecutionPlan};
use crate::error::PipelineError;
use crate::gateway::{ApiError, ApiPhase, Part};
use crate::registry::Registry;
use crate::single_flight::SingleFlight;
use crate::source::canonical_arxiv_pdf;

const PDF_MAGIC: &[u8] = b"%PDF-";

// =============================================================================
// POLICY
// =============================================================================

/// Which parts are scanned for remote references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterializeScope {
    SharedOnly,
    AllParts,
}

/// What a failed download does to the stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadFailure {
    /// Keep the original remote reference.
    Skip,
    /// Fail the whole stage.
    Fail,
}

/// Remote materialization settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteFilePolicy {
    pub enabled: bool,
    pub scope: MaterializeScope,
    pub allowed_mime_types: Vec<String>,
    pub max_bytes: u64,
    /// Allow plain `http://` in addition to `https://`.
    pub allow_http: bool,
    pub on_failure: DownloadFailure,
    pub concurrency: usize,
    pub timeout_seconds: u64,
    /// Where downloads are written. When unset, a scratch directory owned by
    /// the executor and removed when it is dropped.
    pub download_dir: Option<PathBuf>,
}

impl Default for RemoteFilePolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            scope: MaterializeScope::SharedOnly,
            allowed_mime_types: vec!["application/pdf".to_string()],
            max_bytes: 50 * 1024 * 1024,
            allow_http: false,
            on_failure: DownloadFailure::Skip,
            concurrency: 4,
            timeout_seconds: 60,
            download_dir: None,
        }
    }
}

impl RemoteFilePolicy {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.max_bytes == 0 {
            return Err(PipelineError::configuration(
                "remote_files.max_bytes must be positive",
            ));
        }
        if self.concurrency == 0 {
            return Err(PipelineError::configuration(
                "remote_files.concurrency must be at least 1",
            ));
        }
        Ok(())
    }

    fn allows_mime(&self, mime: &str) -> bool {
        self.allowed_mime_types
            .iter()
            .any(|m| m.eq_ignore_ascii_case(mime))
    }

    /// Canonical download URL for a part, if it qualifies.
    pub fn eligible_url(&self, part: &Part) -> Option<String> {
        let Part::Uri { uri, mime_type } = part else {
            return None;
        };
        if let Some(pdf) = canonical_arxiv_pdf(uri) {
            return Some(pdf);
        }
        let url = Url::parse(uri).ok()?;
        let looks_pdf = url.path().to_ascii_lowercase().ends_with(".pdf");
        (self.allows_mime(mime_type) || looks_pdf).then(|| url.to_string())
    }
}

// =============================================================================
// FETCHER
// =============================================================================

/// Downloaded bytes plus the server's declared content type.
#[derive(Debug, Clone)]
pub struct Download {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Fetches remote bytes with a size ceiling.
#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    async fn fetch(&self, url: &Url, max_bytes: u64) -> Result<Download, ApiError>;
}

/// `reqwest`-backed fetcher.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::configuration(format!("http client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RemoteFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url, max_bytes: u64) -> Result<Download, ApiError> {
        let mut response = self.client.get(url.clone()).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::from_status(
                "http",
                ApiPhase::Download,
                status.as_u16(),
                format!("GET {url} returned {status}"),
            ));
        }
        if let Some(len) = response.content_length() {
            if len > max_bytes {
                return Err(too_large(len, max_bytes));
            }
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_ascii_lowercase());

        // Stream the body to enforce the ceiling without trusting headers.
        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            let new_len = (bytes.len() + chunk.len()) as u64;
            if new_len > max_bytes {
                return Err(too_large(new_len, max_bytes));
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok(Download {
            bytes,
            content_type,
        })
    }
}

fn too_large(len: u64, max_bytes: u64) -> ApiError {
    ApiError::provider(
        "http",
        ApiPhase::Download,
        format!("download too large: {len} bytes (max {max_bytes})"),
        false,
    )
}

// =============================================================================
// STAGE
// =============================================================================

/// Result of one materialization pass.
#[derive(Debug, Clone, Default)]
pub struct MaterializeReport {
    pub downloaded: usize,
    pub diagnostics: Vec<serde_json::Value>,
}

/// Remote materialization stage, owned by one executor.
///
/// Downloads into the default scratch directory live as long as the
/// materializer; the registry entries pointing at them go with it.
pub struct Materializer {
    fetcher: Arc<dyn RemoteFetcher>,
    flights: SingleFlight<PathBuf>,
    scratch: Mutex<Option<tempfile::TempDir>>,
}

impl Materializer {
    pub fn new(fetcher: Arc<dyn RemoteFetcher>) -> Self {
        Self {
            fetcher,
            flights: SingleFlight::new(Arc::new(Registry::new())),
            scratch: Mutex::new(None),
        }
    }

    fn download_dir(&self, policy: &RemoteFilePolicy) -> Result<PathBuf, PipelineError> {
        if let Some(dir) = &policy.download_dir {
            return Ok(dir.clone());
        }
        let mut scratch = self.scratch.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(dir) = scratch.as_ref() {
            return Ok(dir.path().to_path_buf());
        }
        let dir = tempfile::Builder::new()
            .prefix("batchline-downloads-")
            .tempdir()
            .map_err(|e| PipelineError::source(format!("cannot create download dir: {e}")))?;
        let path = dir.path().to_path_buf();
        *scratch = Some(dir);
        Ok(path)
    }

    /// Downloads completed so far, keyed by canonical URL.
    pub fn registry(&self) -> &Arc<Registry<PathBuf>> {
        self.flights.registry()
    }

    /// Rewrite eligible URI parts of `plan` into local file parts.
    pub async fn run(
        &self,
        plan: ExecutionPlan,
        policy: &RemoteFilePolicy,
        cancel: &CancellationToken,
    ) -> Result<(ExecutionPlan, MaterializeReport), PipelineError> {
        let mut report = MaterializeReport::default();
        if !policy.enabled {
            return Ok((plan, report));
        }

        let mut urls = BTreeSet::new();
        let scan = |parts: &[Part], urls: &mut BTreeSet<String>| {
            urls.extend(parts.iter().filter_map(|p| policy.eligible_url(p)));
        };
        scan(&plan.shared_parts, &mut urls);
        if policy.scope == MaterializeScope::AllParts {
            for call in plan.calls() {
                scan(&call.parts, &mut urls);
            }
        }
        if urls.is_empty() {
            return Ok((plan, report));
        }

        let results: Vec<(String, Result<PathBuf, PipelineError>)> = stream::iter(urls)
            .map(|url| async move {
                let result = self
                    .flights
                    .run(&url, None, cancel, || self.download(&url, policy))
                    .await;
                (url, result)
            })
            .buffer_unordered(policy.concurrency.max(1))
            .collect()
            .await;

        let mut local: HashMap<String, PathBuf> = HashMap::new();
        for (url, result) in results {
            match result {
                Ok(path) => {
                    report.downloaded += 1;
                    local.insert(url, path);
                }
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(e) if policy.on_failure == DownloadFailure::Fail => return Err(e),
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "remote download skipped");
                    report.diagnostics.push(json!({
                        "event": "download_skipped",
                        "url": url,
                        "error": e.to_string(),
                    }));
                }
            }
        }

        let rewrite = |part: Part| -> Part {
            match policy.eligible_url(&part).and_then(|url| local.get(&url)) {
                Some(path) => Part::file(
                    path.clone(),
                    mime_guess::from_path(path).first_or_octet_stream().essence_str(),
                ),
                None => part,
            }
        };
        let mut plan = plan;
        plan.shared_parts = plan.shared_parts.into_iter().map(rewrite).collect();
        if policy.scope == MaterializeScope::AllParts {
            plan = plan.map_calls(|call| ApiCall {
                parts: call.parts.into_iter().map(rewrite).collect(),
                ..call
            });
        }
        Ok((plan, report))
    }

    async fn download(&self, url: &str, policy: &RemoteFilePolicy) -> Result<PathBuf, PipelineError> {
        let parsed = Url::parse(url)
            .map_err(|e| PipelineError::source(format!("invalid url {url}: {e}")))?;
        match parsed.scheme() {
            "https" => {}
            "http" if policy.allow_http => {}
            scheme => {
                return Err(PipelineError::source(format!(
                    "scheme {scheme} not allowed for {url}"
                )))
            }
        }

        let download = self.fetcher.fetch(&parsed, policy.max_bytes).await?;
        // PDFs are recognized by magic bytes; other allow-listed types must
        // be declared by the server.
        let mime = if download.bytes.starts_with(PDF_MAGIC) {
            "application/pdf".to_string()
        } else {
            match download.content_type {
                Some(ct) if ct != "application/pdf" && policy.allows_mime(&ct) => ct,
                other => {
                    return Err(PipelineError::source(format!(
                        "{url}: content type {} not allowed",
                        other.as_deref().unwrap_or("unknown")
                    )))
                }
            }
        };
        let ext = mime_guess::get_mime_extensions_str(&mime)
            .and_then(|exts| exts.first())
            .copied()
            .unwrap_or("bin");

        let dir = self.download_dir(policy)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| PipelineError::source(format!("cannot create {}: {e}", dir.display())))?;
        let hash = blake3::hash(url.as_bytes()).to_hex();
        let path = dir.join(format!("{}.{ext}", &hash[..16]));
        tokio::fs::write(&path, &download.bytes)
            .await
            .map_err(|e| PipelineError::source(format!("cannot write {}: {e}", path.display())))?;

        tracing::info!(
            url = %url,
            mime = %mime,
            bytes = download.bytes.len(),
            path = %path.display(),
            "remote file materialized"
        );
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eligibility_rules() {
        let policy = RemoteFilePolicy::default();
        let pdf = Part::uri("https://example.com/paper.PDF", "application/octet-stream");
        assert_eq!(
            policy.eligible_url(&pdf).as_deref(),
            Some("https://example.com/paper.PDF")
        );

        let abs = Part::uri("https://arxiv.org/abs/2401.01234", "text/html");
        assert_eq!(
            policy.eligible_url(&abs).as_deref(),
            Some("https://arxiv.org/pdf/2401.01234")
        );

        let video = Part::uri("https://youtu.be/dQw4w9WgXcQ", "video/mp4");
        assert!(policy.eligible_url(&video).is_none());
        assert!(policy.eligible_url(&Part::text("https://x/y.pdf")).is_none());
    }

    #[test]
    fn zero_ceiling_is_rejected() {
        let policy = RemoteFilePolicy {
            max_bytes: 0,
            ..RemoteFilePolicy::default()
        };
        assert!(policy.validate().is_err());
    }

    struct StaticFetcher;

    #[async_trait]
    impl RemoteFetcher for StaticFetcher {
        async fn fetch(&self, _url: &Url, _max_bytes: u64) -> Result<Download, ApiError> {
            Ok(Download {
                bytes: b"%PDF-1.4 test".to_vec(),
                content_type: Some("application/pdf".to_string()),
            })
        }
    }

    #[tokio::test]
    async fn scratch_downloads_are_removed_with_the_materializer() {
        use crate::gateway::GenerationConfig;

        let materializer = Materializer::new(Arc::new(StaticFetcher));
        let plan = ExecutionPlan::new(
            vec![ApiCall::new("m", "Q", GenerationConfig::default())],
            vec![Part::uri("https://example.com/paper.pdf", "application/pdf")],
        )
        .unwrap();
        let policy = RemoteFilePolicy {
            enabled: true,
            ..RemoteFilePolicy::default()
        };

        let (plan, report) = materializer
            .run(plan, &policy, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.downloaded, 1);
        let Part::File { path, .. } = &plan.shared_parts[0] else {
            panic!("expected a local file part");
        };
        assert!(path.exists());

        drop(materializer);
        assert!(!path.exists());
    }
}
