use futures::stream::{self, StreamExt, TryStreamExt};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::config::{PreferredProvider, ProviderConfig};
use crate::db::Database;
use crate::dispatcher::ClaimedJob;
use crate::error::{CoreError, RetryKind};
use crate::models::DocumentSource;
use crate::provider::{ExtractInput, OcrProvider, ProviderName, ProviderOutput};
use crate::rasterizer::Rasterizer;
use crate::rate_limiter::RateLimiter;
use crate::sanitiser::Sanitiser;
use crate::scratch::ScratchFile;
use crate::storage::{resolve_storage_key, BlobStorage};

/// Estimated prompt + page tokens used to pre-check the rate limiter
/// before a call is made; corrected afterwards from the provider's
/// reported usage.
const ESTIMATED_TOKENS_PER_CALL: u64 = 4_000;

/// Bounded wait for rate-limiter admission before giving up and surfacing
/// a retryable error to the caller.
const RATE_LIMIT_MAX_WAIT: Duration = Duration::from_secs(30);
const RATE_LIMIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct ProviderBundle {
    pub preferred: PreferredProvider,
    pub gemini_vision: Option<Arc<dyn OcrProvider>>,
    pub claude_vision: Option<Arc<dyn OcrProvider>>,
    pub gemini_file: Option<Arc<dyn OcrProvider>>,
}

impl ProviderBundle {
    /// Vision providers in preference order, skipping any not configured.
    fn vision_order(&self) -> Vec<&Arc<dyn OcrProvider>> {
        let (first, second) = match self.preferred {
            PreferredProvider::Gemini => (&self.gemini_vision, &self.claude_vision),
            PreferredProvider::Claude => (&self.claude_vision, &self.gemini_vision),
        };
        [first, second].into_iter().flatten().collect()
    }
}

pub struct Pipeline {
    storage: Arc<dyn BlobStorage>,
    rasterizer: Arc<dyn Rasterizer>,
    sanitiser: Arc<dyn Sanitiser>,
    providers: ProviderBundle,
    prompts: ProviderConfig,
    rate_limiter: Arc<Mutex<RateLimiter>>,
}

impl Pipeline {
    pub fn new(
        storage: Arc<dyn BlobStorage>,
        rasterizer: Arc<dyn Rasterizer>,
        sanitiser: Arc<dyn Sanitiser>,
        providers: ProviderBundle,
        prompts: ProviderConfig,
        rate_limiter: Arc<Mutex<RateLimiter>>,
    ) -> Self {
        Self { storage, rasterizer, sanitiser, providers, prompts, rate_limiter }
    }

    /// Blocks until the rate limiter admits a call for `provider`, or
    /// returns a retryable error once `RATE_LIMIT_MAX_WAIT` has elapsed.
    async fn gate(&self, provider: ProviderName) -> Result<(), CoreError> {
        let deadline = tokio::time::Instant::now() + RATE_LIMIT_MAX_WAIT;
        loop {
            {
                let mut limiter = self.rate_limiter.lock().await;
                if limiter.try_acquire(provider, ESTIMATED_TOKENS_PER_CALL).await {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CoreError::RateLimited { retry_after: RATE_LIMIT_POLL_INTERVAL });
            }
            tokio::time::sleep(RATE_LIMIT_POLL_INTERVAL).await;
        }
    }

    async fn record_usage(&self, provider: ProviderName, actual_tokens: u32) {
        let mut limiter = self.rate_limiter.lock().await;
        limiter.record_actual_tokens(provider, actual_tokens as u64, ESTIMATED_TOKENS_PER_CALL).await;
    }

    /// Runs the full extract-boost-persist sequence for one claimed job.
    /// On failure, classifies the error and applies the
    /// appropriate recovery action to the row itself; only a database
    /// error while doing so is propagated to the caller.
    pub async fn process(&self, db: &Database, claimed: &ClaimedJob, scratch_dir: &Path) -> Result<(), CoreError> {
        let ClaimedJob { environment, job } = claimed;

        let Some(source) = job.document_source() else {
            return db
                .mark_failed(*environment, job.id, true, &format!("unrecognised document_source '{}'", job.document_source))
                .await;
        };

        if source == DocumentSource::PlanCadastraux {
            return db.mark_skipped_complete(*environment, job.id).await;
        }

        match self.extract_and_boost(source, job, scratch_dir).await {
            Ok((raw_text, boosted_text)) => {
                // file_content keeps the raw, unboosted extraction text as
                // an audit trail; boosted_file_content carries the boosted
                // text, passed through the sanitiser when enabled (see
                // SPEC_FULL.md §4's resolution of the duplication Open
                // Question).
                let sanitised = self.sanitiser.sanitise(&boosted_text);
                db.mark_extraction_complete(*environment, job.id, &raw_text, &sanitised).await
            }
            Err(err) => {
                // Every retry_kind ends up here the same way: both providers
                // (or the rate limiter) were unavailable this attempt, or the
                // error is outright terminal. Either way the row reverts to
                // COMPLETE for another pass unless attempts are exhausted.
                tracing::warn!(job_id = %job.id, error = %err, retry_kind = ?err.retry_kind(), "extraction failed");
                db.mark_failed(*environment, job.id, job.attempts_exhausted(), &err.to_string()).await
            }
        }
    }

    async fn extract_and_boost(
        &self,
        source: DocumentSource,
        job: &crate::models::Job,
        scratch_dir: &Path,
    ) -> Result<(String, String), CoreError> {
        let bucket_key = resolve_storage_key(&job.supabase_path, source);
        let bytes = self.storage.download(source.bucket(), &bucket_key).await?;
        // Held for the rest of this call and deleted on drop -- including
        // on early return via `?` below -- regardless of outcome.
        let _scratch = ScratchFile::write(scratch_dir, job.id, &bytes)?;

        let (extract_prompt, boost_prompt) = match source {
            DocumentSource::Index => (&self.prompts.extract_prompt_index, &self.prompts.boost_prompt_index),
            DocumentSource::Acte => (&self.prompts.extract_prompt_acte, &self.prompts.boost_prompt_acte),
            DocumentSource::PlanCadastraux => unreachable!("plan_cadastraux is skipped before extraction"),
        };

        let raw_text = match source {
            DocumentSource::Index => self.extract_index(&bytes, extract_prompt).await?,
            DocumentSource::Acte => self.extract_acte(bytes, extract_prompt).await?,
            DocumentSource::PlanCadastraux => unreachable!(),
        };

        let boosted = match source {
            DocumentSource::Index => self.boost(&raw_text, boost_prompt).await?,
            DocumentSource::Acte => self.boost_acte(&raw_text, boost_prompt).await?,
            DocumentSource::PlanCadastraux => unreachable!(),
        };
        Ok((raw_text, boosted.text))
    }

    /// Gemini-Vision / Claude-Vision path: rasterize, extract every page
    /// concurrently (bounded by the page count itself, per §4.2 step 4),
    /// then concatenate in page order regardless of completion order. A
    /// page-level failure on the preferred provider falls through to the
    /// other vision provider before failing the whole document.
    async fn extract_index(&self, pdf_bytes: &[u8], prompt: &str) -> Result<String, CoreError> {
        let pages = self.rasterizer.rasterize(pdf_bytes)?;
        let concurrency = pages.len().max(1);

        let texts: Vec<String> = stream::iter(pages.into_iter())
            .map(|page| async move { self.extract_with_fallback(&ExtractInput::Image(page), prompt).await })
            .buffered(concurrency)
            .try_collect()
            .await?;

        let blocks: Vec<String> = texts
            .into_iter()
            .enumerate()
            .map(|(i, text)| format!("\n\n--- Page {} ---\n\n{}", i + 1, text))
            .collect();
        Ok(blocks.join("\n"))
    }

    /// Gemini-File path: acte documents go through file upload
    /// directly, no rasterisation step.
    async fn extract_acte(&self, pdf_bytes: Vec<u8>, prompt: &str) -> Result<String, CoreError> {
        let provider = self
            .providers
            .gemini_file
            .as_ref()
            .ok_or_else(|| CoreError::ProviderInvalidInput("no file-upload provider configured for acte documents".into()))?;

        self.gate(provider.name()).await?;
        let output = provider.extract(&ExtractInput::FileUpload { pdf_bytes }, prompt).await?;
        self.record_usage(provider.name(), output.tokens_used).await;
        Ok(output.text)
    }

    /// Acte boost, restricted to the file-capable provider with no
    /// fallback -- unlike the vision path, there is no second provider
    /// that can boost from an acte's raw text (spec §4.2: "For the acte
    /// path, only the file-capable provider ... is used; no fallback").
    async fn boost_acte(&self, raw_text: &str, prompt: &str) -> Result<ProviderOutput, CoreError> {
        let provider = self
            .providers
            .gemini_file
            .as_ref()
            .ok_or_else(|| CoreError::ProviderInvalidInput("no file-upload provider configured for acte documents".into()))?;

        self.gate(provider.name()).await?;
        let output = provider.boost(raw_text, prompt).await?;
        self.record_usage(provider.name(), output.tokens_used).await;
        Ok(output)
    }

    async fn extract_with_fallback(&self, input: &ExtractInput, prompt: &str) -> Result<String, CoreError> {
        let mut last_err = None;
        for provider in self.providers.vision_order() {
            self.gate(provider.name()).await?;
            match provider.extract(input, prompt).await {
                Ok(output) => {
                    self.record_usage(provider.name(), output.tokens_used).await;
                    return Ok(output.text);
                }
                Err(e) if e.retry_kind() == RetryKind::FallbackProvider => {
                    tracing::warn!(provider = ?provider.name(), error = %e, "provider failed, trying fallback");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| CoreError::ProviderInvalidInput("no vision provider configured".into())))
    }

    async fn boost(&self, raw_text: &str, prompt: &str) -> Result<ProviderOutput, CoreError> {
        let mut last_err = None;
        for provider in self.providers.vision_order() {
            self.gate(provider.name()).await?;
            match provider.boost(raw_text, prompt).await {
                Ok(output) => {
                    self.record_usage(provider.name(), output.tokens_used).await;
                    return Ok(output);
                }
                Err(e) if e.retry_kind() == RetryKind::FallbackProvider => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| CoreError::ProviderInvalidInput("no provider configured for boost".into())))
    }
}
