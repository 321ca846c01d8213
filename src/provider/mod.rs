pub mod claude;
pub mod gemini;

use async_trait::async_trait;

use crate::error::CoreError;

/// Sentinel lines prompts instruct the model to emit at the end of a
/// complete response. Their presence in a fragment is the only signal the
/// adapter trusts for truncation detection.
pub const EXTRACT_SENTINEL: &str = "✅ EXTRACTION_COMPLETE:";
pub const BOOST_SENTINEL: &str = "✅ BOOST_COMPLETE:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderName {
    GeminiVision,
    GeminiFile,
    ClaudeVision,
}

/// One page image, base64-encoded, as produced by the (out-of-scope)
/// rasterisation utility.
#[derive(Debug, Clone)]
pub struct PageImage {
    pub base64_data: String,
    pub mime_type: String,
}

/// What an `extract` call is given: one page image for the vision paths,
/// or the raw PDF bytes for the file-upload path.
#[derive(Debug, Clone)]
pub enum ExtractInput {
    Image(PageImage),
    FileUpload { pdf_bytes: Vec<u8> },
}

#[derive(Debug, Clone)]
pub struct ProviderOutput {
    pub text: String,
    pub tokens_used: u32,
    /// True iff a completion sentinel was observed on any fragment.
    pub is_complete: bool,
}

/// Uniform two-method interface over the LLM backends.
#[async_trait]
pub trait OcrProvider: Send + Sync {
    fn name(&self) -> ProviderName;

    fn accepts_file_upload(&self) -> bool {
        false
    }

    async fn extract(&self, input: &ExtractInput, prompt: &str) -> Result<ProviderOutput, CoreError>;

    async fn boost(&self, raw_text: &str, prompt: &str) -> Result<ProviderOutput, CoreError>;
}

/// Send a prompt repeatedly, appending a continuation prefix, until a
/// completion sentinel is observed or `max_attempts` is exhausted,
/// concatenating fragments in order. `send` performs one request and
/// returns `(text, tokens_used)` for that fragment; it does not see the
/// sentinel itself.
pub async fn complete_with_retry<F, Fut>(
    sentinel: &str,
    base_prompt: &str,
    max_attempts: u32,
    mut send: F,
) -> Result<ProviderOutput, CoreError>
where
    F: FnMut(String) -> Fut,
    Fut: std::future::Future<Output = Result<(String, u32), CoreError>>,
{
    let mut combined = String::new();
    let mut tokens_used = 0u32;
    let mut is_complete = false;

    for attempt in 0..max_attempts.max(1) {
        let prompt = if attempt == 0 {
            base_prompt.to_string()
        } else {
            format!(
                "{base_prompt}\n\nContinue exactly where the previous response left off. \
                 Previous output so far:\n{combined}"
            )
        };

        let (fragment, fragment_tokens) = send(prompt).await?;
        tokens_used += fragment_tokens;

        if !combined.is_empty() {
            combined.push('\n');
        }
        combined.push_str(&fragment);

        if fragment.contains(sentinel) {
            is_complete = true;
            break;
        }

        tracing::warn!(attempt, sentinel, "response missing completion sentinel, retrying with continuation");
    }

    Ok(ProviderOutput { text: combined, tokens_used, is_complete })
}
