use serde_json::json;
use std::time::Duration;

use crate::error::CoreError;
use crate::provider::{
    complete_with_retry, ExtractInput, OcrProvider, ProviderName, ProviderOutput, BOOST_SENTINEL,
    EXTRACT_SENTINEL,
};

const CLAUDE_API_BASE: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_OUTPUT_TOKENS: u32 = 8_192;

fn map_http_status(status: reqwest::StatusCode, body: &str) -> CoreError {
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        CoreError::ProviderAuth(body.to_string())
    } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        CoreError::ProviderRateLimited { retry_after: None }
    } else if status.is_server_error() {
        CoreError::ProviderTransient(format!("claude {status}: {body}"))
    } else {
        CoreError::ProviderInvalidInput(format!("claude {status}: {body}"))
    }
}

/// Claude-Vision path: one page image per call, same batching shape as
/// Gemini-Vision, used for index documents. Claude has no file-upload
/// analogue in this system, so it never handles acte documents directly.
pub struct ClaudeVisionProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    max_attempts: u32,
    api_base: String,
}

impl ClaudeVisionProvider {
    pub fn new(api_key: String, model: String, max_attempts: u32) -> Self {
        Self { client: reqwest::Client::new(), api_key, model, max_attempts, api_base: CLAUDE_API_BASE.to_string() }
    }

    #[cfg(test)]
    pub fn with_base_url(api_key: String, model: String, max_attempts: u32, api_base: String) -> Self {
        Self { client: reqwest::Client::new(), api_key, model, max_attempts, api_base }
    }

    async fn send_message(&self, content: Vec<serde_json::Value>, prompt: String) -> Result<(String, u32), CoreError> {
        let mut blocks = vec![json!({ "type": "text", "text": prompt })];
        blocks.extend(content);

        let body = json!({
            "model": self.model,
            "max_tokens": MAX_OUTPUT_TOKENS,
            "messages": [{ "role": "user", "content": blocks }],
        });

        let response = self
            .client
            .post(&self.api_base)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .timeout(Duration::from_secs(60))
            .send()
            .await
            .map_err(|e| if e.is_timeout() { CoreError::ProviderTimeout } else { CoreError::ProviderTransient(e.to_string()) })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(map_http_status(status, &text));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CoreError::ProviderTransient(format!("invalid claude response: {e}")))?;

        let text = payload["content"][0]["text"].as_str().unwrap_or_default().to_string();
        let tokens = payload["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32
            + payload["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32;

        Ok((text, tokens))
    }
}

#[async_trait::async_trait]
impl OcrProvider for ClaudeVisionProvider {
    fn name(&self) -> ProviderName {
        ProviderName::ClaudeVision
    }

    async fn extract(&self, input: &ExtractInput, prompt: &str) -> Result<ProviderOutput, CoreError> {
        let ExtractInput::Image(image) = input else {
            return Err(CoreError::ProviderInvalidInput("claude-vision requires an image input".into()));
        };

        let image_block = json!({
            "type": "image",
            "source": {
                "type": "base64",
                "media_type": image.mime_type,
                "data": image.base64_data,
            }
        });

        complete_with_retry(EXTRACT_SENTINEL, prompt, self.max_attempts, |p| {
            self.send_message(vec![image_block.clone()], p)
        })
        .await
    }

    async fn boost(&self, raw_text: &str, prompt: &str) -> Result<ProviderOutput, CoreError> {
        let full_prompt = format!("{prompt}\n\n{raw_text}");
        complete_with_retry(BOOST_SENTINEL, &full_prompt, self.max_attempts, |p| self.send_message(vec![], p)).await
    }
}
