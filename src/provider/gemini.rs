use base64ct::{Base64, Encoding};
use serde_json::json;
use std::time::Duration;
use tokio::time::sleep;

use crate::error::CoreError;
use crate::provider::{
    complete_with_retry, ExtractInput, OcrProvider, ProviderName, ProviderOutput, BOOST_SENTINEL,
    EXTRACT_SENTINEL,
};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const FILE_UPLOAD_POLL_INTERVAL: Duration = Duration::from_secs(2);
const FILE_UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Max output tokens by model family.
fn max_output_tokens(model: &str) -> u32 {
    if model.contains("2.5-pro") || model.contains("2-pro") {
        65_000
    } else if model.contains("pro") {
        32_000
    } else {
        8_000
    }
}

fn map_http_status(status: reqwest::StatusCode, body: &str) -> CoreError {
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        CoreError::ProviderAuth(body.to_string())
    } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        CoreError::ProviderRateLimited { retry_after: None }
    } else if status.is_server_error() {
        CoreError::ProviderTransient(format!("gemini {status}: {body}"))
    } else {
        CoreError::ProviderInvalidInput(format!("gemini {status}: {body}"))
    }
}

/// Gemini-Vision path: one image per call, used for index documents.
pub struct GeminiVisionProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    max_attempts: u32,
    api_base: String,
}

impl GeminiVisionProvider {
    pub fn new(api_key: String, model: String, max_attempts: u32) -> Self {
        Self { client: reqwest::Client::new(), api_key, model, max_attempts, api_base: GEMINI_API_BASE.to_string() }
    }

    #[cfg(test)]
    pub fn with_base_url(api_key: String, model: String, max_attempts: u32, api_base: String) -> Self {
        Self { client: reqwest::Client::new(), api_key, model, max_attempts, api_base }
    }

    async fn generate_content(&self, parts: Vec<serde_json::Value>, prompt: String) -> Result<(String, u32), CoreError> {
        let mut all_parts = vec![json!({ "text": prompt })];
        all_parts.extend(parts);

        let url = format!("{}/models/{}:generateContent?key={}", self.api_base, self.model, self.api_key);
        let body = json!({
            "contents": [{ "parts": all_parts }],
            "generationConfig": { "maxOutputTokens": max_output_tokens(&self.model) },
        });

        let response = self
            .client
            .post(&url)
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
            .map_err(|e| CoreError::ProviderTransient(format!("invalid gemini response: {e}")))?;

        let text = payload["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let tokens = payload["usageMetadata"]["totalTokenCount"].as_u64().unwrap_or(0) as u32;

        Ok((text, tokens))
    }
}

#[async_trait::async_trait]
impl OcrProvider for GeminiVisionProvider {
    fn name(&self) -> ProviderName {
        ProviderName::GeminiVision
    }

    async fn extract(&self, input: &ExtractInput, prompt: &str) -> Result<ProviderOutput, CoreError> {
        let ExtractInput::Image(image) = input else {
            return Err(CoreError::ProviderInvalidInput("gemini-vision requires an image input".into()));
        };

        let image_part = json!({
            "inline_data": { "mime_type": image.mime_type, "data": image.base64_data }
        });

        complete_with_retry(EXTRACT_SENTINEL, prompt, self.max_attempts, |p| {
            self.generate_content(vec![image_part.clone()], p)
        })
        .await
    }

    async fn boost(&self, raw_text: &str, prompt: &str) -> Result<ProviderOutput, CoreError> {
        let full_prompt = format!("{prompt}\n\n{raw_text}");
        complete_with_retry(BOOST_SENTINEL, &full_prompt, self.max_attempts, |p| self.generate_content(vec![], p)).await
    }
}

/// Gemini-File path: upload the PDF, poll until ACTIVE, pass the file
/// handle with the prompt, delete the handle best-effort afterwards. Used
/// for acte documents.
pub struct GeminiFileProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    max_attempts: u32,
    api_base: String,
}

impl GeminiFileProvider {
    pub fn new(api_key: String, model: String, max_attempts: u32) -> Self {
        Self { client: reqwest::Client::new(), api_key, model, max_attempts, api_base: GEMINI_API_BASE.to_string() }
    }

    #[cfg(test)]
    pub fn with_base_url(api_key: String, model: String, max_attempts: u32, api_base: String) -> Self {
        Self { client: reqwest::Client::new(), api_key, model, max_attempts, api_base }
    }

    async fn upload_file(&self, pdf_bytes: &[u8]) -> Result<String, CoreError> {
        let url = format!("{}/files?key={}", self.api_base, self.api_key);
        let part = reqwest::multipart::Part::bytes(pdf_bytes.to_vec())
            .mime_str("application/pdf")
            .map_err(|e| CoreError::ProviderInvalidInput(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(&url)
            .multipart(form)
            .timeout(Duration::from_secs(60))
            .send()
            .await
            .map_err(|e| CoreError::ProviderTransient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(map_http_status(status, &text));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CoreError::ProviderTransient(format!("invalid gemini upload response: {e}")))?;

        payload["file"]["name"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| CoreError::ProviderTransient("gemini upload response missing file name".into()))
    }

    /// Poll the file's state until `ACTIVE`, bounded by `FILE_UPLOAD_TIMEOUT`.
    async fn await_active(&self, file_name: &str) -> Result<(), CoreError> {
        let deadline = tokio::time::Instant::now() + FILE_UPLOAD_TIMEOUT;
        loop {
            let url = format!("{}/{file_name}?key={}", self.api_base, self.api_key);
            let response = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| CoreError::ProviderTransient(e.to_string()))?;
            let payload: serde_json::Value = response
                .json()
                .await
                .map_err(|e| CoreError::ProviderTransient(format!("invalid gemini file-status response: {e}")))?;

            match payload["state"].as_str() {
                Some("ACTIVE") => return Ok(()),
                Some("FAILED") => return Err(CoreError::ProviderTransient("gemini file processing failed".into())),
                _ => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(CoreError::ProviderTimeout);
                    }
                    sleep(FILE_UPLOAD_POLL_INTERVAL).await;
                }
            }
        }
    }

    /// Best-effort deletion; failure is logged, never propagated.
    async fn delete_file(&self, file_name: &str) {
        let url = format!("{}/{file_name}?key={}", self.api_base, self.api_key);
        if let Err(e) = self.client.delete(&url).send().await {
            tracing::warn!(file_name, error = %e, "failed to delete gemini file handle (ignored)");
        }
    }

    async fn generate_with_handle(&self, file_name: &str, prompt: String) -> Result<(String, u32), CoreError> {
        let url = format!("{}/models/{}:generateContent?key={}", self.api_base, self.model, self.api_key);
        let body = json!({
            "contents": [{
                "parts": [
                    { "text": prompt },
                    { "file_data": { "mime_type": "application/pdf", "file_uri": file_name } }
                ]
            }],
            "generationConfig": { "maxOutputTokens": max_output_tokens(&self.model) },
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .timeout(Duration::from_secs(120))
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
            .map_err(|e| CoreError::ProviderTransient(format!("invalid gemini response: {e}")))?;

        let text = payload["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let tokens = payload["usageMetadata"]["totalTokenCount"].as_u64().unwrap_or(0) as u32;

        Ok((text, tokens))
    }
}

#[async_trait::async_trait]
impl OcrProvider for GeminiFileProvider {
    fn name(&self) -> ProviderName {
        ProviderName::GeminiFile
    }

    fn accepts_file_upload(&self) -> bool {
        true
    }

    async fn extract(&self, input: &ExtractInput, prompt: &str) -> Result<ProviderOutput, CoreError> {
        let ExtractInput::FileUpload { pdf_bytes } = input else {
            return Err(CoreError::ProviderInvalidInput("gemini-file requires a PDF upload".into()));
        };

        let file_name = self.upload_file(pdf_bytes).await?;
        self.await_active(&file_name).await?;

        let result = complete_with_retry(EXTRACT_SENTINEL, prompt, self.max_attempts, |p| {
            self.generate_with_handle(&file_name, p)
        })
        .await;

        self.delete_file(&file_name).await;
        result
    }

    async fn boost(&self, raw_text: &str, prompt: &str) -> Result<ProviderOutput, CoreError> {
        let full_prompt = format!("{prompt}\n\n{raw_text}");
        complete_with_retry(BOOST_SENTINEL, &full_prompt, self.max_attempts, |p| self.generate_without_handle(p)).await
    }
}

impl GeminiFileProvider {
    async fn generate_without_handle(&self, prompt: String) -> Result<(String, u32), CoreError> {
        let url = format!("{}/models/{}:generateContent?key={}", self.api_base, self.model, self.api_key);
        let body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": { "maxOutputTokens": max_output_tokens(&self.model) },
        });

        let response = self
            .client
            .post(&url)
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
            .map_err(|e| CoreError::ProviderTransient(format!("invalid gemini response: {e}")))?;

        let text = payload["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let tokens = payload["usageMetadata"]["totalTokenCount"].as_u64().unwrap_or(0) as u32;

        Ok((text, tokens))
    }
}

/// Encode raw page bytes for the vision path.
pub fn encode_page_base64(bytes: &[u8]) -> String {
    Base64::encode_string(bytes)
}
