use registre_ocr::provider::gemini::GeminiFileProvider;
use registre_ocr::provider::{ExtractInput, OcrProvider};
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn extract_uploads_polls_then_deletes_the_file() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path_regex(r"^/files$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "file": { "name": "files/abc123" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path_regex(r"^/files/abc123$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "state": "ACTIVE" })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path_regex(r"^/models/.*:generateContent$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "candidates": [{ "content": { "parts": [{ "text": "acte text ✅ EXTRACTION_COMPLETE:" }] } }],
            "usageMetadata": { "totalTokenCount": 456 },
        })))
        .mount(&server)
        .await;

    Mock::given(method("DELETE"))
        .and(path_regex(r"^/files/abc123$"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let provider = GeminiFileProvider::with_base_url(
        "test-key".to_string(),
        "gemini-1.5-pro".to_string(),
        3,
        server.uri(),
    );

    let output = provider
        .extract(&ExtractInput::FileUpload { pdf_bytes: b"%PDF-1.4 fake".to_vec() }, "extract this acte")
        .await
        .expect("extract should succeed");

    assert!(output.is_complete);
    assert!(output.text.contains("acte text"));
}

#[tokio::test]
async fn extract_rejects_image_input() {
    let server = MockServer::start().await;
    let provider = GeminiFileProvider::with_base_url(
        "test-key".to_string(),
        "gemini-1.5-pro".to_string(),
        3,
        server.uri(),
    );

    let result = provider
        .extract(
            &ExtractInput::Image(registre_ocr::provider::PageImage {
                base64_data: "x".to_string(),
                mime_type: "image/png".to_string(),
            }),
            "prompt",
        )
        .await;

    assert!(result.is_err());
}

#[tokio::test]
async fn upload_failure_surfaces_before_any_polling() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/files$"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream error"))
        .mount(&server)
        .await;

    let provider = GeminiFileProvider::with_base_url(
        "test-key".to_string(),
        "gemini-1.5-pro".to_string(),
        3,
        server.uri(),
    );

    let result = provider
        .extract(&ExtractInput::FileUpload { pdf_bytes: b"%PDF-1.4".to_vec() }, "prompt")
        .await;

    let err = result.expect_err("upload failure should propagate");
    assert_eq!(err.retry_kind(), registre_ocr::error::RetryKind::FallbackProvider);
}
