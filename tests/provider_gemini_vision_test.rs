use registre_ocr::provider::gemini::GeminiVisionProvider;
use registre_ocr::provider::{ExtractInput, OcrProvider, PageImage};
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn gemini_response(text: &str) -> serde_json::Value {
    serde_json::json!({
        "candidates": [{ "content": { "parts": [{ "text": text }] } }],
        "usageMetadata": { "totalTokenCount": 123 },
    })
}

fn sample_page() -> PageImage {
    PageImage { base64_data: "ZmFrZS1wYWdl".to_string(), mime_type: "image/png".to_string() }
}

#[tokio::test]
async fn extract_returns_immediately_on_complete_sentinel() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/models/.*:generateContent$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(gemini_response("full text\n✅ EXTRACTION_COMPLETE:")))
        .expect(1)
        .mount(&server)
        .await;

    let provider = GeminiVisionProvider::with_base_url(
        "test-key".to_string(),
        "gemini-1.5-flash".to_string(),
        3,
        server.uri(),
    );

    let output = provider
        .extract(&ExtractInput::Image(sample_page()), "extract this page")
        .await
        .expect("extract should succeed");

    assert!(output.is_complete);
    assert!(output.text.contains("full text"));
}

#[tokio::test]
async fn extract_retries_with_continuation_until_sentinel_observed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/models/.*:generateContent$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(gemini_response("partial one")))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/models/.*:generateContent$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(gemini_response("partial two ✅ EXTRACTION_COMPLETE:")))
        .mount(&server)
        .await;

    let provider = GeminiVisionProvider::with_base_url(
        "test-key".to_string(),
        "gemini-1.5-flash".to_string(),
        3,
        server.uri(),
    );

    let output = provider
        .extract(&ExtractInput::Image(sample_page()), "extract this page")
        .await
        .expect("extract should eventually succeed");

    assert!(output.is_complete);
    assert!(output.text.contains("partial one"));
    assert!(output.text.contains("partial two"));
}

#[tokio::test]
async fn extract_gives_up_after_max_attempts_without_sentinel() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/models/.*:generateContent$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(gemini_response("never finishes")))
        .mount(&server)
        .await;

    let provider = GeminiVisionProvider::with_base_url(
        "test-key".to_string(),
        "gemini-1.5-flash".to_string(),
        2,
        server.uri(),
    );

    let output = provider
        .extract(&ExtractInput::Image(sample_page()), "extract this page")
        .await
        .expect("send succeeds even without a sentinel");

    assert!(!output.is_complete);
}

#[tokio::test]
async fn extract_rejects_file_upload_input() {
    let server = MockServer::start().await;
    let provider = GeminiVisionProvider::with_base_url(
        "test-key".to_string(),
        "gemini-1.5-flash".to_string(),
        3,
        server.uri(),
    );

    let result = provider
        .extract(&ExtractInput::FileUpload { pdf_bytes: vec![1, 2, 3] }, "prompt")
        .await;

    assert!(result.is_err());
}

#[tokio::test]
async fn unauthorized_response_maps_to_provider_auth_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/models/.*:generateContent$"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .mount(&server)
        .await;

    let provider = GeminiVisionProvider::with_base_url(
        "bad-key".to_string(),
        "gemini-1.5-flash".to_string(),
        3,
        server.uri(),
    );

    let result = provider.extract(&ExtractInput::Image(sample_page()), "prompt").await;
    let err = result.expect_err("401 should surface as an error");
    assert_eq!(err.retry_kind(), registre_ocr::error::RetryKind::Terminal);
}
