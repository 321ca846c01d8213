use registre_ocr::provider::claude::ClaudeVisionProvider;
use registre_ocr::provider::{ExtractInput, OcrProvider, PageImage};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn claude_response(text: &str) -> serde_json::Value {
    serde_json::json!({
        "content": [{ "type": "text", "text": text }],
        "usage": { "input_tokens": 50, "output_tokens": 75 },
    })
}

fn sample_page() -> PageImage {
    PageImage { base64_data: "ZmFrZS1wYWdl".to_string(), mime_type: "image/png".to_string() }
}

#[tokio::test]
async fn extract_returns_text_on_complete_sentinel() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(claude_response("page text ✅ EXTRACTION_COMPLETE:")))
        .mount(&server)
        .await;

    let provider = ClaudeVisionProvider::with_base_url(
        "test-key".to_string(),
        "claude-3-5-sonnet-latest".to_string(),
        3,
        server.uri(),
    );

    let output = provider
        .extract(&ExtractInput::Image(sample_page()), "extract this page")
        .await
        .expect("extract should succeed");

    assert!(output.is_complete);
    assert_eq!(output.tokens_used, 125);
}

#[tokio::test]
async fn boost_concatenates_fragments_until_sentinel() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(claude_response("boosted ✅ BOOST_COMPLETE:")))
        .mount(&server)
        .await;

    let provider = ClaudeVisionProvider::with_base_url(
        "test-key".to_string(),
        "claude-3-5-sonnet-latest".to_string(),
        3,
        server.uri(),
    );

    let output = provider.boost("raw text here", "boost this").await.expect("boost should succeed");
    assert!(output.is_complete);
    assert!(output.text.contains("boosted"));
}

#[tokio::test]
async fn rate_limited_response_maps_to_fallback_retry_kind() {
    let server = MockServer::start().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(429)).mount(&server).await;

    let provider = ClaudeVisionProvider::with_base_url(
        "test-key".to_string(),
        "claude-3-5-sonnet-latest".to_string(),
        1,
        server.uri(),
    );

    let result = provider.extract(&ExtractInput::Image(sample_page()), "prompt").await;
    let err = result.expect_err("429 should surface as an error");
    assert_eq!(err.retry_kind(), registre_ocr::error::RetryKind::FallbackProvider);
}
