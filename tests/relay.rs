//! Integration tests for the chat relay endpoint.
//!
//! Verifies that:
//! - The primary provider's stream is relayed with `fallbackUsed=false`
//! - A failing primary is substituted, with exactly one notice event
//! - An exhausted chain streams the degraded-mode message
//! - Providers without a credential are never called
//! - Malformed upstream frames are skipped
//! - Malformed inbound bodies get a 400 JSON error
//! - An open response stream keeps its relay slot until dropped
//!
//! Fake providers are wiremock servers (with call-count expectations) or
//! lightweight axum servers on random ports; the relay router is driven with
//! `tower::ServiceExt::oneshot`.

use std::time::Duration;

use axum::body::Body;
use http::Request;
use serde_json::json;
use tower::ServiceExt;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use genia_relay::config::{
    ApiKey, Config, LoggingConfig, ProviderConfig, RelayConfig, ServerConfig, WireFormat,
};
use genia_relay::relay::degraded::{word_chunks, DEGRADED_MESSAGE, DEGRADED_PROVIDER};
use genia_relay::relay::types::{decode_sse_body, StreamEvent};
use genia_relay::relay::{
    create_router, AppState, GENIA_FALLBACK_HEADER, GENIA_PROVIDER_HEADER,
    GENIA_REQUEST_ID_HEADER,
};

const OPENAI_SSE: &str = "data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\"},\"finish_reason\":null}]}\n\n\
data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Bonjour\"},\"finish_reason\":null}]}\n\n\
data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\" Marie\"},\"finish_reason\":null}]}\n\n\
data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n\
data: [DONE]\n\n";

const ANTHROPIC_SSE: &str = "event: message_start\n\
data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\"}}\n\n\
event: content_block_delta\n\
data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello from\"}}\n\n\
event: content_block_delta\n\
data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\" Claude\"}}\n\n\
event: message_stop\n\
data: {\"type\":\"message_stop\"}\n\n";

fn provider(name: &str, format: WireFormat, url: &str, key: Option<&str>) -> ProviderConfig {
    ProviderConfig {
        name: name.to_string(),
        format,
        url: url.to_string(),
        model: format!("{}-model", name),
        api_key: key.map(ApiKey::from),
    }
}

fn test_config(providers: Vec<ProviderConfig>) -> Config {
    Config {
        server: ServerConfig::default(),
        relay: RelayConfig {
            request_timeout_secs: 1,
            degraded_chunk_delay_ms: 0,
            ..RelayConfig::default()
        },
        providers,
        logging: LoggingConfig::default(),
    }
}

fn setup_app(providers: Vec<ProviderConfig>) -> axum::Router {
    create_router(AppState::new(test_config(providers), reqwest::Client::new()))
}

fn sse_ok(body: &'static str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/event-stream")
        .set_body_string(body)
}

/// Start a mock provider that always returns 500. Returns the chat URL.
async fn start_mock_provider_500() -> String {
    use axum::{http::StatusCode, routing::post, Router};

    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "upstream exploded") }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock provider 500");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    format!("http://127.0.0.1:{}/v1/chat/completions", addr.port())
}

/// Start a mock provider that streams `body` as SSE. Returns the chat URL.
async fn start_mock_provider_sse(body: &'static str) -> String {
    use axum::{http::header, routing::post, Router};

    let app = Router::new().route(
        "/v1/chat/completions",
        post(move || async move { ([(header::CONTENT_TYPE, "text/event-stream")], body) }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock provider sse");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    format!("http://127.0.0.1:{}/v1/chat/completions", addr.port())
}

fn chat_request(body: serde_json::Value) -> Request<Body> {
    Request::post("/api/chat")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn hello() -> serde_json::Value {
    json!({
        "messages": [
            {"role": "system", "content": "You are GENIA"},
            {"role": "user", "content": "Bonjour"}
        ],
        "sessionId": "s-42"
    })
}

/// Send a chat request; return status, headers and the decoded events.
async fn send(
    app: axum::Router,
    request: Request<Body>,
) -> (http::StatusCode, http::HeaderMap, Vec<StreamEvent>, bool, String) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
        .await
        .expect("read body");
    let text = String::from_utf8(bytes.to_vec()).expect("utf-8 body");
    let (events, done) = decode_sse_body(&text);
    (status, headers, events, done, text)
}

fn content(events: &[StreamEvent]) -> String {
    events.iter().map(|e| e.content_delta.as_str()).collect()
}

#[tokio::test]
async fn primary_success_streams_primary_content() {
    let mistral = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-mistral"))
        .and(header("x-session-id", "s-42"))
        .and(body_partial_json(json!({"stream": true, "safe_prompt": false, "model": "mistral-model"})))
        .respond_with(sse_ok(OPENAI_SSE))
        .expect(1)
        .mount(&mistral)
        .await;

    let openai = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(sse_ok(OPENAI_SSE))
        .expect(0)
        .mount(&openai)
        .await;

    let app = setup_app(vec![
        provider(
            "mistral",
            WireFormat::Mistral,
            &format!("{}/v1/chat/completions", mistral.uri()),
            Some("sk-mistral"),
        ),
        provider(
            "openai",
            WireFormat::OpenAi,
            &format!("{}/v1/chat/completions", openai.uri()),
            Some("sk-openai"),
        ),
    ]);

    let (status, headers, events, done, body) = send(app, chat_request(hello())).await;

    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(headers.get("content-type").unwrap(), "text/event-stream");
    assert_eq!(headers.get(GENIA_PROVIDER_HEADER).unwrap(), "mistral");
    assert_eq!(headers.get(GENIA_FALLBACK_HEADER).unwrap(), "false");
    assert!(headers.get(GENIA_REQUEST_ID_HEADER).is_some());

    assert!(done);
    assert!(body.ends_with("data: [DONE]\n\n"));
    assert_eq!(content(&events), "Bonjour Marie");
    assert!(events.iter().all(|e| e.provider_name == "mistral" && !e.fallback_used));
    assert_eq!(events.iter().filter(|e| e.is_final).count(), 1);
    assert!(events.last().unwrap().is_final);
}

#[tokio::test]
async fn failing_primary_is_substituted_with_one_notice() {
    let failing = start_mock_provider_500().await;
    let secondary = start_mock_provider_sse(OPENAI_SSE).await;

    let app = setup_app(vec![
        provider("mistral", WireFormat::Mistral, &failing, Some("sk-mistral")),
        provider("openai", WireFormat::OpenAi, &secondary, Some("sk-openai")),
    ]);

    let (status, headers, events, done, _) = send(app, chat_request(hello())).await;

    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(headers.get(GENIA_PROVIDER_HEADER).unwrap(), "openai");
    assert_eq!(headers.get(GENIA_FALLBACK_HEADER).unwrap(), "true");
    assert!(done);

    let notices: Vec<&StreamEvent> = events
        .iter()
        .filter(|e| e.content_delta.contains("Switching to openai"))
        .collect();
    assert_eq!(notices.len(), 1);
    assert!(events[0].content_delta.contains("mistral is temporarily unavailable"));
    assert_eq!(events[1].content_delta, "Bonjour");
    assert!(events.iter().all(|e| e.fallback_used && e.provider_name == "openai"));
    assert!(events.last().unwrap().is_final);
}

#[tokio::test]
async fn anthropic_is_reached_after_two_failures() {
    let failing = start_mock_provider_500().await;

    let anthropic = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "sk-ant"))
        .and(header("anthropic-version", "2023-06-01"))
        .and(body_partial_json(json!({
            "system": "You are GENIA",
            "messages": [{"role": "user", "content": "Bonjour"}],
            "stream": true
        })))
        .respond_with(sse_ok(ANTHROPIC_SSE))
        .expect(1)
        .mount(&anthropic)
        .await;

    let app = setup_app(vec![
        provider("mistral", WireFormat::Mistral, &failing, Some("sk-mistral")),
        provider("openai", WireFormat::OpenAi, &failing, Some("sk-openai")),
        provider(
            "anthropic",
            WireFormat::Anthropic,
            &format!("{}/v1/messages", anthropic.uri()),
            Some("sk-ant"),
        ),
    ]);

    let (_, headers, events, done, _) = send(app, chat_request(hello())).await;

    assert_eq!(headers.get(GENIA_PROVIDER_HEADER).unwrap(), "anthropic");
    assert!(done);
    let notice_count = events
        .iter()
        .filter(|e| e.content_delta.contains("Switching to"))
        .count();
    assert_eq!(notice_count, 1);
    assert!(content(&events).ends_with("Hello from Claude"));
    assert!(events.iter().all(|e| e.fallback_used));
}

#[tokio::test]
async fn exhausted_chain_streams_degraded_message() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        // One attempt per provider, no retries
        .expect(3)
        .mount(&upstream)
        .await;

    let url = format!("{}/v1/chat/completions", upstream.uri());
    let app = setup_app(vec![
        provider("mistral", WireFormat::Mistral, &url, Some("k1")),
        provider("openai", WireFormat::OpenAi, &url, Some("k2")),
        provider("backup", WireFormat::OpenAi, &url, Some("k3")),
    ]);

    let (status, headers, events, done, body) = send(app, chat_request(hello())).await;

    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(headers.get(GENIA_PROVIDER_HEADER).unwrap(), DEGRADED_PROVIDER);
    assert!(done);
    assert!(body.ends_with("data: [DONE]\n\n"));

    let chunks = word_chunks(DEGRADED_MESSAGE);
    assert_eq!(events.len(), chunks.len() + 1);
    for (event, chunk) in events.iter().zip(&chunks) {
        assert_eq!(&event.content_delta, chunk);
        assert_eq!(event.provider_name, DEGRADED_PROVIDER);
        assert!(event.fallback_used);
    }
    let last = events.last().unwrap();
    assert!(last.is_final);
    assert!(body.contains(r#""finish_reason":"stop""#));
}

#[tokio::test]
async fn provider_without_credential_is_never_called() {
    let mistral = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(sse_ok(OPENAI_SSE))
        .expect(0)
        .mount(&mistral)
        .await;

    let openai = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("authorization", "Bearer sk-openai"))
        .respond_with(sse_ok(OPENAI_SSE))
        .expect(1)
        .mount(&openai)
        .await;

    let app = setup_app(vec![
        provider(
            "mistral",
            WireFormat::Mistral,
            &format!("{}/v1/chat/completions", mistral.uri()),
            None,
        ),
        provider(
            "openai",
            WireFormat::OpenAi,
            &format!("{}/v1/chat/completions", openai.uri()),
            Some("sk-openai"),
        ),
    ]);

    let (_, headers, events, done, _) = send(app, chat_request(hello())).await;

    assert!(done);
    assert_eq!(headers.get(GENIA_PROVIDER_HEADER).unwrap(), "openai");
    assert!(events.iter().all(|e| e.fallback_used));
    assert!(content(&events).ends_with("Bonjour Marie"));
}

#[tokio::test]
async fn slow_provider_times_out_and_is_substituted() {
    let slow = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(sse_ok(OPENAI_SSE).set_delay(Duration::from_secs(3)))
        .mount(&slow)
        .await;
    let secondary = start_mock_provider_sse(OPENAI_SSE).await;

    let app = setup_app(vec![
        provider(
            "mistral",
            WireFormat::Mistral,
            &format!("{}/v1/chat/completions", slow.uri()),
            Some("sk-mistral"),
        ),
        provider("openai", WireFormat::OpenAi, &secondary, Some("sk-openai")),
    ]);

    let (_, headers, events, done, _) = send(app, chat_request(hello())).await;

    assert!(done);
    assert_eq!(headers.get(GENIA_PROVIDER_HEADER).unwrap(), "openai");
    assert!(content(&events).ends_with("Bonjour Marie"));
}

#[tokio::test]
async fn malformed_frames_are_skipped() {
    const NOISY_SSE: &str = ": keep-alive\n\n\
data: {\"choices\":[{\"delta\":{\"content\":\"one\"},\"finish_reason\":null}]}\n\n\
data: {broken json\n\n\
data: {\"unexpected\":true}\n\n\
data:{\"choices\":[{\"delta\":{\"content\":\" two\"},\"finish_reason\":null}]}\r\n\r\n\
data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n\
data: [DONE]\n\n";

    let upstream = start_mock_provider_sse(NOISY_SSE).await;
    let app = setup_app(vec![provider(
        "openai",
        WireFormat::OpenAi,
        &upstream,
        Some("sk-openai"),
    )]);

    let (_, _, events, done, _) = send(app, chat_request(hello())).await;

    assert!(done);
    assert_eq!(content(&events), "one two");
    assert_eq!(events.len(), 3);
}

#[tokio::test]
async fn truncated_stream_still_ends_with_done() {
    const TRUNCATED_SSE: &str =
        "data: {\"choices\":[{\"delta\":{\"content\":\"partial\"},\"finish_reason\":null}]}\n\n";

    let upstream = start_mock_provider_sse(TRUNCATED_SSE).await;
    let app = setup_app(vec![provider(
        "openai",
        WireFormat::OpenAi,
        &upstream,
        Some("sk-openai"),
    )]);

    let (_, _, events, done, _) = send(app, chat_request(hello())).await;

    assert!(done);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].content_delta, "partial");
    assert!(events[1].is_final);
}

#[tokio::test]
async fn invalid_bodies_get_400() {
    let bodies = [
        "not json at all".to_string(),
        json!({}).to_string(),
        json!({"messages": "hello"}).to_string(),
        json!({"messages": []}).to_string(),
        json!({"messages": [{"role": "wizard", "content": "x"}]}).to_string(),
    ];

    for body in bodies {
        let app = setup_app(Vec::new());
        let request = Request::post("/api/chat")
            .header("content-type", "application/json")
            .body(Body::from(body.clone()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(
            response.status(),
            http::StatusCode::BAD_REQUEST,
            "body {:?} should be rejected",
            body
        );
        assert!(response.headers().get(GENIA_REQUEST_ID_HEADER).is_some());

        let bytes = axum::body::to_bytes(response.into_body(), 65_536)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["error"]["code"], 400);
    }
}

#[tokio::test]
async fn no_providers_still_answers_with_stream() {
    let app = setup_app(Vec::new());
    let (status, _, events, done, _) = send(app, chat_request(hello())).await;

    assert_eq!(status, http::StatusCode::OK);
    assert!(done);
    assert_eq!(content(&events).trim_end(), DEGRADED_MESSAGE);
}

#[tokio::test]
async fn model_listing_includes_only_configured_providers() {
    let app = setup_app(vec![
        provider("mistral", WireFormat::Mistral, "http://127.0.0.1:9/x", None),
        provider("openai", WireFormat::OpenAi, "http://127.0.0.1:9/x", Some("k")),
    ]);

    let response = app
        .oneshot(Request::get("/api/chat").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), http::StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), 65_536)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["providers_configured"], 1);
    assert_eq!(json["total_providers"], 2);
    assert_eq!(json["fallback_enabled"], true);
    let models = json["available_models"].as_array().unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0]["id"], "openai-model");
    assert_eq!(models[0]["provider"], "openai");
    assert_eq!(models[0]["streaming"], true);
}

#[tokio::test]
async fn open_stream_holds_its_relay_slot() {
    let mut config = test_config(Vec::new());
    config.server.max_concurrent_requests = 1;
    config.relay.degraded_chunk_delay_ms = 10_000;
    let app = create_router(AppState::new(config, reqwest::Client::new()));

    let first = app.clone().oneshot(chat_request(hello())).await.unwrap();
    assert_eq!(first.status(), http::StatusCode::OK);

    let mut second = Box::pin(app.clone().oneshot(chat_request(hello())));
    assert!(
        tokio::time::timeout(Duration::from_millis(200), &mut second)
            .await
            .is_err(),
        "second relay started while the first stream was open"
    );

    // Validation and health do not wait for a slot.
    let (status, _, _, _, _) = send(app.clone(), chat_request(json!({"messages": []}))).await;
    assert_eq!(status, http::StatusCode::BAD_REQUEST);
    let health = app
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(health.status(), http::StatusCode::OK);

    drop(first);
    let second = tokio::time::timeout(Duration::from_secs(5), second)
        .await
        .expect("second relay admitted once the first body is dropped")
        .unwrap();
    assert_eq!(second.status(), http::StatusCode::OK);
}
