//! HTTP request handlers.

use axum::{
    body::{Body, Bytes},
    extract::{Extension, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::{FutureExt, StreamExt};
use std::panic::AssertUnwindSafe;
use tokio::sync::OwnedSemaphorePermit;

use super::fallback::RelayOutcome;
use super::server::{AppState, RequestId};
use super::types::ChatRequest;
use crate::error::Error;
use crate::evaluation::{self, Evaluation, EvaluationRequest, EvaluationResponse};
use crate::providers::ProbeStatus;

/// Response header: correlation ID (UUID v4).
pub const GENIA_REQUEST_ID_HEADER: &str = "x-genia-request-id";
/// Response header: provider that is streaming the answer.
pub const GENIA_PROVIDER_HEADER: &str = "x-genia-provider";
/// Response header: "true" when the primary provider was not used.
pub const GENIA_FALLBACK_HEADER: &str = "x-genia-fallback";

/// Validate an inbound chat body.
///
/// The `messages` shape is checked on the raw JSON first so callers get a
/// precise message instead of a serde path.
pub fn parse_chat_request(body: &[u8]) -> Result<ChatRequest, Error> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| Error::InvalidRequest(format!("Body is not valid JSON: {}", e)))?;

    match value.get("messages") {
        Some(serde_json::Value::Array(messages)) if messages.is_empty() => {
            return Err(Error::InvalidRequest(
                "Messages array must not be empty".to_string(),
            ))
        }
        Some(serde_json::Value::Array(_)) => {}
        _ => {
            return Err(Error::InvalidRequest(
                "Messages array is required".to_string(),
            ))
        }
    }

    let mut request: ChatRequest = serde_json::from_value(value)
        .map_err(|e| Error::InvalidRequest(e.to_string()))?;
    request.stream = Some(true);
    Ok(request)
}

/// Stream the outcome as SSE, holding `permit` until the body is dropped.
fn sse_response(outcome: RelayOutcome, permit: Option<OwnedSemaphorePermit>) -> Response {
    let provider = HeaderValue::from_str(&outcome.provider).ok();
    let fallback = HeaderValue::from_static(if outcome.fallback_used { "true" } else { "false" });

    let mut frames = Box::pin(outcome.into_sse_body());
    let body = async_stream::stream! {
        let _permit = permit;
        while let Some(frame) = frames.next().await {
            yield frame;
        }
    };

    let mut response = Response::new(Body::from_stream(body));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(GENIA_FALLBACK_HEADER, fallback);
    if let Some(provider) = provider {
        headers.insert(GENIA_PROVIDER_HEADER, provider);
    }
    response
}

/// Handle POST /api/chat
///
/// Waits for a relay slot once the body is valid. A panic while starting the
/// relay, or while its stream is read, is answered with the emergency message.
pub async fn chat(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    body: Bytes,
) -> Result<Response, Error> {
    let request = parse_chat_request(&body)?;

    tracing::info!(
        request_id = %request_id.0,
        messages = request.messages.len(),
        session = request.session_id.as_deref().unwrap_or("anonymous"),
        "Relaying chat request"
    );

    let permit = state.acquire_relay_slot().await;
    let delay = state.relay.settings().degraded_chunk_delay;

    let outcome = match AssertUnwindSafe(state.relay.relay(&request)).catch_unwind().await {
        Ok(outcome) => outcome.catch_stream_panics(delay),
        Err(_) => {
            tracing::error!(request_id = %request_id.0, "Relay panicked, streaming emergency message");
            RelayOutcome::emergency(delay)
        }
    };

    tracing::info!(
        request_id = %request_id.0,
        provider = %outcome.provider,
        fallback_used = outcome.fallback_used,
        failed_attempts = outcome.attempts.len(),
        "Streaming response"
    );

    Ok(sse_response(outcome, permit))
}

/// Handle GET /api/chat - models of providers that have a credential
pub async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    let adapters = state.relay.adapters();
    let models: Vec<serde_json::Value> = adapters
        .iter()
        .filter(|a| a.is_configured())
        .map(|a| {
            serde_json::json!({
                "id": a.model(),
                "name": a.model(),
                "provider": a.name(),
                "description": format!("{} model: {}", a.name(), a.model()),
                "available": true,
                "streaming": true,
            })
        })
        .collect();

    Json(serde_json::json!({
        "providers_configured": models.len(),
        "available_models": models,
        "fallback_enabled": true,
        "streaming_enabled": true,
        "total_providers": adapters.len(),
    }))
}

/// Handle GET /health
///
/// Probes every provider concurrently. Returns 503 only when providers are
/// configured and none of them answers.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let timeout = state.config.relay.health_probe_timeout();
    let probes = state.relay.adapters().iter().map(|adapter| async move {
        (adapter.name().to_string(), adapter.probe(timeout).await)
    });
    let results = futures::future::join_all(probes).await;

    let configured = results
        .iter()
        .filter(|(_, status)| *status != ProbeStatus::NotConfigured)
        .count();
    let healthy = results
        .iter()
        .filter(|(_, status)| *status == ProbeStatus::Healthy)
        .count();

    let (status, message) = if configured > 0 && healthy == configured {
        ("ok", "All providers operational".to_string())
    } else if configured == 0 {
        ("degraded", "No provider configured, answering in degraded mode".to_string())
    } else {
        (
            "degraded",
            format!("{} of {} configured providers healthy", healthy, configured),
        )
    };

    let services: serde_json::Map<String, serde_json::Value> = results
        .into_iter()
        .map(|(name, status)| (name, serde_json::Value::from(status.as_str())))
        .collect();

    let code = if configured > 0 && healthy == 0 {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        code,
        Json(serde_json::json!({
            "status": status,
            "message": message,
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": state.started_at.elapsed().as_secs(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "services": services,
        })),
    )
}

/// Handle POST /api/ai/evaluate
pub async fn evaluate(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<EvaluationResponse>, Error> {
    let value: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| Error::InvalidRequest(format!("Body is not valid JSON: {}", e)))?;
    let raw: EvaluationRequest =
        serde_json::from_value(value).map_err(|e| Error::InvalidRequest(e.to_string()))?;
    let evaluation = Evaluation::try_from(raw)?;

    let _permit = state.acquire_relay_slot().await;
    Ok(Json(evaluation::evaluate(&state.relay, &evaluation).await))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::degraded::EMERGENCY_PROVIDER;
    use crate::relay::types::Role;

    #[test]
    fn valid_body_forces_streaming() {
        let request = parse_chat_request(
            br#"{"messages":[{"role":"user","content":"hi"}],"stream":false}"#,
        )
        .unwrap();
        assert_eq!(request.stream, Some(true));
        assert_eq!(request.messages[0].role, Role::User);
    }

    #[test]
    fn invalid_bodies_are_rejected() {
        let cases: [&[u8]; 6] = [
            b"not json",
            br#"{}"#,
            br#"{"messages":"hello"}"#,
            br#"{"messages":[]}"#,
            br#"{"messages":[{"role":"robot","content":"x"}]}"#,
            br#"{"messages":[{"role":"user"}]}"#,
        ];
        for body in cases {
            assert!(
                matches!(parse_chat_request(body), Err(Error::InvalidRequest(_))),
                "accepted {:?}",
                String::from_utf8_lossy(body)
            );
        }
    }

    #[test]
    fn sse_response_headers() {
        let outcome = RelayOutcome::emergency(std::time::Duration::ZERO);
        let response = sse_response(outcome, None);
        let headers = response.headers();
        assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "text/event-stream");
        assert_eq!(headers.get(header::CACHE_CONTROL).unwrap(), "no-cache");
        assert_eq!(headers.get(GENIA_PROVIDER_HEADER).unwrap(), EMERGENCY_PROVIDER);
        assert_eq!(headers.get(GENIA_FALLBACK_HEADER).unwrap(), "true");
    }
}
