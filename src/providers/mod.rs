//! Provider adapters.
//!
//! Each adapter wraps one upstream chat endpoint: it turns a [`ChatRequest`]
//! into that provider's wire payload, performs exactly one HTTP call, and
//! hands back the raw streamed body. Adapters never retry; substitution is
//! the fallback relay's job.

mod anthropic;
mod openai;

pub use anthropic::AnthropicAdapter;
pub use openai::OpenAiAdapter;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, ProviderConfig, WireFormat};
use crate::relay::types::ChatRequest;

/// Longest upstream error body kept for logging.
const MAX_ERROR_BODY: usize = 512;

/// Raw response body of a provider, chunked as it arrives from the network.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Reasons a provider could not start a response.
///
/// Every variant means "unavailable for this request"; the relay treats
/// them identically and moves on to the next provider.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider '{provider}' is not configured (missing API key)")]
    NotConfigured { provider: String },

    #[error("Provider '{provider}' returned {status}: {body}")]
    Status {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("Failed to reach provider '{provider}': {message}")]
    Network { provider: String, message: String },

    #[error("Provider '{provider}' did not respond within {timeout:?}")]
    Timeout { provider: String, timeout: Duration },
}

impl ProviderError {
    /// Short category for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::NotConfigured { .. } => "not_configured",
            ProviderError::Status { .. } => "status",
            ProviderError::Network { .. } => "network",
            ProviderError::Timeout { .. } => "timeout",
        }
    }
}

/// Result of a bounded health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    Healthy,
    Error,
    NotConfigured,
}

impl ProbeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeStatus::Healthy => "healthy",
            ProbeStatus::Error => "error",
            ProbeStatus::NotConfigured => "not_configured",
        }
    }
}

/// One upstream chat-completion endpoint.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider name as declared in configuration.
    fn name(&self) -> &str;

    /// Wire format used to read the streamed body.
    fn format(&self) -> WireFormat;

    /// Model identifier sent upstream.
    fn model(&self) -> &str;

    /// Whether a credential is present. Unconfigured adapters fail without I/O.
    fn is_configured(&self) -> bool;

    /// Start a streamed completion. Exactly one outbound request.
    async fn invoke(&self, request: &ChatRequest) -> Result<ByteStream, ProviderError>;

    /// Check reachability and credentials within `timeout`.
    async fn probe(&self, timeout: Duration) -> ProbeStatus;
}

/// Build one adapter per configured provider, preserving declaration order.
pub fn build_adapters(
    config: &Config,
    client: reqwest::Client,
) -> Vec<Arc<dyn ProviderAdapter>> {
    let timeout = config.relay.request_timeout();
    config
        .providers
        .iter()
        .map(|provider| adapter_for(provider.clone(), client.clone(), timeout))
        .collect()
}

/// Build the adapter matching a provider's wire format.
pub fn adapter_for(
    provider: ProviderConfig,
    client: reqwest::Client,
    request_timeout: Duration,
) -> Arc<dyn ProviderAdapter> {
    match provider.format {
        WireFormat::OpenAi | WireFormat::Mistral => {
            Arc::new(OpenAiAdapter::new(provider, client, request_timeout))
        }
        WireFormat::Anthropic => Arc::new(AnthropicAdapter::new(provider, client, request_timeout)),
    }
}

/// Send a prepared request and return its body as a [`ByteStream`].
///
/// `timeout` bounds the wait for response headers only; the body is
/// streamed without an overall deadline.
pub(crate) async fn start_stream(
    provider: &str,
    request: reqwest::RequestBuilder,
    timeout: Duration,
) -> Result<ByteStream, ProviderError> {
    let response = match tokio::time::timeout(timeout, request.send()).await {
        Err(_) => {
            return Err(ProviderError::Timeout {
                provider: provider.to_string(),
                timeout,
            })
        }
        Ok(Err(e)) => {
            return Err(ProviderError::Network {
                provider: provider.to_string(),
                message: e.to_string(),
            })
        }
        Ok(Ok(response)) => response,
    };

    let status = response.status();
    if !status.is_success() {
        let body = tokio::time::timeout(
            timeout,
            read_prefix(Box::pin(response.bytes_stream()), MAX_ERROR_BODY),
        )
        .await
        .unwrap_or_default();
        return Err(ProviderError::Status {
            provider: provider.to_string(),
            status: status.as_u16(),
            body,
        });
    }

    Ok(Box::pin(
        response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other)),
    ))
}

/// Send a probe request bounded by `timeout`.
pub(crate) async fn probe_request(
    provider: &str,
    request: reqwest::RequestBuilder,
    timeout: Duration,
) -> ProbeStatus {
    match request.timeout(timeout).send().await {
        Ok(response) if response.status().is_success() => ProbeStatus::Healthy,
        Ok(response) => {
            tracing::debug!(provider = %provider, status = %response.status(), "Health probe rejected");
            ProbeStatus::Error
        }
        Err(e) => {
            tracing::debug!(provider = %provider, error = %e, "Health probe failed");
            ProbeStatus::Error
        }
    }
}

/// Read an error body only until `max` bytes are buffered, then truncate
/// it to `max` characters.
async fn read_prefix<S, E>(mut body: S, max: usize) -> String
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    let mut prefix = Vec::new();
    while prefix.len() <= max {
        match body.next().await {
            Some(Ok(chunk)) => prefix.extend_from_slice(&chunk),
            _ => break,
        }
    }
    truncate(&String::from_utf8_lossy(&prefix), max)
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
