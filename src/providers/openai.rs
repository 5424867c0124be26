//! OpenAI-compatible adapter (OpenAI and Mistral).

use async_trait::async_trait;
use reqwest::header;
use serde::Serialize;
use std::time::Duration;

use super::{probe_request, start_stream, ByteStream, ProbeStatus, ProviderAdapter, ProviderError};
use crate::config::{ProviderConfig, WireFormat};
use crate::relay::types::{ChatRequest, Message};

/// Nucleus sampling sent with every completion.
const TOP_P: f32 = 0.9;

/// Session header forwarded to Mistral.
const SESSION_HEADER: &str = "X-Session-ID";

/// Request body for `/chat/completions`.
#[derive(Debug, Serialize)]
pub(crate) struct OpenAiPayload<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    max_tokens: u32,
    top_p: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    safe_prompt: Option<bool>,
}

/// Adapter for endpoints speaking the OpenAI chat-completions protocol.
pub struct OpenAiAdapter {
    config: ProviderConfig,
    client: reqwest::Client,
    request_timeout: Duration,
}

impl OpenAiAdapter {
    pub fn new(config: ProviderConfig, client: reqwest::Client, request_timeout: Duration) -> Self {
        Self {
            config,
            client,
            request_timeout,
        }
    }

    pub(crate) fn payload<'a>(&'a self, request: &'a ChatRequest) -> OpenAiPayload<'a> {
        let is_mistral = self.config.format == WireFormat::Mistral;
        OpenAiPayload {
            model: &self.config.model,
            messages: &request.messages,
            temperature: request.temperature(),
            max_tokens: request.max_tokens(),
            top_p: TOP_P,
            stream: true,
            safe_prompt: is_mistral.then_some(false),
        }
    }

    /// `GET <base>/models`, derived from the chat endpoint URL.
    fn models_url(&self) -> String {
        let url = self.config.url.trim_end_matches('/');
        match url.strip_suffix("/chat/completions") {
            Some(base) => format!("{}/models", base),
            None => format!("{}/models", url),
        }
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn format(&self) -> WireFormat {
        self.config.format
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    async fn invoke(&self, request: &ChatRequest) -> Result<ByteStream, ProviderError> {
        let api_key = self
            .config
            .api_key
            .as_ref()
            .ok_or_else(|| ProviderError::NotConfigured {
                provider: self.config.name.clone(),
            })?;

        let mut upstream = self
            .client
            .post(&self.config.url)
            .header(header::CONTENT_TYPE, "application/json")
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", api_key.expose_secret()),
            )
            .json(&self.payload(request));

        if self.config.format == WireFormat::Mistral {
            upstream = upstream.header(
                SESSION_HEADER,
                request.session_id.as_deref().unwrap_or("anonymous"),
            );
        }

        start_stream(&self.config.name, upstream, self.request_timeout).await
    }

    async fn probe(&self, timeout: Duration) -> ProbeStatus {
        let Some(api_key) = self.config.api_key.as_ref() else {
            return ProbeStatus::NotConfigured;
        };

        let request = self.client.get(self.models_url()).header(
            header::AUTHORIZATION,
            format!("Bearer {}", api_key.expose_secret()),
        );
        probe_request(&self.config.name, request, timeout).await
    }
}
