//! Anthropic Messages API adapter.
//!
//! System instructions travel in a dedicated `system` field: the first
//! system message is lifted out of the conversation, later ones are dropped.

use async_trait::async_trait;
use reqwest::header;
use serde::Serialize;
use std::time::Duration;

use super::{probe_request, start_stream, ByteStream, ProbeStatus, ProviderAdapter, ProviderError};
use crate::config::{ProviderConfig, WireFormat};
use crate::relay::types::{ChatRequest, Message, Role};

const API_KEY_HEADER: &str = "x-api-key";
const VERSION_HEADER: &str = "anthropic-version";
const API_VERSION: &str = "2023-06-01";

/// Request body for `/v1/messages`.
#[derive(Debug, Serialize)]
pub(crate) struct AnthropicPayload<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'a str,
    messages: Vec<&'a Message>,
    stream: bool,
}

pub struct AnthropicAdapter {
    config: ProviderConfig,
    client: reqwest::Client,
    request_timeout: Duration,
}

impl AnthropicAdapter {
    pub fn new(config: ProviderConfig, client: reqwest::Client, request_timeout: Duration) -> Self {
        Self {
            config,
            client,
            request_timeout,
        }
    }

    pub(crate) fn payload<'a>(&'a self, request: &'a ChatRequest) -> AnthropicPayload<'a> {
        AnthropicPayload {
            model: &self.config.model,
            max_tokens: request.max_tokens(),
            temperature: request.temperature(),
            system: request.system_prompt().unwrap_or(""),
            messages: request.conversation().collect(),
            stream: true,
        }
    }

    fn authorized(
        &self,
        builder: reqwest::RequestBuilder,
        api_key: &crate::config::ApiKey,
    ) -> reqwest::RequestBuilder {
        builder
            .header(header::CONTENT_TYPE, "application/json")
            .header(API_KEY_HEADER, api_key.expose_secret())
            .header(VERSION_HEADER, API_VERSION)
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn format(&self) -> WireFormat {
        WireFormat::Anthropic
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

        let upstream = self
            .authorized(self.client.post(&self.config.url), api_key)
            .json(&self.payload(request));

        start_stream(&self.config.name, upstream, self.request_timeout).await
    }

    /// One-token completion; the Messages API has no cheaper authenticated call.
    async fn probe(&self, timeout: Duration) -> ProbeStatus {
        let Some(api_key) = self.config.api_key.as_ref() else {
            return ProbeStatus::NotConfigured;
        };

        let body = serde_json::json!({
            "model": self.config.model,
            "max_tokens": 1,
            "messages": [{"role": Role::User, "content": "test"}],
        });
        let request = self
            .authorized(self.client.post(&self.config.url), api_key)
            .json(&body);
        probe_request(&self.config.name, request, timeout).await
    }
}
