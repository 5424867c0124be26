//! Chat request model, canonical stream events and the outbound SSE frame format.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Temperature used when the caller does not send one.
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Completion budget used when the caller does not send one.
pub const DEFAULT_MAX_TOKENS: u32 = 1500;

/// End-of-stream marker closing every relay response.
pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

/// Finish reason written on the terminal frame.
pub const FINISH_REASON_STOP: &str = "stop";

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat message.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Inbound chat request.
///
/// `model` and `stream` are accepted for client compatibility: each provider
/// uses its configured model, and streaming is always on.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(rename = "lessonContext", default, skip_serializing_if = "Option::is_none")]
    pub lesson_context: Option<String>,
    #[serde(rename = "moduleContext", default, skip_serializing_if = "Option::is_none")]
    pub module_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

impl ChatRequest {
    /// Build a request from messages with every optional field unset.
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            model: None,
            temperature: None,
            max_tokens: None,
            session_id: None,
            lesson_context: None,
            module_context: None,
            stream: None,
        }
    }

    pub fn temperature(&self) -> f32 {
        self.temperature.unwrap_or(DEFAULT_TEMPERATURE)
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)
    }

    /// Content of the first system message, if any.
    pub fn system_prompt(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
    }

    /// User and assistant turns, in order, without system messages.
    pub fn conversation(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|m| m.role != Role::System)
    }
}

/// Provider-independent unit of streamed output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub content_delta: String,
    pub is_final: bool,
    pub provider_name: String,
    pub fallback_used: bool,
}

impl StreamEvent {
    pub fn content(
        content: impl Into<String>,
        provider_name: impl Into<String>,
        fallback_used: bool,
    ) -> Self {
        Self {
            content_delta: content.into(),
            is_final: false,
            provider_name: provider_name.into(),
            fallback_used,
        }
    }

    pub fn terminal(provider_name: impl Into<String>, fallback_used: bool) -> Self {
        Self {
            content_delta: String::new(),
            is_final: true,
            provider_name: provider_name.into(),
            fallback_used,
        }
    }

    /// Wire representation of this event.
    pub fn to_frame(&self) -> StreamFrame {
        StreamFrame {
            choices: vec![FrameChoice {
                delta: Delta {
                    content: (!self.content_delta.is_empty()).then(|| self.content_delta.clone()),
                },
                finish_reason: self.is_final.then(|| FINISH_REASON_STOP.to_string()),
            }],
            provider: self.provider_name.clone(),
            fallback_used: self.fallback_used,
        }
    }

    /// Encode as one `data: {...}\n\n` SSE frame.
    pub fn to_sse_bytes(&self) -> Bytes {
        // A frame holds only strings and bools, so serialization cannot fail.
        let json = serde_json::to_string(&self.to_frame()).unwrap_or_default();
        Bytes::from(format!("data: {}\n\n", json))
    }

    /// Decode the payload of a `data:` line produced by [`StreamEvent::to_sse_bytes`].
    ///
    /// Returns `None` for `[DONE]` and for payloads that are not relay frames.
    pub fn from_sse_data(data: &str) -> Option<Self> {
        if data.trim() == "[DONE]" {
            return None;
        }
        let frame: StreamFrame = serde_json::from_str(data).ok()?;
        let choice = frame.choices.into_iter().next()?;
        Some(Self {
            content_delta: choice.delta.content.unwrap_or_default(),
            is_final: choice.finish_reason.is_some(),
            provider_name: frame.provider,
            fallback_used: frame.fallback_used,
        })
    }
}

/// Outbound SSE frame payload.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamFrame {
    pub choices: Vec<FrameChoice>,
    pub provider: String,
    #[serde(rename = "fallbackUsed")]
    pub fallback_used: bool,
}

/// A streaming choice delta.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FrameChoice {
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

/// Delta content in streaming response.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Delta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Split a complete relay response body into events.
///
/// Returns the decoded events and whether the `[DONE]` marker was seen.
pub fn decode_sse_body(body: &str) -> (Vec<StreamEvent>, bool) {
    let mut events = Vec::new();
    let mut done = false;
    for line in body.lines() {
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.strip_prefix(' ').unwrap_or(data);
        if data == "[DONE]" {
            done = true;
            continue;
        }
        if let Some(event) = StreamEvent::from_sse_data(data) {
            events.push(event);
        }
    }
    (events, done)
}
