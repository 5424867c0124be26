//! Stream normalization.
//!
//! Turns a provider's raw SSE body into an ordered sequence of
//! [`StreamEvent`]s. Lines are reassembled across TCP chunk boundaries;
//! malformed frames are skipped. Every normalized sequence ends with
//! exactly one terminal event, synthesized if the provider never sent one.

use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::pin::Pin;
use std::time::Duration;

use super::types::StreamEvent;
use crate::config::WireFormat;
use crate::providers::ByteStream;

/// Lines longer than this without a newline are discarded.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Ordered, lazily produced relay events.
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Line reassembly buffer for SSE bodies.
///
/// Buffers raw bytes across chunk boundaries and yields complete lines,
/// without their `\n` / `\r\n` terminator. Lines that are not valid UTF-8
/// are dropped.
#[derive(Default)]
pub(crate) struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(line) = decode_line(&raw[..raw.len() - 1]) {
                lines.push(line);
            }
        }

        if self.buffer.len() > MAX_LINE_BYTES {
            tracing::warn!(
                buffered = self.buffer.len(),
                "SSE line exceeded buffer cap, discarding"
            );
            self.buffer.clear();
        }

        lines
    }

    /// Flush any trailing bytes as a final line.
    pub fn finish(self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        decode_line(&self.buffer)
    }
}

fn decode_line(raw: &[u8]) -> Option<String> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    match std::str::from_utf8(raw) {
        Ok(line) => Some(line.to_string()),
        Err(_) => {
            tracing::debug!("Skipping SSE line with invalid UTF-8");
            None
        }
    }
}

/// Payload of a `data:` line, with or without the space after the colon.
///
/// Other SSE fields (`event:`, `id:`, `retry:`) and comments yield `None`.
fn data_payload(line: &str) -> Option<&str> {
    let data = line.strip_prefix("data:")?;
    Some(data.strip_prefix(' ').unwrap_or(data))
}

/// A single parsed upstream frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Frame {
    /// Incremental text, possibly carrying the end of the response.
    Delta { content: String, is_final: bool },
    /// The `[DONE]` sentinel.
    Done,
    /// Upstream reported an error inside the stream.
    Failed(String),
    /// Not a content frame (malformed JSON, keep-alives, metadata).
    Skip,
}

#[derive(Deserialize)]
struct OpenAiChunk {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    #[serde(default)]
    delta: Option<OpenAiDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    delta: Option<AnthropicDelta>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct AnthropicDelta {
    #[serde(default)]
    text: Option<String>,
}

/// Parse the payload of one `data:` line for the given wire format.
pub(crate) fn parse_data(format: WireFormat, data: &str) -> Frame {
    if data.trim() == "[DONE]" {
        return Frame::Done;
    }

    match format {
        WireFormat::OpenAi | WireFormat::Mistral => {
            let Ok(chunk) = serde_json::from_str::<OpenAiChunk>(data) else {
                return Frame::Skip;
            };
            let Some(choice) = chunk.choices.into_iter().next() else {
                return Frame::Skip;
            };
            Frame::Delta {
                content: choice.delta.and_then(|d| d.content).unwrap_or_default(),
                is_final: choice.finish_reason.is_some(),
            }
        }
        WireFormat::Anthropic => {
            let Ok(event) = serde_json::from_str::<AnthropicEvent>(data) else {
                return Frame::Skip;
            };
            match event.kind.as_str() {
                "message_stop" => Frame::Delta {
                    content: String::new(),
                    is_final: true,
                },
                "error" => Frame::Failed(
                    event
                        .error
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "unknown error".to_string()),
                ),
                _ => match event.delta.and_then(|d| d.text) {
                    Some(text) => Frame::Delta {
                        content: text,
                        is_final: false,
                    },
                    None => Frame::Skip,
                },
            }
        }
    }
}

fn parse_lines(format: WireFormat, lines: impl IntoIterator<Item = String>) -> Vec<Frame> {
    lines
        .into_iter()
        .filter_map(|line| data_payload(&line).map(|data| parse_data(format, data)))
        .filter(|frame| *frame != Frame::Skip)
        .collect()
}

/// Normalize a provider body into relay events.
///
/// The sequence closes after the first terminal frame (`finish_reason`,
/// `message_stop` or `[DONE]`); the rest of the upstream body is not read
/// and the connection is released. If the body ends, fails, or stays silent
/// longer than `idle_timeout` first, a synthetic terminal event is emitted.
pub fn normalize(
    provider: String,
    format: WireFormat,
    fallback_used: bool,
    raw: ByteStream,
    idle_timeout: Duration,
) -> EventStream {
    Box::pin(async_stream::stream! {
        let mut raw = raw;
        let mut lines = SseLineBuffer::new();

        loop {
            let (frames, ended) = match tokio::time::timeout(idle_timeout, raw.next()).await {
                Ok(Some(Ok(bytes))) => (parse_lines(format, lines.push(&bytes)), false),
                Ok(None) => {
                    let tail = std::mem::take(&mut lines).finish();
                    (parse_lines(format, tail), true)
                }
                Ok(Some(Err(e))) => {
                    tracing::warn!(provider = %provider, error = %e, "Provider stream failed mid-response");
                    (Vec::new(), true)
                }
                Err(_) => {
                    tracing::warn!(provider = %provider, timeout = ?idle_timeout, "Provider stream went idle");
                    (Vec::new(), true)
                }
            };

            for frame in frames {
                match frame {
                    Frame::Delta { content, is_final: false } => {
                        if !content.is_empty() {
                            yield StreamEvent::content(content, provider.as_str(), fallback_used);
                        }
                    }
                    Frame::Delta { content, is_final: true } => {
                        yield StreamEvent {
                            content_delta: content,
                            is_final: true,
                            provider_name: provider.clone(),
                            fallback_used,
                        };
                        return;
                    }
                    Frame::Done => {
                        yield StreamEvent::terminal(provider.as_str(), fallback_used);
                        return;
                    }
                    Frame::Failed(message) => {
                        tracing::warn!(provider = %provider, error = %message, "Provider reported error mid-stream");
                        yield StreamEvent::terminal(provider.as_str(), fallback_used);
                        return;
                    }
                    Frame::Skip => {}
                }
            }

            if ended {
                tracing::debug!(provider = %provider, "Provider stream ended without terminal frame");
                break;
            }
        }

        yield StreamEvent::terminal(provider.as_str(), fallback_used);
    })
}
