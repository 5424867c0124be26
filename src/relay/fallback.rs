//! Ordered provider fallback.
//!
//! Adapters are tried strictly in configuration order, one at a time. The
//! first adapter that starts a response wins and its stream is forwarded.
//! When every adapter fails to start, the degraded-mode message is streamed
//! instead, so a valid request always gets a complete stream.

use bytes::Bytes;
use futures::{FutureExt, Stream, StreamExt};
use std::convert::Infallible;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use super::degraded::{self, DEGRADED_PROVIDER, EMERGENCY_PROVIDER};
use super::stream::{normalize, EventStream};
use super::types::{ChatRequest, StreamEvent, DONE_FRAME};
use crate::config::RelayConfig;
use crate::providers::ProviderAdapter;

/// Runtime knobs for the relay, taken from `[relay]`.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub idle_timeout: Duration,
    pub degraded_chunk_delay: Duration,
    pub fallback_notice: bool,
}

impl RelaySettings {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout(),
            degraded_chunk_delay: config.degraded_chunk_delay(),
            fallback_notice: config.fallback_notice,
        }
    }
}

/// Position of a request in the fallback cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Adapter `i` is being invoked.
    Trying(usize),
    /// Adapter `i` started a response.
    Succeeded(usize),
    /// No adapter could start a response.
    Exhausted,
}

/// State following a failure of adapter `failed` in a chain of `len`.
pub fn next_state(failed: usize, len: usize) -> RelayState {
    if failed + 1 < len {
        RelayState::Trying(failed + 1)
    } else {
        RelayState::Exhausted
    }
}

/// A provider that failed to start, for logs and notices.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub provider_name: String,
    pub reason: &'static str,
}

/// Result of one relay run.
///
/// `events` is lazy: nothing past the response start is read from the
/// provider until the stream is polled.
pub struct RelayOutcome {
    pub provider: String,
    pub fallback_used: bool,
    pub state: RelayState,
    pub attempts: Vec<AttemptRecord>,
    pub events: EventStream,
}

impl RelayOutcome {
    /// Outcome for a failure outside the provider chain.
    pub fn emergency(delay: Duration) -> Self {
        Self {
            provider: EMERGENCY_PROVIDER.to_string(),
            fallback_used: true,
            state: RelayState::Exhausted,
            attempts: Vec::new(),
            events: degraded::emergency(delay),
        }
    }

    /// Replace the rest of the stream with the emergency message if reading
    /// it panics. Content already yielded stays with the caller.
    pub fn catch_stream_panics(mut self, delay: Duration) -> Self {
        let mut events = self.events;
        self.events = Box::pin(async_stream::stream! {
            loop {
                match AssertUnwindSafe(events.next()).catch_unwind().await {
                    Ok(Some(event)) => yield event,
                    Ok(None) => break,
                    Err(_) => {
                        tracing::error!("Relay stream panicked, streaming emergency message");
                        let mut emergency = degraded::emergency(delay);
                        while let Some(event) = emergency.next().await {
                            yield event;
                        }
                        break;
                    }
                }
            }
        });
        self
    }

    pub fn is_degraded(&self) -> bool {
        self.state == RelayState::Exhausted
    }

    /// Encode the events as SSE frames followed by the `[DONE]` marker.
    pub fn into_sse_body(self) -> impl Stream<Item = Result<Bytes, Infallible>> + Send {
        self.events
            .map(|event| Ok::<_, Infallible>(event.to_sse_bytes()))
            .chain(futures::stream::once(async {
                Ok::<_, Infallible>(Bytes::from_static(DONE_FRAME))
            }))
    }
}

/// Announcement inserted before the first content of a substituted provider.
pub fn fallback_notice(failed: &[AttemptRecord], next: &str) -> String {
    let previous = failed
        .iter()
        .map(|a| a.provider_name.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    let verb = if failed.len() > 1 { "are" } else { "is" };
    format!(
        "🔄 **Assistant GENIA - Switching to {next}**\n\n{previous} {verb} temporarily unavailable, continuing with {next}...\n\n"
    )
}

/// Ordered cascade over provider adapters.
pub struct FallbackRelay {
    adapters: Vec<Arc<dyn ProviderAdapter>>,
    settings: RelaySettings,
}

impl FallbackRelay {
    pub fn new(adapters: Vec<Arc<dyn ProviderAdapter>>, settings: RelaySettings) -> Self {
        Self { adapters, settings }
    }

    /// Adapters in priority order.
    pub fn adapters(&self) -> &[Arc<dyn ProviderAdapter>] {
        &self.adapters
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// Relay a chat request, inserting a notice on substitution if enabled.
    pub async fn relay(&self, request: &ChatRequest) -> RelayOutcome {
        self.run(request, self.settings.fallback_notice).await
    }

    /// Relay without any notice event, for callers that consume the text.
    pub async fn relay_without_notice(&self, request: &ChatRequest) -> RelayOutcome {
        self.run(request, false).await
    }

    async fn run(&self, request: &ChatRequest, notice: bool) -> RelayOutcome {
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut state = if self.adapters.is_empty() {
            RelayState::Exhausted
        } else {
            RelayState::Trying(0)
        };

        while let RelayState::Trying(i) = state {
            let adapter = &self.adapters[i];
            tracing::debug!(provider = %adapter.name(), attempt = i + 1, "Invoking provider");

            match adapter.invoke(request).await {
                Ok(raw) => {
                    let provider = adapter.name().to_string();
                    let fallback_used = i > 0;
                    let events = normalize(
                        provider.clone(),
                        adapter.format(),
                        fallback_used,
                        raw,
                        self.settings.idle_timeout,
                    );

                    let events: EventStream = if fallback_used && notice {
                        let text = fallback_notice(&attempts, &provider);
                        let first = StreamEvent::content(text, provider.as_str(), true);
                        Box::pin(futures::stream::once(async move { first }).chain(events))
                    } else {
                        events
                    };

                    if fallback_used {
                        tracing::info!(
                            provider = %provider,
                            failed = attempts.len(),
                            "Fallback provider started streaming"
                        );
                    } else {
                        tracing::debug!(provider = %provider, "Primary provider started streaming");
                    }

                    return RelayOutcome {
                        provider,
                        fallback_used,
                        state: RelayState::Succeeded(i),
                        attempts,
                        events,
                    };
                }
                Err(e) => {
                    tracing::warn!(
                        provider = %adapter.name(),
                        kind = e.kind(),
                        error = %e,
                        "Provider unavailable"
                    );
                    attempts.push(AttemptRecord {
                        provider_name: adapter.name().to_string(),
                        reason: e.kind(),
                    });
                    state = next_state(i, self.adapters.len());
                }
            }
        }

        tracing::warn!(attempted = attempts.len(), "Provider chain exhausted");
        RelayOutcome {
            provider: DEGRADED_PROVIDER.to_string(),
            fallback_used: true,
            state: RelayState::Exhausted,
            attempts,
            events: degraded::emit(self.settings.degraded_chunk_delay),
        }
    }
}
