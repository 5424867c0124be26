//! Degraded mode: canned messages streamed word by word when no provider
//! can answer.

use std::time::Duration;

use super::stream::EventStream;
use super::types::StreamEvent;

/// Provider name reported while every adapter is unavailable.
pub const DEGRADED_PROVIDER: &str = "system-fallback";

/// Provider name reported after an unexpected internal failure.
pub const EMERGENCY_PROVIDER: &str = "emergency-fallback";

pub const DEGRADED_MESSAGE: &str = "🤖 **Assistant GENIA - Degraded Mode**

All our AI services are temporarily overloaded, but your learning goes on!

**In the meantime:**
• Re-read this lesson carefully, every detail counts
• Write down your questions
• Test yourself by rephrasing the concepts in your own words

*I'll be right back! 💪*";

pub const EMERGENCY_MESSAGE: &str = "🤖 **Assistant GENIA - Full Degraded Mode**

An unexpected technical error occurred, but your training continues!

**Let's keep going:**
• Review the concepts of this lesson
• Note your questions for our next conversation
• Explore the practical examples provided
• Check your understanding with the exercises

**Learning never stops at GENIA!** 🚀

*All systems will be back online shortly.* ✨";

/// Split on single spaces, keeping a trailing space on every chunk.
///
/// Newlines stay inside their chunk so paragraphs survive reassembly.
pub fn word_chunks(message: &str) -> Vec<String> {
    message.split(' ').map(|word| format!("{} ", word)).collect()
}

/// Stream `message` as word chunks, pausing `delay` after each one, then
/// close with a terminal event.
///
/// Dropping the returned stream cancels any pending pause.
pub fn synthetic_stream(message: &'static str, provider: &'static str, delay: Duration) -> EventStream {
    Box::pin(async_stream::stream! {
        for chunk in word_chunks(message) {
            yield StreamEvent::content(chunk, provider, true);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        yield StreamEvent::terminal(provider, true);
    })
}

/// Degraded-mode message for an exhausted provider chain.
pub fn emit(delay: Duration) -> EventStream {
    synthetic_stream(DEGRADED_MESSAGE, DEGRADED_PROVIDER, delay)
}

/// Emergency message for failures outside the provider chain.
pub fn emergency(delay: Duration) -> EventStream {
    synthetic_stream(EMERGENCY_MESSAGE, EMERGENCY_PROVIDER, delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn chunks_rebuild_message_with_trailing_space() {
        let chunks = word_chunks("Hello  brave\nnew world");
        assert_eq!(chunks, vec!["Hello ", " ", "brave\nnew ", "world "]);
        assert_eq!(chunks.concat(), "Hello  brave\nnew world ");
    }

    #[tokio::test(start_paused = true)]
    async fn degraded_stream_paces_every_chunk() {
        let delay = Duration::from_millis(50);
        let expected = word_chunks(DEGRADED_MESSAGE);
        let started = tokio::time::Instant::now();

        let events: Vec<StreamEvent> = emit(delay).collect().await;

        assert_eq!(events.len(), expected.len() + 1);
        for (event, chunk) in events.iter().zip(&expected) {
            assert_eq!(&event.content_delta, chunk);
            assert!(!event.is_final);
            assert_eq!(event.provider_name, DEGRADED_PROVIDER);
            assert!(event.fallback_used);
        }
        let last = events.last().unwrap();
        assert!(last.is_final);
        assert!(last.content_delta.is_empty());
        assert_eq!(started.elapsed(), delay * expected.len() as u32);
    }

    #[tokio::test(start_paused = true)]
    async fn next_chunk_waits_for_delay() {
        let mut stream = emergency(Duration::from_secs(1));
        let first = stream.next().await.unwrap();
        assert_eq!(first.provider_name, EMERGENCY_PROVIDER);
        assert_eq!(first.content_delta, "🤖 ");

        let early = tokio::time::timeout(Duration::from_millis(500), stream.next()).await;
        assert!(early.is_err());
        drop(stream);
    }

    #[tokio::test]
    async fn zero_delay_emits_immediately() {
        let events: Vec<StreamEvent> = emit(Duration::ZERO).collect().await;
        let text: String = events.iter().map(|e| e.content_delta.as_str()).collect();
        assert_eq!(text.trim_end(), DEGRADED_MESSAGE);
    }
}
