//! Learner work evaluation.
//!
//! Runs a single-turn assessment through the same provider chain as chat,
//! collects the streamed text and, for graded contexts, pulls a score out of
//! it with a deliberately loose pattern that existing score displays rely on.

use futures::StreamExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::error::Error;
use crate::relay::fallback::FallbackRelay;
use crate::relay::types::{ChatRequest, Message, Role};

pub const EVALUATION_TEMPERATURE: f32 = 0.3;
pub const EVALUATION_MAX_TOKENS: u32 = 1200;

/// Provider reported when no provider could evaluate.
pub const UNAVAILABLE_PROVIDER: &str = "fallback";

const UNAVAILABLE_MESSAGE: &str = "Evaluation temporarily unavailable.

Your work has been saved and will be evaluated as soon as the AI service is back.

In the meantime, keep learning - every module remains accessible!

*Automatic GENIA message*";

const QUIZ_PROMPT: &str = "You are GENIA, a teaching assistant specialized in generative AI.

Style: supportive, constructive, progressive.

Evaluate this quiz answer and provide:
1. Score out of 100
2. Strengths (2-3 items)
3. Areas to improve (1-2 items)
4. Recommendation for what comes next
5. Personal encouragement

Format: clear structure with distinct sections.
Tone: professional but encouraging.";

const PRACTICE_PROMPT: &str = "You are GENIA, an expert in prompt engineering and generative AI.

Analyze this prompt written by the student according to:
1. Clarity of instructions (0-25 points)
2. Specificity of context (0-25 points)
3. Defined output format (0-25 points)
4. Creativity/innovation (0-25 points)

Give an overall score /100 and concrete improvement suggestions with examples.";

const THEORY_PROMPT: &str = "You are GENIA, an expert generative AI educator.

Answer this question or reflection with:
- Clear concepts with analogies
- Concrete, practical examples
- Logical progression
- Business applications
- Openings to go further

Tone: accessible expert, not a distant lecturer.";

/// Kind of work being evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationContext {
    Quiz,
    Practice,
    Theory,
}

impl EvaluationContext {
    /// Unknown values evaluate as theory.
    pub fn parse(value: &str) -> Self {
        match value {
            "quiz" => EvaluationContext::Quiz,
            "practice" => EvaluationContext::Practice,
            _ => EvaluationContext::Theory,
        }
    }

    pub fn system_prompt(&self) -> &'static str {
        match self {
            EvaluationContext::Quiz => QUIZ_PROMPT,
            EvaluationContext::Practice => PRACTICE_PROMPT,
            EvaluationContext::Theory => THEORY_PROMPT,
        }
    }

    /// Whether a score is extracted from the answer.
    pub fn is_scored(&self) -> bool {
        matches!(self, EvaluationContext::Quiz | EvaluationContext::Practice)
    }
}

/// Inbound body of `POST /api/ai/evaluate`.
#[derive(Debug, Clone, Deserialize)]
pub struct EvaluationRequest {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<serde_json::Value>,
    #[serde(rename = "moduleId", default)]
    pub module_id: Option<serde_json::Value>,
    #[serde(rename = "lessonId", default)]
    pub lesson_id: Option<serde_json::Value>,
}

/// A validated evaluation.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub prompt: String,
    pub context: EvaluationContext,
    pub session_id: String,
    pub module_id: Option<String>,
    pub lesson_id: Option<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Session ids may be any non-empty, non-zero, non-false JSON value.
fn present(value: Option<serde_json::Value>) -> Option<serde_json::Value> {
    value.filter(|v| match v {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64() != Some(0.0),
        serde_json::Value::String(s) => !s.trim().is_empty(),
        _ => true,
    })
}

/// Ids may arrive as strings or numbers.
fn tag(value: Option<serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Null => None,
        other => Some(other.to_string()),
    }
}

impl TryFrom<EvaluationRequest> for Evaluation {
    type Error = Error;

    fn try_from(raw: EvaluationRequest) -> Result<Self, Self::Error> {
        let (Some(prompt), Some(context), Some(session_id)) = (
            non_blank(raw.prompt),
            non_blank(raw.context),
            tag(present(raw.session_id)),
        ) else {
            return Err(Error::InvalidRequest(
                "prompt, context and sessionId are required".to_string(),
            ));
        };

        Ok(Self {
            prompt,
            context: EvaluationContext::parse(&context),
            session_id,
            module_id: tag(raw.module_id),
            lesson_id: tag(raw.lesson_id),
        })
    }
}

/// Body of the evaluation response.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationResponse {
    pub response: String,
    pub provider: String,
    pub score: Option<u32>,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<bool>,
}

impl EvaluationResponse {
    fn completed(response: String, provider: String, score: Option<u32>) -> Self {
        Self {
            response,
            provider,
            score,
            timestamp: chrono::Utc::now().to_rfc3339(),
            success: Some(true),
            error: None,
        }
    }

    fn unavailable() -> Self {
        Self {
            response: UNAVAILABLE_MESSAGE.to_string(),
            provider: UNAVAILABLE_PROVIDER.to_string(),
            score: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
            success: None,
            error: Some(true),
        }
    }
}

fn score_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?:score|Score).*?(\d{1,3})(?:/100|%|\s)").expect("score pattern is valid")
    })
}

/// First 1-3 digit number after "score"/"Score" that is followed by `/100`,
/// `%` or whitespace. `None` when nothing matches.
pub fn extract_score(text: &str) -> Option<u32> {
    score_pattern()
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Chat request sent to the provider chain for an evaluation.
pub fn build_request(evaluation: &Evaluation) -> ChatRequest {
    let header = format!(
        "Session {} - Module {} - Lesson {}",
        evaluation.session_id,
        evaluation.module_id.as_deref().unwrap_or("-"),
        evaluation.lesson_id.as_deref().unwrap_or("-"),
    );
    let mut request = ChatRequest::new(vec![
        Message::new(Role::System, evaluation.context.system_prompt()),
        Message::new(
            Role::User,
            format!("{}\n\nStudent content:\n{}", header, evaluation.prompt),
        ),
    ]);
    request.temperature = Some(EVALUATION_TEMPERATURE);
    request.max_tokens = Some(EVALUATION_MAX_TOKENS);
    request.session_id = Some(evaluation.session_id.clone());
    request.module_context = evaluation.module_id.clone();
    request.lesson_context = evaluation.lesson_id.clone();
    request.stream = Some(true);
    request
}

/// Evaluate learner work. Never fails: an exhausted chain yields the static
/// "unavailable" answer.
pub async fn evaluate(relay: &FallbackRelay, evaluation: &Evaluation) -> EvaluationResponse {
    let request = build_request(evaluation);
    let outcome = relay.relay_without_notice(&request).await;

    if outcome.is_degraded() {
        tracing::warn!(session = %evaluation.session_id, "Evaluation unavailable, no provider answered");
        return EvaluationResponse::unavailable();
    }

    let provider = outcome.provider;
    let text: String = outcome
        .events
        .map(|event| event.content_delta)
        .collect()
        .await;

    let score = if evaluation.context.is_scored() {
        extract_score(&text)
    } else {
        None
    };

    tracing::info!(
        session = %evaluation.session_id,
        provider = %provider,
        score = ?score,
        "Evaluation completed"
    );
    EvaluationResponse::completed(text, provider, score)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_extraction() {
        assert_eq!(extract_score("Score : 87/100"), Some(87));
        assert_eq!(extract_score("Your overall score is 92 % on this quiz"), Some(92));
        assert_eq!(extract_score("score=45\nwell done"), Some(45));
        assert_eq!(extract_score("Great work, 90/100!"), None);
        assert_eq!(extract_score("Score: excellent"), None);
    }

    #[test]
    fn score_extraction_keeps_its_quirks() {
        // Four digits: the lazy prefix skips ahead to the last digits before "/100"
        assert_eq!(extract_score("Score: 1000/100"), Some(0));
        // Number at end of text without a trailing delimiter
        assert_eq!(extract_score("Score: 75"), None);
    }

    #[test]
    fn context_parsing() {
        assert_eq!(EvaluationContext::parse("quiz"), EvaluationContext::Quiz);
        assert_eq!(EvaluationContext::parse("practice"), EvaluationContext::Practice);
        assert_eq!(EvaluationContext::parse("theory"), EvaluationContext::Theory);
        assert_eq!(EvaluationContext::parse("essay"), EvaluationContext::Theory);
        assert!(EvaluationContext::Quiz.is_scored());
        assert!(!EvaluationContext::Theory.is_scored());
    }

    #[test]
    fn required_fields_are_checked() {
        let raw: EvaluationRequest =
            serde_json::from_str(r#"{"prompt":"my answer","context":"quiz"}"#).unwrap();
        assert!(matches!(
            Evaluation::try_from(raw),
            Err(Error::InvalidRequest(_))
        ));

        let raw: EvaluationRequest = serde_json::from_str(
            r#"{"prompt":"my answer","context":"quiz","sessionId":"s1","moduleId":3,"lessonId":"l-2"}"#,
        )
        .unwrap();
        let evaluation = Evaluation::try_from(raw).unwrap();
        assert_eq!(evaluation.module_id.as_deref(), Some("3"));
        assert_eq!(evaluation.lesson_id.as_deref(), Some("l-2"));
    }

    #[test]
    fn numeric_session_id_is_accepted() {
        let raw: EvaluationRequest =
            serde_json::from_str(r#"{"prompt":"my answer","context":"theory","sessionId":42}"#)
                .unwrap();
        let evaluation = Evaluation::try_from(raw).unwrap();
        assert_eq!(evaluation.session_id, "42");
    }

    #[test]
    fn falsy_session_ids_are_rejected() {
        for session in ["0", "false", "null", r#""  ""#] {
            let body = format!(
                r#"{{"prompt":"my answer","context":"quiz","sessionId":{}}}"#,
                session
            );
            let raw: EvaluationRequest = serde_json::from_str(&body).unwrap();
            assert!(
                matches!(Evaluation::try_from(raw), Err(Error::InvalidRequest(_))),
                "accepted sessionId {}",
                session
            );
        }
    }

    #[test]
    fn request_carries_prompt_and_settings() {
        let evaluation = Evaluation {
            prompt: "Explain attention".to_string(),
            context: EvaluationContext::Practice,
            session_id: "s1".to_string(),
            module_id: Some("2".to_string()),
            lesson_id: None,
        };
        let request = build_request(&evaluation);
        assert_eq!(request.system_prompt(), Some(PRACTICE_PROMPT));
        let user = request.conversation().next().unwrap().content.as_str();
        assert!(user.starts_with("Session s1 - Module 2 - Lesson -"));
        assert!(user.ends_with("Explain attention"));
        assert_eq!(request.temperature(), EVALUATION_TEMPERATURE);
        assert_eq!(request.max_tokens(), EVALUATION_MAX_TOKENS);
    }
}
