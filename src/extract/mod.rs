//! Structured question extraction from fetched page content.
//!
//! The adapter sends the page text to the extraction capability with a
//! fixed instruction contract, recovers a JSON array from the (possibly
//! prose-wrapped) response, and validates the result into typed
//! [`ExtractedQuestion`] records.

pub mod question;
pub mod repair;

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{CapabilityError, ExtractionError};
use crate::llm::{CompletionProvider, CompletionRequest, Message};

pub use question::{ExtractedQuestion, QuestionKind};

/// Maximum characters of page content sent to the capability. Postings are
/// short; anything beyond this is navigation or legal boilerplate.
const MAX_CONTENT_CHARS: usize = 24_000;

/// System prompt for the extraction capability.
const EXTRACTION_SYSTEM_PROMPT: &str = "You extract application questions from job and \
scholarship postings. Output only a JSON array, no prose.";

/// Instruction contract for the extraction capability.
const EXTRACTION_PROMPT: &str = r#"
Extract every application question from the posting below.

Return a JSON array where each element is an object:
  {"text": "<the question>", "kind": "<short_answer|essay|experience|education|skills|custom>", "required": <true|false>}

Rules:
1. Include implicit questions (e.g. "describe your experience with X").
2. Do not invent questions that are not in the posting.
3. Use "custom" when no other kind fits.

Posting:
{content}
"#;

/// Raw question element as returned by the capability, before validation.
#[derive(Debug, Deserialize)]
struct RawQuestion {
    #[serde(default)]
    text: String,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    required: Option<bool>,
    #[serde(default)]
    order: Option<u32>,
}

/// Adapter over the structured-extraction capability.
pub struct ExtractionAdapter {
    provider: Arc<dyn CompletionProvider>,
    model: String,
}

impl ExtractionAdapter {
    /// Creates an adapter over the given capability backend.
    pub fn new(provider: Arc<dyn CompletionProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }

    /// Extracts typed questions from page content.
    ///
    /// # Errors
    ///
    /// - Transport/availability failures of the capability are transient and
    ///   propagate for the stage retry policy to handle.
    /// - Output that cannot be recovered as a question array after the one
    ///   repair attempt is a permanent `Unparseable` failure.
    /// - An output that parses but holds no usable question is a permanent
    ///   `NoQuestions` failure.
    pub async fn extract(&self, content: &str) -> Result<Vec<ExtractedQuestion>, ExtractionError> {
        let bounded: String = content.chars().take(MAX_CONTENT_CHARS).collect();
        let prompt = EXTRACTION_PROMPT.replace("{content}", &bounded);

        let request = CompletionRequest::new(
            self.model.clone(),
            vec![
                Message::system(EXTRACTION_SYSTEM_PROMPT),
                Message::user(prompt),
            ],
        )
        .with_temperature(0.0)
        .with_max_tokens(2000);

        let response = self.provider.complete(request).await?;
        let raw = response
            .first_content()
            .ok_or_else(|| {
                ExtractionError::Capability(CapabilityError::ParseError(
                    "No content in capability response".to_string(),
                ))
            })?
            .to_string();

        parse_questions(&raw)
    }
}

/// Parses and validates capability output into typed questions.
///
/// The upstream capability is non-deterministic, so this step never retries
/// on shape problems; it either recovers a valid array or fails permanently.
pub fn parse_questions(raw: &str) -> Result<Vec<ExtractedQuestion>, ExtractionError> {
    let values = repair::parse_array(raw).ok_or_else(|| ExtractionError::unparseable(raw))?;

    let mut questions = Vec::with_capacity(values.len());
    for (position, value) in values.into_iter().enumerate() {
        let raw_question: RawQuestion = match serde_json::from_value(value) {
            Ok(q) => q,
            Err(e) => {
                debug!(position, error = %e, "Skipping non-object array element");
                continue;
            }
        };

        let text = raw_question.text.trim().to_string();
        if text.is_empty() {
            warn!(position, "Dropping extracted element with empty text");
            continue;
        }

        let kind = raw_question
            .kind
            .as_deref()
            .map(QuestionKind::coerce)
            .unwrap_or(QuestionKind::Custom);

        questions.push(ExtractedQuestion {
            text,
            kind,
            required: raw_question.required.unwrap_or(false),
            order: raw_question.order.unwrap_or(position as u32),
        });
    }

    if questions.is_empty() {
        return Err(ExtractionError::NoQuestions);
    }

    // Re-assign order sequentially so indices stay dense even when the
    // capability supplied its own (possibly gappy) ordering.
    questions.sort_by_key(|q| q.order);
    for (idx, question) in questions.iter_mut().enumerate() {
        question.order = idx as u32;
    }

    Ok(questions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Choice, CompletionResponse, Usage};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Capability stub returning a fixed body.
    struct FixedProvider {
        body: String,
        calls: AtomicU32,
    }

    impl FixedProvider {
        fn new(body: &str) -> Self {
            Self {
                body: body.to_string(),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl CompletionProvider for FixedProvider {
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(CompletionResponse {
                model: "stub".to_string(),
                choices: vec![Choice {
                    index: 0,
                    message: Message::assistant(self.body.clone()),
                    finish_reason: "stop".to_string(),
                }],
                usage: Usage::default(),
            })
        }
    }

    #[test]
    fn test_parse_questions_clean_array() {
        let raw = r#"[
            {"text": "Why this role?", "kind": "essay", "required": true},
            {"text": "Years of Rust?", "kind": "short_answer", "required": false}
        ]"#;

        let questions = parse_questions(raw).unwrap();
        assert_eq!(questions.len(), 2);
        assert_eq!(questions[0].text, "Why this role?");
        assert_eq!(questions[0].kind, QuestionKind::Essay);
        assert!(questions[0].required);
        assert_eq!(questions[0].order, 0);
        assert_eq!(questions[1].order, 1);
    }

    #[test]
    fn test_parse_questions_unknown_kind_coerced_not_dropped() {
        let raw = r#"[{"text": "Describe your motivation", "kind": "motivation_statement"}]"#;

        let questions = parse_questions(raw).unwrap();
        assert_eq!(questions.len(), 1);
        assert_eq!(questions[0].kind, QuestionKind::Custom);
    }

    #[test]
    fn test_parse_questions_missing_fields_defaulted() {
        let raw = r#"[{"text": "Just a question"}]"#;

        let questions = parse_questions(raw).unwrap();
        assert_eq!(questions[0].kind, QuestionKind::Custom);
        assert!(!questions[0].required);
        assert_eq!(questions[0].order, 0);
    }

    #[test]
    fn test_parse_questions_empty_text_rejected() {
        let raw = r#"[{"text": "  "}, {"text": "Real question"}]"#;

        let questions = parse_questions(raw).unwrap();
        assert_eq!(questions.len(), 1);
        assert_eq!(questions[0].text, "Real question");
        assert_eq!(questions[0].order, 0);
    }

    #[test]
    fn test_parse_questions_order_reassigned_densely() {
        let raw = r#"[
            {"text": "b", "order": 7},
            {"text": "a", "order": 2}
        ]"#;

        let questions = parse_questions(raw).unwrap();
        assert_eq!(questions[0].text, "a");
        assert_eq!(questions[0].order, 0);
        assert_eq!(questions[1].text, "b");
        assert_eq!(questions[1].order, 1);
    }

    #[test]
    fn test_parse_questions_prose_and_trailing_comma() {
        let raw = "Here you go:\n```json\n[{\"text\": \"Why us?\", \"kind\": \"essay\",},]\n```";
        let questions = parse_questions(raw).unwrap();
        assert_eq!(questions.len(), 1);
    }

    #[test]
    fn test_parse_questions_unparseable_is_permanent() {
        let err = parse_questions("I could not find any structured data, sorry!").unwrap_err();
        assert!(matches!(err, ExtractionError::Unparseable { .. }));
        assert_eq!(err.class(), crate::error::ErrorClass::Permanent);
    }

    #[test]
    fn test_parse_questions_empty_array_is_no_questions() {
        let err = parse_questions("[]").unwrap_err();
        assert!(matches!(err, ExtractionError::NoQuestions));
    }

    #[tokio::test]
    async fn test_extract_end_to_end_with_stub() {
        let provider = Arc::new(FixedProvider::new(
            r#"[{"text": "Why this role?", "kind": "essay", "required": true}]"#,
        ));
        let adapter = ExtractionAdapter::new(provider.clone(), "stub-model");

        let questions = adapter
            .extract("We are hiring. Why this role? Apply now.")
            .await
            .unwrap();

        assert_eq!(questions.len(), 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_extract_transport_error_is_transient() {
        struct FailingProvider;

        #[async_trait]
        impl CompletionProvider for FailingProvider {
            async fn complete(
                &self,
                _request: CompletionRequest,
            ) -> Result<CompletionResponse, CapabilityError> {
                Err(CapabilityError::RequestFailed("connection reset".into()))
            }
        }

        let adapter = ExtractionAdapter::new(Arc::new(FailingProvider), "stub-model");
        let err = adapter.extract("content").await.unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Transient);
    }
}
