//! Typed question records produced by extraction.

use serde::{Deserialize, Serialize};

/// The kind of an application question.
///
/// Unknown kinds coming back from the capability are coerced to `Custom`
/// rather than dropped, so a question is never silently lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    /// A short free-text answer.
    ShortAnswer,
    /// A long-form essay answer.
    Essay,
    /// Asks about work experience.
    Experience,
    /// Asks about education history.
    Education,
    /// Asks about skills.
    Skills,
    /// Anything that does not match a known kind.
    Custom,
}

impl QuestionKind {
    /// Parses a kind string, coercing unknown values to `Custom`.
    pub fn coerce(s: &str) -> QuestionKind {
        match s.trim().to_lowercase().as_str() {
            "short_answer" | "short-answer" | "short" => QuestionKind::ShortAnswer,
            "essay" | "long_answer" => QuestionKind::Essay,
            "experience" => QuestionKind::Experience,
            "education" => QuestionKind::Education,
            "skills" | "skill" => QuestionKind::Skills,
            _ => QuestionKind::Custom,
        }
    }

    /// Stable string form used in logs and the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionKind::ShortAnswer => "short_answer",
            QuestionKind::Essay => "essay",
            QuestionKind::Experience => "experience",
            QuestionKind::Education => "education",
            QuestionKind::Skills => "skills",
            QuestionKind::Custom => "custom",
        }
    }
}

impl std::fmt::Display for QuestionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One application question extracted from a posting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedQuestion {
    /// The question text; always non-empty.
    pub text: String,
    /// The question kind.
    pub kind: QuestionKind,
    /// Whether the posting marks the question as required.
    pub required: bool,
    /// Position of the question within the posting, 0-based.
    pub order: u32,
}

impl ExtractedQuestion {
    /// Creates a question.
    pub fn new(text: impl Into<String>, kind: QuestionKind, required: bool, order: u32) -> Self {
        Self {
            text: text.into(),
            kind,
            required,
            order,
        }
    }
}
