//! Error types for applyforge operations.
//!
//! Defines error types for the major subsystems:
//! - Content fetching (static and rendered)
//! - Structured question extraction
//! - Answer generation
//! - Capability (external AI service) calls
//!
//! Every error that can reach the orchestrator carries an [`ErrorClass`] so
//! that retry decisions are a pure function of `(stage, attempt, class)`
//! rather than exception-driven control flow.

use thiserror::Error;

/// Classification of a failure for retry purposes.
///
/// Transient failures (timeouts, 5xx responses, rate limits) are retried
/// according to the stage's backoff policy. Permanent failures (malformed
/// input, validation failures, policy rejections) terminate the stage
/// immediately without consuming further retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorClass {
    /// The operation may succeed if retried.
    Transient,
    /// Retrying will not help; the failure is final.
    Permanent,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Permanent => write!(f, "permanent"),
        }
    }
}

/// Errors that can occur while calling an external capability
/// (structured extraction or answer generation).
#[derive(Debug, Error)]
pub enum CapabilityError {
    /// Missing API base URL: LLM_API_BASE environment variable not set.
    #[error("Missing API base URL: LLM_API_BASE environment variable not set")]
    MissingApiBase,

    /// HTTP transport failed (connect error, timeout, interrupted body).
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    /// The capability rate-limited the request.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// The capability rejected the request on policy grounds.
    #[error("Policy rejection: {0}")]
    PolicyRejected(String),

    /// Failed to parse the capability response.
    #[error("Failed to parse capability response: {0}")]
    ParseError(String),

    /// The capability returned a non-success status.
    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },
}

impl CapabilityError {
    /// Returns the retry classification for this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            CapabilityError::RequestFailed(_) | CapabilityError::RateLimited(_) => {
                ErrorClass::Transient
            }
            CapabilityError::ApiError { code, .. } if *code >= 500 => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        }
    }
}

/// Errors that can occur while fetching page content.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The submitted URL could not be parsed.
    #[error("Invalid URL '{0}'")]
    InvalidUrl(String),

    /// HTTP transport failed (connect error, timeout, interrupted body).
    #[error("Request failed: {0}")]
    RequestFailed(String),

    /// The server answered with a non-success status.
    #[error("HTTP {status} for {url}")]
    Status { status: u16, url: String },

    /// The rendering service failed.
    #[error("Rendered fetch failed: {0}")]
    RenderFailed(String),

    /// No usable content after every applicable fetch method.
    #[error("No usable content for {url}: {reason}")]
    EmptyContent { url: String, reason: String },
}

impl FetchError {
    /// Returns the retry classification for this error.
    ///
    /// Transport failures and server-side statuses are transient; a page
    /// that yields no usable content after both methods will not improve on
    /// retry and is permanent.
    pub fn class(&self) -> ErrorClass {
        match self {
            FetchError::RequestFailed(_) | FetchError::RenderFailed(_) => ErrorClass::Transient,
            FetchError::Status { status, .. } if *status >= 500 || *status == 429 => {
                ErrorClass::Transient
            }
            _ => ErrorClass::Permanent,
        }
    }
}

/// Errors that can occur while extracting questions from page content.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// The upstream capability call failed.
    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),

    /// The capability output could not be parsed as a question array,
    /// even after the repair attempt.
    #[error("Unparseable extraction output: {preview}")]
    Unparseable {
        /// The raw capability output, kept for diagnosis.
        raw: String,
        /// Short preview used in the error message.
        preview: String,
    },

    /// The output parsed but contained no usable questions.
    #[error("Extraction produced no usable questions")]
    NoQuestions,
}

impl ExtractionError {
    /// Builds an `Unparseable` error from the raw capability output.
    pub fn unparseable(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let preview: String = raw.chars().take(80).collect();
        ExtractionError::Unparseable { raw, preview }
    }

    /// Returns the retry classification for this error.
    ///
    /// Only transport/availability failures of the capability itself are
    /// transient. Successfully returned but oddly-shaped output is permanent:
    /// the adapter already spent its one repair attempt on it.
    pub fn class(&self) -> ErrorClass {
        match self {
            ExtractionError::Capability(e) => e.class(),
            ExtractionError::Unparseable { .. } | ExtractionError::NoQuestions => {
                ErrorClass::Permanent
            }
        }
    }
}

/// Errors that can occur while generating an answer for a single question.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// The upstream capability call failed.
    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),

    /// The capability returned a response with no text content.
    #[error("Capability returned an empty completion")]
    EmptyCompletion,
}

impl GenerationError {
    /// Returns the retry classification for this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            GenerationError::Capability(e) => e.class(),
            // An empty-but-successful completion is oddly-shaped output,
            // not an availability problem.
            GenerationError::EmptyCompletion => ErrorClass::Permanent,
        }
    }
}

/// Errors that can occur while assembling the user's context bundle.
#[derive(Debug, Error)]
pub enum ContextError {
    /// The document-processing subsystem is temporarily unavailable.
    #[error("Context source unavailable: {0}")]
    Unavailable(String),

    /// No document data exists for the user.
    #[error("No context data for user '{0}'")]
    NotFound(String),
}

impl ContextError {
    /// Returns the retry classification for this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            ContextError::Unavailable(_) => ErrorClass::Transient,
            ContextError::NotFound(_) => ErrorClass::Permanent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_class_display() {
        assert_eq!(format!("{}", ErrorClass::Transient), "transient");
        assert_eq!(format!("{}", ErrorClass::Permanent), "permanent");
    }

    #[test]
    fn test_capability_error_classification() {
        assert_eq!(
            CapabilityError::RequestFailed("timeout".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            CapabilityError::RateLimited("slow down".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            CapabilityError::ApiError {
                code: 503,
                message: "overloaded".into()
            }
            .class(),
            ErrorClass::Transient
        );
        assert_eq!(
            CapabilityError::ApiError {
                code: 400,
                message: "bad request".into()
            }
            .class(),
            ErrorClass::Permanent
        );
        assert_eq!(
            CapabilityError::PolicyRejected("disallowed".into()).class(),
            ErrorClass::Permanent
        );
        assert_eq!(
            CapabilityError::ParseError("garbage".into()).class(),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn test_fetch_error_classification() {
        assert_eq!(
            FetchError::RequestFailed("timed out".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            FetchError::Status {
                status: 502,
                url: "https://example.com".into()
            }
            .class(),
            ErrorClass::Transient
        );
        assert_eq!(
            FetchError::Status {
                status: 429,
                url: "https://example.com".into()
            }
            .class(),
            ErrorClass::Transient
        );
        assert_eq!(
            FetchError::Status {
                status: 404,
                url: "https://example.com".into()
            }
            .class(),
            ErrorClass::Permanent
        );
        assert_eq!(
            FetchError::EmptyContent {
                url: "https://example.com".into(),
                reason: "50 chars after rendered fetch".into()
            }
            .class(),
            ErrorClass::Permanent
        );
        assert_eq!(
            FetchError::InvalidUrl("not a url".into()).class(),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn test_extraction_error_classification() {
        let transport = ExtractionError::Capability(CapabilityError::RequestFailed("down".into()));
        assert_eq!(transport.class(), ErrorClass::Transient);

        let unparseable = ExtractionError::unparseable("here you go: [{broken");
        assert_eq!(unparseable.class(), ErrorClass::Permanent);

        assert_eq!(ExtractionError::NoQuestions.class(), ErrorClass::Permanent);
    }

    #[test]
    fn test_extraction_unparseable_preview_truncates() {
        let raw = "x".repeat(500);
        let err = ExtractionError::unparseable(raw.clone());
        match err {
            ExtractionError::Unparseable { raw: kept, preview } => {
                assert_eq!(kept.len(), 500);
                assert_eq!(preview.len(), 80);
            }
            _ => panic!("expected Unparseable"),
        }
    }

    #[test]
    fn test_generation_error_classification() {
        let rate_limited = GenerationError::Capability(CapabilityError::RateLimited("429".into()));
        assert_eq!(rate_limited.class(), ErrorClass::Transient);

        let rejected = GenerationError::Capability(CapabilityError::PolicyRejected("nope".into()));
        assert_eq!(rejected.class(), ErrorClass::Permanent);

        assert_eq!(
            GenerationError::EmptyCompletion.class(),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn test_context_error_classification() {
        assert_eq!(
            ContextError::Unavailable("maintenance".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            ContextError::NotFound("user-1".into()).class(),
            ErrorClass::Permanent
        );
    }
}
