//! OpenAI-compatible completion client.
//!
//! This module provides the HTTP client used for both capability calls
//! (structured extraction and answer generation). The wire format is the
//! common `/chat/completions` contract so any compatible gateway can stand
//! behind it.

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::CapabilityError;

/// Default per-request timeout for capability calls.
///
/// Kept well below the stage retry budget so a hung call cannot stall a
/// stage past the policy's total patience.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(90);

/// A message in a conversation with the capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message sender ("system", "user", "assistant").
    pub role: String,
    /// Content of the message.
    pub content: String,
}

impl Message {
    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Request for a completion from the capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Model identifier; empty string means the client's default.
    pub model: String,
    /// Conversation messages.
    pub messages: Vec<Message>,
    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Maximum number of tokens to generate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    /// Create a new request with default sampling parameters.
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
        }
    }

    /// Set the temperature for this request.
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the max tokens for this request.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Response from a completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Model that produced this response.
    pub model: String,
    /// Generated choices.
    pub choices: Vec<Choice>,
    /// Token usage statistics.
    pub usage: Usage,
}

impl CompletionResponse {
    /// Get the content of the first choice, if available.
    pub fn first_content(&self) -> Option<&str> {
        self.choices.first().map(|c| c.message.content.as_str())
    }
}

/// A single generated choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    /// Index of this choice in the response.
    pub index: u32,
    /// Generated message.
    pub message: Message,
    /// Reason the generation stopped ("stop", "length", "content_filter").
    pub finish_reason: String,
}

/// Token usage statistics for a completion request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    /// Number of tokens in the prompt.
    pub prompt_tokens: u32,
    /// Number of tokens generated.
    pub completion_tokens: u32,
    /// Total tokens used.
    pub total_tokens: u32,
}

/// Trait for capability backends that can produce completions.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Produce a completion for the given request.
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, CapabilityError>;
}

/// HTTP client for OpenAI-compatible capability gateways.
pub struct OpenAiCompatClient {
    /// Base URL for the API.
    api_base: String,
    /// Optional API key for authentication.
    api_key: Option<String>,
    /// Default model used when a request leaves `model` empty.
    default_model: String,
    /// HTTP client for making API requests.
    http_client: Client,
}

impl OpenAiCompatClient {
    /// Create a new client with explicit configuration.
    ///
    /// # Arguments
    ///
    /// * `api_base` - Base URL for the API (e.g. "http://localhost:4000/v1")
    /// * `api_key` - Optional API key for authentication
    /// * `default_model` - Model used when a request does not name one
    pub fn new(api_base: String, api_key: Option<String>, default_model: String) -> Self {
        Self::with_timeout(api_base, api_key, default_model, DEFAULT_CALL_TIMEOUT)
    }

    /// Create a new client with an explicit per-call timeout.
    pub fn with_timeout(
        api_base: String,
        api_key: Option<String>,
        default_model: String,
        timeout: Duration,
    ) -> Self {
        Self {
            api_base,
            api_key,
            default_model,
            http_client: Client::builder()
                .timeout(timeout)
                .build()
                .expect("Failed to build HTTP client"),
        }
    }

    /// Create a new client from environment variables.
    ///
    /// Reads the following environment variables:
    /// - `LLM_API_BASE`: Base URL for the API (required)
    /// - `LLM_API_KEY`: API key for authentication (optional)
    /// - `LLM_DEFAULT_MODEL`: Default model (defaults to "gpt-4o-mini")
    ///
    /// # Errors
    ///
    /// Returns `CapabilityError::MissingApiBase` if `LLM_API_BASE` is not set.
    pub fn from_env() -> Result<Self, CapabilityError> {
        let api_base = env::var("LLM_API_BASE").map_err(|_| CapabilityError::MissingApiBase)?;
        let api_key = env::var("LLM_API_KEY").ok();
        let default_model =
            env::var("LLM_DEFAULT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

        Ok(Self::new(api_base, api_key, default_model))
    }

    /// Get the API base URL.
    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    /// Get the default model.
    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Check if an API key is configured.
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

/// Internal request structure for the OpenAI-compatible API.
#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

/// Internal response structure from the OpenAI-compatible API.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    model: String,
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Usage,
}

/// Internal choice structure from the API response.
#[derive(Debug, Deserialize)]
struct ApiChoice {
    index: u32,
    message: Message,
    finish_reason: String,
}

/// Error response from the API.
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

/// Error detail from the API.
#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: Option<String>,
}

/// Returns whether an API error detail describes a policy rejection.
fn is_policy_rejection(detail: &ApiErrorDetail) -> bool {
    detail
        .error_type
        .as_deref()
        .is_some_and(|t| t.contains("policy") || t.contains("content_filter"))
        || detail.message.to_lowercase().contains("content policy")
}

#[async_trait]
impl CompletionProvider for OpenAiCompatClient {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, CapabilityError> {
        let model = if request.model.is_empty() {
            self.default_model.clone()
        } else {
            request.model.clone()
        };

        let api_request = ApiRequest {
            model,
            messages: request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let url = format!("{}/chat/completions", self.api_base);

        let mut http_request = self
            .http_client
            .post(&url)
            .header("Content-Type", "application/json");

        if let Some(ref api_key) = self.api_key {
            http_request = http_request.header("Authorization", format!("Bearer {}", api_key));
        }

        let http_response = http_request
            .json(&api_request)
            .send()
            .await
            .map_err(|e| CapabilityError::RequestFailed(e.to_string()))?;

        let status = http_response.status();

        if !status.is_success() {
            let status_code = status.as_u16();

            let error_text = http_response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());

            if let Ok(error_response) = serde_json::from_str::<ApiErrorResponse>(&error_text) {
                if status_code == 429 {
                    return Err(CapabilityError::RateLimited(error_response.error.message));
                }
                if is_policy_rejection(&error_response.error) {
                    return Err(CapabilityError::PolicyRejected(
                        error_response.error.message,
                    ));
                }
                return Err(CapabilityError::ApiError {
                    code: status_code,
                    message: error_response.error.message,
                });
            }

            return Err(CapabilityError::ApiError {
                code: status_code,
                message: error_text,
            });
        }

        let api_response: ApiResponse = http_response.json().await.map_err(|e| {
            CapabilityError::ParseError(format!("Failed to parse API response: {}", e))
        })?;

        // A content_filter finish reason is a policy rejection delivered as
        // a 200; surface it as such so it is never retried.
        if let Some(filtered) = api_response
            .choices
            .iter()
            .find(|c| c.finish_reason == "content_filter")
        {
            return Err(CapabilityError::PolicyRejected(format!(
                "choice {} was content-filtered",
                filtered.index
            )));
        }

        let choices = api_response
            .choices
            .into_iter()
            .map(|choice| Choice {
                index: choice.index,
                message: choice.message,
                finish_reason: choice.finish_reason,
            })
            .collect();

        Ok(CompletionResponse {
            model: api_response.model,
            choices,
            usage: api_response.usage,
        })
    }
}
