//! Pipeline configuration.
//!
//! Configuration for the orchestrator and its components: retry policy,
//! fetch heuristics, capability models, the generation pool bound, storage,
//! and the worker pool.

use std::time::Duration;

use thiserror::Error;

use crate::fetch::DEFAULT_MIN_CONTENT_CHARS;
use crate::generate::DEFAULT_MAX_CONCURRENT;
use crate::pipeline::retry::RetryPolicy;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the pipeline orchestrator.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    // Stage retry settings
    /// Maximum attempts per stage.
    pub stage_max_attempts: u32,
    /// Base backoff delay after the first failed stage attempt.
    pub stage_base_delay: Duration,
    /// Upper bound on a single backoff delay.
    pub stage_max_delay: Duration,

    // Fetch settings
    /// Per-request timeout for the static fetch.
    pub fetch_timeout: Duration,
    /// Per-request timeout for the rendered fetch.
    pub render_timeout: Duration,
    /// Minimum visible-text length below which the static result is
    /// treated as a client-side shell.
    pub min_content_chars: usize,

    // Capability settings
    /// Model used for structured extraction.
    pub extraction_model: String,
    /// Model used for answer generation.
    pub generation_model: String,
    /// Attempt ceiling for a single generation task.
    pub task_max_attempts: u32,
    /// Bound on concurrent generation calls across all runs.
    pub max_concurrent_generations: usize,

    // Storage settings
    /// PostgreSQL connection URL.
    pub database_url: String,

    // Worker settings
    /// Number of run-driving workers.
    pub num_workers: usize,
    /// Age after which a non-terminal run counts as abandoned and is
    /// re-enqueued by the recovery sweep.
    pub stale_run_after: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_max_attempts: 5,
            stage_base_delay: Duration::from_secs(2),
            stage_max_delay: Duration::from_secs(60),

            fetch_timeout: Duration::from_secs(30),
            render_timeout: Duration::from_secs(60),
            min_content_chars: DEFAULT_MIN_CONTENT_CHARS,

            extraction_model: String::new(),
            generation_model: String::new(),
            task_max_attempts: 3,
            max_concurrent_generations: DEFAULT_MAX_CONCURRENT,

            database_url: "postgres://localhost/applyforge".to_string(),

            num_workers: 2,
            stale_run_after: Duration::from_secs(300),
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `PIPELINE_STAGE_MAX_ATTEMPTS`: Maximum attempts per stage (default: 5)
    /// - `PIPELINE_STAGE_BASE_DELAY_SECS`: Base backoff delay (default: 2)
    /// - `PIPELINE_STAGE_MAX_DELAY_SECS`: Backoff delay cap (default: 60)
    /// - `PIPELINE_FETCH_TIMEOUT_SECS`: Static fetch timeout (default: 30)
    /// - `PIPELINE_RENDER_TIMEOUT_SECS`: Rendered fetch timeout (default: 60)
    /// - `PIPELINE_MIN_CONTENT_CHARS`: Shell heuristic threshold (default: 500)
    /// - `PIPELINE_EXTRACTION_MODEL`: Extraction model (default: client default)
    /// - `PIPELINE_GENERATION_MODEL`: Generation model (default: client default)
    /// - `PIPELINE_TASK_MAX_ATTEMPTS`: Generation task attempt ceiling (default: 3)
    /// - `PIPELINE_MAX_CONCURRENT_GENERATIONS`: Generation pool bound (default: 8)
    /// - `DATABASE_URL`: PostgreSQL connection URL (required)
    /// - `PIPELINE_NUM_WORKERS`: Run-driving workers (default: 2)
    /// - `PIPELINE_STALE_RUN_SECS`: Abandoned-run threshold (default: 300)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if `DATABASE_URL` is missing or a variable has
    /// an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("PIPELINE_STAGE_MAX_ATTEMPTS") {
            config.stage_max_attempts = parse_env_value(&val, "PIPELINE_STAGE_MAX_ATTEMPTS")?;
        }
        if let Ok(val) = std::env::var("PIPELINE_STAGE_BASE_DELAY_SECS") {
            let secs: u64 = parse_env_value(&val, "PIPELINE_STAGE_BASE_DELAY_SECS")?;
            config.stage_base_delay = Duration::from_secs(secs);
        }
        if let Ok(val) = std::env::var("PIPELINE_STAGE_MAX_DELAY_SECS") {
            let secs: u64 = parse_env_value(&val, "PIPELINE_STAGE_MAX_DELAY_SECS")?;
            config.stage_max_delay = Duration::from_secs(secs);
        }
        if let Ok(val) = std::env::var("PIPELINE_FETCH_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "PIPELINE_FETCH_TIMEOUT_SECS")?;
            config.fetch_timeout = Duration::from_secs(secs);
        }
        if let Ok(val) = std::env::var("PIPELINE_RENDER_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "PIPELINE_RENDER_TIMEOUT_SECS")?;
            config.render_timeout = Duration::from_secs(secs);
        }
        if let Ok(val) = std::env::var("PIPELINE_MIN_CONTENT_CHARS") {
            config.min_content_chars = parse_env_value(&val, "PIPELINE_MIN_CONTENT_CHARS")?;
        }
        if let Ok(val) = std::env::var("PIPELINE_EXTRACTION_MODEL") {
            config.extraction_model = val;
        }
        if let Ok(val) = std::env::var("PIPELINE_GENERATION_MODEL") {
            config.generation_model = val;
        }
        if let Ok(val) = std::env::var("PIPELINE_TASK_MAX_ATTEMPTS") {
            config.task_max_attempts = parse_env_value(&val, "PIPELINE_TASK_MAX_ATTEMPTS")?;
        }
        if let Ok(val) = std::env::var("PIPELINE_MAX_CONCURRENT_GENERATIONS") {
            config.max_concurrent_generations =
                parse_env_value(&val, "PIPELINE_MAX_CONCURRENT_GENERATIONS")?;
        }
        config.database_url = std::env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?;
        if let Ok(val) = std::env::var("PIPELINE_NUM_WORKERS") {
            config.num_workers = parse_env_value(&val, "PIPELINE_NUM_WORKERS")?;
        }
        if let Ok(val) = std::env::var("PIPELINE_STALE_RUN_SECS") {
            let secs: u64 = parse_env_value(&val, "PIPELINE_STALE_RUN_SECS")?;
            config.stale_run_after = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stage_max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "stage_max_attempts must be at least 1".to_string(),
            ));
        }
        if self.task_max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "task_max_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_generations == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_generations must be at least 1".to_string(),
            ));
        }
        if self.num_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "num_workers must be at least 1".to_string(),
            ));
        }
        if self.database_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_url must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// The stage-level retry policy implied by this configuration.
    pub fn stage_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.stage_max_attempts)
            .with_base_delay(self.stage_base_delay)
            .with_max_delay(self.stage_max_delay)
    }

    /// The per-task retry policy implied by this configuration.
    pub fn task_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.task_max_attempts)
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(self.stage_max_delay)
    }
}

/// Parses an environment variable value with a typed error.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.stage_max_attempts, 5);
        assert_eq!(config.task_max_attempts, 3);
        assert_eq!(config.max_concurrent_generations, DEFAULT_MAX_CONCURRENT);
        assert_eq!(config.min_content_chars, DEFAULT_MIN_CONTENT_CHARS);
    }

    #[test]
    fn test_validation_rejects_zero_attempts() {
        let mut config = PipelineConfig::default();
        config.stage_max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.task_max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_pool() {
        let mut config = PipelineConfig::default();
        config.max_concurrent_generations = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.num_workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_empty_database_url() {
        let mut config = PipelineConfig::default();
        config.database_url = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stage_policy_mirrors_config() {
        let mut config = PipelineConfig::default();
        config.stage_max_attempts = 7;
        config.stage_base_delay = Duration::from_secs(3);
        config.stage_max_delay = Duration::from_secs(45);

        let policy = config.stage_policy();
        assert_eq!(policy.max_attempts, 7);
        assert_eq!(policy.base_delay, Duration::from_secs(3));
        assert_eq!(policy.max_delay, Duration::from_secs(45));
    }

    #[test]
    fn test_task_policy_uses_task_ceiling() {
        let mut config = PipelineConfig::default();
        config.task_max_attempts = 4;
        assert_eq!(config.task_policy().max_attempts, 4);
    }

    #[test]
    fn test_parse_env_value() {
        let parsed: u32 = parse_env_value("42", "KEY").unwrap();
        assert_eq!(parsed, 42);

        let err = parse_env_value::<u32>("not-a-number", "KEY").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        assert!(err.to_string().contains("KEY"));
    }
}
