//! Durable pipeline state.
//!
//! The [`StateStore`] trait is the persistence boundary from the pipeline's
//! point of view: run records, extracted questions, generation tasks, and
//! answers, all mutated through conditional writes keyed on the
//! last-observed stage or status. Two implementations are provided:
//!
//! - [`PostgresStateStore`]: production store backed by sqlx
//! - [`MemoryStateStore`]: in-memory store for tests and local runs

pub mod database;
pub mod memory;
pub mod migrations;
pub mod schema;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::extract::ExtractedQuestion;
use crate::fetch::FetchedContent;
use crate::pipeline::run::{
    Answer, AttemptOutcome, AttemptRecord, GenerationTask, PipelineRun, RunFailure, RunStatus,
    Stage, TaskStatus,
};

pub use database::PostgresStateStore;
pub use memory::MemoryStateStore;
pub use migrations::MigrationRunner;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection to the backing store failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// The requested run does not exist.
    #[error("Run {0} not found")]
    RunNotFound(Uuid),

    /// The requested task does not exist.
    #[error("Task {question_order} of run {run_id} not found")]
    TaskNotFound { run_id: Uuid, question_order: u32 },

    /// Serialization/deserialization of a stored value failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored value is malformed.
    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] migrations::MigrationError),
}

impl StoreError {
    /// Returns the retry classification for this error.
    ///
    /// Infrastructure failures are transient; missing or corrupt records
    /// will not improve on retry.
    pub fn class(&self) -> crate::error::ErrorClass {
        match self {
            StoreError::ConnectionFailed(_) | StoreError::QueryFailed(_) => {
                crate::error::ErrorClass::Transient
            }
            _ => crate::error::ErrorClass::Permanent,
        }
    }
}

/// The pipeline's persistence boundary.
///
/// All state transitions are conditional writes: callers state what they
/// believe the current stage/status is, and the store accepts the write only
/// if that belief still holds. This optimistic check is the only lock-like
/// discipline in the system and is what keeps racing workers from
/// duplicating side effects.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Creates a run at the initial `Fetch` stage and returns it.
    async fn create_run(&self, source_url: &str, user_ref: &str)
        -> Result<PipelineRun, StoreError>;

    /// Loads a run by id.
    async fn load_run(&self, run_id: Uuid) -> Result<PipelineRun, StoreError>;

    /// Advances a run's stage, conditional on its current stage.
    ///
    /// Returns `true` if the transition was accepted, `false` on a
    /// stale-state conflict (some other worker advanced the run first).
    async fn advance_stage(
        &self,
        run_id: Uuid,
        expected: Stage,
        new: Stage,
    ) -> Result<bool, StoreError>;

    /// Records the outcome of one stage attempt and bumps the stage's
    /// attempt counter.
    async fn record_attempt(
        &self,
        run_id: Uuid,
        stage: Stage,
        outcome: AttemptOutcome,
    ) -> Result<(), StoreError>;

    /// Marks a run failed, conditional on its current stage.
    ///
    /// Returns `false` on a stale-state conflict.
    async fn fail_run(
        &self,
        run_id: Uuid,
        expected: Stage,
        failure: RunFailure,
    ) -> Result<bool, StoreError>;

    /// Requests cooperative cancellation of a run.
    async fn request_cancel(&self, run_id: Uuid) -> Result<(), StoreError>;

    /// Persists the fetched page content for a run.
    async fn save_fetched_content(
        &self,
        run_id: Uuid,
        content: &FetchedContent,
    ) -> Result<(), StoreError>;

    /// Loads the fetched page content for a run, if any.
    async fn load_fetched_content(
        &self,
        run_id: Uuid,
    ) -> Result<Option<FetchedContent>, StoreError>;

    /// Persists the extracted questions for a run, replacing any prior set.
    async fn save_questions(
        &self,
        run_id: Uuid,
        questions: &[ExtractedQuestion],
    ) -> Result<(), StoreError>;

    /// Loads the extracted questions for a run, ordered by `order`.
    async fn load_questions(&self, run_id: Uuid) -> Result<Vec<ExtractedQuestion>, StoreError>;

    /// Creates a pending generation task if none exists for
    /// `(run_id, question_order)`. An existing task is left untouched so
    /// crash-replay never resets terminal work.
    async fn create_task_if_absent(&self, task: &GenerationTask) -> Result<(), StoreError>;

    /// Claims a task for execution, conditional on its current status.
    ///
    /// On success the task moves to `Running` with its attempt counter
    /// incremented. Returns `false` on a stale-state conflict.
    async fn claim_task(
        &self,
        run_id: Uuid,
        question_order: u32,
        expected: TaskStatus,
    ) -> Result<bool, StoreError>;

    /// Bumps a task's attempt counter without changing its status, used
    /// for in-claim retries of transient capability errors.
    async fn bump_task_attempt(&self, run_id: Uuid, question_order: u32)
        -> Result<(), StoreError>;

    /// Records a task's terminal outcome.
    async fn finish_task(
        &self,
        run_id: Uuid,
        question_order: u32,
        status: TaskStatus,
        answer: Option<String>,
        error: Option<String>,
    ) -> Result<(), StoreError>;

    /// Loads all generation tasks for a run, ordered by `question_order`.
    async fn load_tasks(&self, run_id: Uuid) -> Result<Vec<GenerationTask>, StoreError>;

    /// Persists answers for a run, replacing any prior set.
    async fn save_answers(&self, run_id: Uuid, answers: &[Answer]) -> Result<(), StoreError>;

    /// Loads the persisted answers for a run, ordered by question order.
    async fn load_answers(&self, run_id: Uuid) -> Result<Vec<Answer>, StoreError>;

    /// Returns the poll-only status view for a run.
    async fn run_status(&self, run_id: Uuid) -> Result<RunStatus, StoreError>;

    /// Returns a run's stage attempt history, oldest first.
    async fn attempt_history(&self, run_id: Uuid) -> Result<Vec<AttemptRecord>, StoreError>;

    /// Lists non-terminal runs whose last update is older than
    /// `stale_after_seconds`, for the workers' recovery sweep.
    async fn list_stale_runs(&self, stale_after_seconds: i64) -> Result<Vec<Uuid>, StoreError>;
}
