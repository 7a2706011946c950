//! Run and task definitions for the pipeline.
//!
//! This module defines the core records tracked by the state store:
//!
//! - `PipelineRun`: one end-to-end execution for a submitted URL
//! - `Stage`: the run's position in the state machine
//! - `GenerationTask`: one unit of fan-out work for a single question
//! - `RunStatus`: the poll-only view exposed to the presentation layer

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorClass;

/// A stage in the run's state machine.
///
/// Stages only move forward; the single exception is an explicit retry of
/// the *current* stage, which re-executes without changing the recorded
/// stage. `Complete` and `Failed` are terminal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Fetch the submitted URL's content.
    Fetch,
    /// Derive structured questions from the fetched content.
    Extract,
    /// Commit the extracted questions.
    PersistQuestions,
    /// Fan out one generation task per question.
    Generate,
    /// Commit the answers of all succeeded tasks.
    PersistAnswers,
    /// The run finished; answers (possibly a partial set) are available.
    Complete,
    /// The run stopped after exhausting a stage's retry budget,
    /// on a permanent error, or by cancellation.
    Failed,
}

impl Stage {
    /// Returns the stage that follows this one on the success path.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Fetch => Some(Stage::Extract),
            Stage::Extract => Some(Stage::PersistQuestions),
            Stage::PersistQuestions => Some(Stage::Generate),
            Stage::Generate => Some(Stage::PersistAnswers),
            Stage::PersistAnswers => Some(Stage::Complete),
            Stage::Complete | Stage::Failed => None,
        }
    }

    /// Returns whether the stage is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Complete | Stage::Failed)
    }

    /// Stable string form used in logs and the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::Extract => "extract",
            Stage::PersistQuestions => "persist_questions",
            Stage::Generate => "generate",
            Stage::PersistAnswers => "persist_answers",
            Stage::Complete => "complete",
            Stage::Failed => "failed",
        }
    }

    /// Parses the stable string form.
    pub fn parse(s: &str) -> Option<Stage> {
        match s {
            "fetch" => Some(Stage::Fetch),
            "extract" => Some(Stage::Extract),
            "persist_questions" => Some(Stage::PersistQuestions),
            "generate" => Some(Stage::Generate),
            "persist_answers" => Some(Stage::PersistAnswers),
            "complete" => Some(Stage::Complete),
            "failed" => Some(Stage::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Terminal failure details recorded on a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    /// The stage that failed.
    pub stage: Stage,
    /// Classification of the final error.
    pub class: ErrorClass,
    /// Human-readable description of the final error.
    pub message: String,
}

impl RunFailure {
    /// Creates a failure record.
    pub fn new(stage: Stage, class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            stage,
            class,
            message: message.into(),
        }
    }

    /// Creates a cancellation record for the given stage.
    pub fn cancelled(stage: Stage) -> Self {
        Self {
            stage,
            class: ErrorClass::Permanent,
            message: "cancelled by user".to_string(),
        }
    }

    /// Returns whether this failure came from user cancellation.
    pub fn is_cancellation(&self) -> bool {
        self.message == "cancelled by user"
    }
}

/// One end-to-end pipeline execution for a submitted URL.
///
/// The run id doubles as the idempotency key for the whole run. Stage and
/// per-stage attempt counts are durably persisted after every transition so
/// a restarted orchestrator resumes at the last recorded stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Unique identifier; idempotency key for the run.
    pub id: Uuid,
    /// The submitted posting URL.
    pub source_url: String,
    /// Opaque reference to the submitting user.
    pub user_ref: String,
    /// Current stage in the state machine.
    pub stage: Stage,
    /// Attempt counter per stage.
    #[serde(default)]
    pub attempts: BTreeMap<Stage, u32>,
    /// Set when the user requests cancellation; honoured cooperatively
    /// at the next stage boundary.
    #[serde(default)]
    pub cancel_requested: bool,
    /// Terminal failure details, set when `stage` is `Failed`.
    #[serde(default)]
    pub failure: Option<RunFailure>,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// When the run was last updated.
    pub updated_at: DateTime<Utc>,
}

impl PipelineRun {
    /// Creates a new run at the initial `Fetch` stage.
    pub fn new(source_url: impl Into<String>, user_ref: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            source_url: source_url.into(),
            user_ref: user_ref.into(),
            stage: Stage::Fetch,
            attempts: BTreeMap::new(),
            cancel_requested: false,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the attempt count recorded for a stage.
    pub fn attempts_for(&self, stage: Stage) -> u32 {
        self.attempts.get(&stage).copied().unwrap_or(0)
    }

    /// Returns whether the run has reached a terminal stage.
    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    /// Returns how long ago the run was created.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}

/// Status of a single generation task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet claimed by a worker.
    Pending,
    /// Claimed; the external call may be in flight.
    Running,
    /// An answer was produced (from the capability or the cache).
    Succeeded,
    /// Terminal failure after the task's attempt ceiling or a permanent error.
    Failed,
}

impl TaskStatus {
    /// Returns whether the status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }

    /// Stable string form used in logs and the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }

    /// Parses the stable string form.
    pub fn parse(s: &str) -> Option<TaskStatus> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "succeeded" => Some(TaskStatus::Succeeded),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One unit of fan-out work: generate an answer for a single question.
///
/// A task is identified by `(run_id, question_order)`. The recorded
/// `context_digest` lets identical `(question, context)` pairs be recognized
/// as duplicates even across retried runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationTask {
    /// The run this task belongs to.
    pub run_id: Uuid,
    /// Order index of the question within the run.
    pub question_order: u32,
    /// Hex digest of the context bundle used for this task.
    pub context_digest: String,
    /// Current status.
    pub status: TaskStatus,
    /// Number of execution attempts so far.
    pub attempt_count: u32,
    /// The generated answer, present when `status` is `Succeeded`.
    #[serde(default)]
    pub answer: Option<String>,
    /// The final error, present when `status` is `Failed`.
    #[serde(default)]
    pub error: Option<String>,
}

impl GenerationTask {
    /// Creates a new pending task.
    pub fn pending(run_id: Uuid, question_order: u32, context_digest: impl Into<String>) -> Self {
        Self {
            run_id,
            question_order,
            context_digest: context_digest.into(),
            status: TaskStatus::Pending,
            attempt_count: 0,
            answer: None,
            error: None,
        }
    }

    /// Returns whether the task has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// A persisted draft answer for one question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    /// Order index of the answered question within the run.
    pub question_order: u32,
    /// The draft answer text.
    pub text: String,
    /// When the answer was generated.
    pub generated_at: DateTime<Utc>,
}

impl Answer {
    /// Creates an answer stamped with the current time.
    pub fn new(question_order: u32, text: impl Into<String>) -> Self {
        Self {
            question_order,
            text: text.into(),
            generated_at: Utc::now(),
        }
    }
}

/// Outcome of one stage attempt, kept in the attempt history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The attempt succeeded.
    Succeeded,
    /// The attempt failed; retryable if the class is transient.
    Failed {
        /// Retry classification of the failure.
        class: ErrorClass,
        /// Error description.
        message: String,
    },
}

impl AttemptOutcome {
    /// Creates a failed outcome.
    pub fn failed(class: ErrorClass, message: impl Into<String>) -> Self {
        AttemptOutcome::Failed {
            class,
            message: message.into(),
        }
    }
}

/// One entry in a run's attempt history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// The stage that was attempted.
    pub stage: Stage,
    /// 1-based attempt number within the stage.
    pub attempt: u32,
    /// What happened.
    pub outcome: AttemptOutcome,
    /// When the attempt finished.
    pub at: DateTime<Utc>,
}

/// Poll-only progress view for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatus {
    /// The run being reported.
    pub run_id: Uuid,
    /// Current stage.
    pub stage: Stage,
    /// Number of questions extracted so far.
    pub questions_extracted: u32,
    /// Number of tasks that produced an answer.
    pub answers_generated: u32,
    /// Number of tasks that terminally failed.
    pub answers_failed: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_forward_order() {
        let mut stage = Stage::Fetch;
        let mut seen = vec![stage];
        while let Some(next) = stage.next() {
            seen.push(next);
            stage = next;
        }

        assert_eq!(
            seen,
            vec![
                Stage::Fetch,
                Stage::Extract,
                Stage::PersistQuestions,
                Stage::Generate,
                Stage::PersistAnswers,
                Stage::Complete,
            ]
        );
    }

    #[test]
    fn test_stage_terminality() {
        assert!(Stage::Complete.is_terminal());
        assert!(Stage::Failed.is_terminal());
        assert!(!Stage::Fetch.is_terminal());
        assert!(!Stage::Generate.is_terminal());
        assert!(Stage::Failed.next().is_none());
    }

    #[test]
    fn test_stage_string_roundtrip() {
        for stage in [
            Stage::Fetch,
            Stage::Extract,
            Stage::PersistQuestions,
            Stage::Generate,
            Stage::PersistAnswers,
            Stage::Complete,
            Stage::Failed,
        ] {
            assert_eq!(Stage::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(Stage::parse("bogus"), None);
    }

    #[test]
    fn test_run_new() {
        let run = PipelineRun::new("https://example.com/job/42", "user-1");

        assert!(!run.id.is_nil());
        assert_eq!(run.stage, Stage::Fetch);
        assert_eq!(run.attempts_for(Stage::Fetch), 0);
        assert!(!run.cancel_requested);
        assert!(run.failure.is_none());
        assert!(!run.is_terminal());
    }

    #[test]
    fn test_run_serialization_roundtrip() {
        let mut run = PipelineRun::new("https://example.com/job/42", "user-1");
        run.attempts.insert(Stage::Fetch, 2);

        let json = serde_json::to_string(&run).expect("serialization should work");
        let parsed: PipelineRun =
            serde_json::from_str(&json).expect("deserialization should work");

        assert_eq!(parsed.id, run.id);
        assert_eq!(parsed.stage, Stage::Fetch);
        assert_eq!(parsed.attempts_for(Stage::Fetch), 2);
    }

    #[test]
    fn test_run_failure_cancellation() {
        let failure = RunFailure::cancelled(Stage::Generate);
        assert!(failure.is_cancellation());
        assert_eq!(failure.class, ErrorClass::Permanent);

        let failure = RunFailure::new(Stage::Fetch, ErrorClass::Transient, "timeout");
        assert!(!failure.is_cancellation());
    }

    #[test]
    fn test_task_status_terminality() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
    }

    #[test]
    fn test_task_status_string_roundtrip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Succeeded,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_generation_task_pending() {
        let run_id = Uuid::new_v4();
        let task = GenerationTask::pending(run_id, 3, "abc123");

        assert_eq!(task.run_id, run_id);
        assert_eq!(task.question_order, 3);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempt_count, 0);
        assert!(!task.is_terminal());
    }

    #[test]
    fn test_attempt_outcome_serialization() {
        let outcome = AttemptOutcome::failed(ErrorClass::Transient, "HTTP 503");
        let json = serde_json::to_string(&outcome).expect("serialization should work");
        assert!(json.contains("failed"));
        assert!(json.contains("Transient"));

        let parsed: AttemptOutcome =
            serde_json::from_str(&json).expect("deserialization should work");
        assert_eq!(parsed, outcome);
    }

    #[test]
    fn test_display_forms() {
        assert_eq!(format!("{}", Stage::PersistAnswers), "persist_answers");
        assert_eq!(format!("{}", TaskStatus::Succeeded), "succeeded");
    }
}
