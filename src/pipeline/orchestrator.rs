//! Pipeline orchestrator: the run state machine.
//!
//! Drives a run through FETCH → EXTRACT → PERSIST_QUESTIONS → GENERATE →
//! PERSIST_ANSWERS → COMPLETE. Every transition goes through a conditional
//! write on the state store, so racing workers cannot double-advance a run,
//! and a restarted orchestrator resumes from the last recorded stage.
//!
//! Errors are recovered locally up to the stage's retry ceiling; beyond
//! that the failure and its classification are recorded on the run and
//! surfaced through the status boundary. Nothing is raised past this
//! module's public methods except store-level failures.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ContextError, ErrorClass, ExtractionError, FetchError};
use crate::extract::ExtractionAdapter;
use crate::fetch::ContentFetcher;
use crate::generate::{AnswerGenerator, ContextSource};
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::run::{
    Answer, AttemptOutcome, AttemptRecord, PipelineRun, RunFailure, RunStatus, Stage, TaskStatus,
};
use crate::storage::{StateStore, StoreError};

/// Errors that can escape the orchestrator's boundary.
///
/// Stage failures never appear here; they are recorded on the run. Only
/// infrastructure failures and invalid caller requests surface.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// State store failure.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Document-context boundary failure during a single-question retry.
    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    /// A single-question retry named a question the run does not have.
    #[error("Run {run_id} has no question {question_order}")]
    QuestionNotFound { run_id: Uuid, question_order: u32 },

    /// A single-question retry was requested on a run that has not
    /// completed.
    #[error("Run {run_id} is at stage '{stage}', not complete")]
    RunNotComplete { run_id: Uuid, stage: Stage },
}

/// Error produced by one attempt of one stage.
#[derive(Debug, Error)]
enum StageError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The run reached EXTRACT without stored page content.
    #[error("No fetched content recorded for run")]
    MissingContent,

    /// The run reached PERSIST_QUESTIONS with an empty question set.
    #[error("No questions recorded for run")]
    MissingQuestions,
}

impl StageError {
    fn class(&self) -> ErrorClass {
        match self {
            StageError::Fetch(e) => e.class(),
            StageError::Extraction(e) => e.class(),
            StageError::Context(e) => e.class(),
            StageError::Store(e) => e.class(),
            StageError::MissingContent | StageError::MissingQuestions => ErrorClass::Permanent,
        }
    }
}

/// The run state machine over its collaborating components.
pub struct JobOrchestrator {
    store: Arc<dyn StateStore>,
    fetcher: ContentFetcher,
    extractor: ExtractionAdapter,
    generator: AnswerGenerator,
    context_source: Arc<dyn ContextSource>,
    stage_policy: RetryPolicy,
}

impl JobOrchestrator {
    /// Creates an orchestrator over its components.
    pub fn new(
        store: Arc<dyn StateStore>,
        fetcher: ContentFetcher,
        extractor: ExtractionAdapter,
        generator: AnswerGenerator,
        context_source: Arc<dyn ContextSource>,
        stage_policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            fetcher,
            extractor,
            generator,
            context_source,
            stage_policy,
        }
    }

    /// The orchestrator's state store handle.
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Creates a run for a submitted URL. The caller is expected to hand
    /// the returned id to a worker (or call [`drive`](Self::drive)).
    pub async fn submit(
        &self,
        source_url: &str,
        user_ref: &str,
    ) -> Result<PipelineRun, OrchestratorError> {
        let run = self.store.create_run(source_url, user_ref).await?;
        info!(run_id = %run.id, url = %source_url, "Run submitted");
        Ok(run)
    }

    /// Drives a run from its recorded stage to a terminal stage.
    ///
    /// Safe to call concurrently from several workers and safe to re-enter
    /// after a crash: every stage transition is a conditional write, and
    /// the GENERATE stage re-checks each task's own state instead of
    /// recreating terminal tasks.
    pub async fn drive(&self, run_id: Uuid) -> Result<PipelineRun, OrchestratorError> {
        loop {
            let run = self.store.load_run(run_id).await?;

            if run.is_terminal() {
                return Ok(run);
            }

            if run.cancel_requested {
                let accepted = self
                    .store
                    .fail_run(run_id, run.stage, RunFailure::cancelled(run.stage))
                    .await?;
                if accepted {
                    info!(run_id = %run_id, stage = %run.stage, "Run cancelled");
                }
                continue;
            }

            self.run_stage(&run).await?;
        }
    }

    /// Executes the run's current stage with the retry policy, then either
    /// advances the run or marks it failed.
    async fn run_stage(&self, run: &PipelineRun) -> Result<(), OrchestratorError> {
        let stage = run.stage;
        // Resume the attempt budget from the persisted counter so a crashed
        // worker's attempts still count.
        let mut attempt = run.attempts_for(stage);

        loop {
            attempt += 1;

            match self.attempt_stage(run, stage).await {
                Ok(()) => {
                    self.store
                        .record_attempt(run.id, stage, AttemptOutcome::Succeeded)
                        .await?;
                    self.advance(run.id, stage).await?;
                    return Ok(());
                }
                Err(e) => {
                    let class = e.class();
                    self.store
                        .record_attempt(
                            run.id,
                            stage,
                            AttemptOutcome::failed(class, e.to_string()),
                        )
                        .await?;

                    let retryable =
                        class == ErrorClass::Transient && self.stage_policy.should_retry(attempt);
                    if !retryable {
                        warn!(
                            run_id = %run.id,
                            stage = %stage,
                            attempt,
                            class = %class,
                            error = %e,
                            "Stage failed terminally"
                        );
                        let failure = RunFailure::new(stage, class, e.to_string());
                        if !self.store.fail_run(run.id, stage, failure).await? {
                            info!(
                                run_id = %run.id,
                                stage = %stage,
                                "Run moved by another worker before failure could be recorded"
                            );
                        }
                        return Ok(());
                    }

                    let delay = self.stage_policy.delay_for(attempt);
                    warn!(
                        run_id = %run.id,
                        stage = %stage,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Stage attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;

                    // Cooperative cancellation between attempts.
                    if self.store.load_run(run.id).await?.cancel_requested {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// One attempt of one stage, including the stage's durable writes.
    async fn attempt_stage(&self, run: &PipelineRun, stage: Stage) -> Result<(), StageError> {
        match stage {
            Stage::Fetch => {
                let content = self.fetcher.fetch(&run.source_url).await?;
                info!(
                    run_id = %run.id,
                    method = %content.method,
                    chars = content.content.len(),
                    "Fetched posting content"
                );
                self.store.save_fetched_content(run.id, &content).await?;
                Ok(())
            }
            Stage::Extract => {
                let content = self
                    .store
                    .load_fetched_content(run.id)
                    .await?
                    .ok_or(StageError::MissingContent)?;
                let questions = self.extractor.extract(&content.content).await?;
                info!(
                    run_id = %run.id,
                    questions = questions.len(),
                    "Extracted questions"
                );
                self.store.save_questions(run.id, &questions).await?;
                Ok(())
            }
            Stage::PersistQuestions => {
                // The extraction attempt already staged its output; this
                // stage commits the run past the point where questions are
                // guaranteed present and densely ordered.
                let questions = self.store.load_questions(run.id).await?;
                if questions.is_empty() {
                    return Err(StageError::MissingQuestions);
                }
                Ok(())
            }
            Stage::Generate => {
                let bundle = self.context_source.context_bundle(&run.user_ref).await?;
                let questions = self.store.load_questions(run.id).await?;
                let report = self
                    .generator
                    .run_fan_out(&self.store, run.id, &questions, &bundle)
                    .await?;
                debug_assert!(report.all_terminal());
                Ok(())
            }
            Stage::PersistAnswers => {
                let tasks = self.store.load_tasks(run.id).await?;
                // Fan-in guarantee: GENERATE only advances once every task
                // is terminal, so nothing here is pending or running.
                let answers: Vec<Answer> = tasks
                    .iter()
                    .filter(|t| t.status == TaskStatus::Succeeded)
                    .filter_map(|t| {
                        t.answer
                            .as_ref()
                            .map(|a| Answer::new(t.question_order, a.clone()))
                    })
                    .collect();
                info!(
                    run_id = %run.id,
                    answers = answers.len(),
                    failed = tasks.iter().filter(|t| t.status == TaskStatus::Failed).count(),
                    "Persisting answers"
                );
                self.store.save_answers(run.id, &answers).await?;
                Ok(())
            }
            Stage::Complete | Stage::Failed => Ok(()),
        }
    }

    /// Advances a run past a completed stage with a conditional write.
    async fn advance(&self, run_id: Uuid, from: Stage) -> Result<(), OrchestratorError> {
        let next = from
            .next()
            .expect("only non-terminal stages are executed");
        let accepted = self.store.advance_stage(run_id, from, next).await?;
        if accepted {
            info!(run_id = %run_id, from = %from, to = %next, "Stage advanced");
        } else {
            // Stale-state conflict: another worker won the transition. The
            // drive loop reloads and continues from the recorded stage
            // without re-executing this stage's side effect.
            info!(run_id = %run_id, from = %from, "Stage advance lost to another worker");
        }
        Ok(())
    }

    /// Requests cooperative cancellation of a run.
    ///
    /// In-flight external calls complete normally; the run records
    /// FAILED-by-cancellation at the next stage boundary.
    pub async fn cancel(&self, run_id: Uuid) -> Result<(), OrchestratorError> {
        self.store.request_cancel(run_id).await?;
        info!(run_id = %run_id, "Cancellation requested");
        Ok(())
    }

    /// The status boundary polled by the presentation layer.
    pub async fn run_status(&self, run_id: Uuid) -> Result<RunStatus, OrchestratorError> {
        Ok(self.store.run_status(run_id).await?)
    }

    /// A run's stage attempt history, oldest first.
    pub async fn attempt_history(
        &self,
        run_id: Uuid,
    ) -> Result<Vec<AttemptRecord>, OrchestratorError> {
        Ok(self.store.attempt_history(run_id).await?)
    }

    /// Retries a single failed question of a completed run.
    ///
    /// This is the user-facing retry action: it re-runs one GenerationTask
    /// and refreshes the persisted answers, without re-running the
    /// pipeline. Returns the task's new terminal status, or `None` when the
    /// task was not in a failed state.
    pub async fn retry_question(
        &self,
        run_id: Uuid,
        question_order: u32,
    ) -> Result<Option<TaskStatus>, OrchestratorError> {
        let run = self.store.load_run(run_id).await?;
        if run.stage != Stage::Complete {
            return Err(OrchestratorError::RunNotComplete {
                run_id,
                stage: run.stage,
            });
        }

        let questions = self.store.load_questions(run_id).await?;
        let question = questions
            .iter()
            .find(|q| q.order == question_order)
            .ok_or(OrchestratorError::QuestionNotFound {
                run_id,
                question_order,
            })?;

        let bundle = self.context_source.context_bundle(&run.user_ref).await?;

        let status = self
            .generator
            .retry_failed_task(&self.store, run_id, question, &bundle)
            .await?;

        if status == Some(TaskStatus::Succeeded) {
            // Refresh the persisted answer set with the new answer.
            let tasks = self.store.load_tasks(run_id).await?;
            let answers: Vec<Answer> = tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Succeeded)
                .filter_map(|t| {
                    t.answer
                        .as_ref()
                        .map(|a| Answer::new(t.question_order, a.clone()))
                })
                .collect();
            self.store.save_answers(run_id, &answers).await?;
            info!(run_id = %run_id, question_order, "Question retry succeeded");
        }

        Ok(status)
    }
}
