//! In-memory state store for tests and local single-process runs.
//!
//! Implements the same conditional-write semantics as the Postgres store
//! behind a `RwLock`. Not durable; a process restart loses everything.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::extract::ExtractedQuestion;
use crate::fetch::FetchedContent;
use crate::pipeline::run::{
    Answer, AttemptOutcome, AttemptRecord, GenerationTask, PipelineRun, RunFailure, RunStatus,
    Stage, TaskStatus,
};

use super::{StateStore, StoreError};

/// Per-run record held by the in-memory store.
#[derive(Debug, Default)]
struct RunRecord {
    content: Option<FetchedContent>,
    questions: Vec<ExtractedQuestion>,
    tasks: HashMap<u32, GenerationTask>,
    answers: Vec<Answer>,
    attempts: Vec<AttemptRecord>,
}

/// In-memory [`StateStore`] implementation.
#[derive(Default)]
pub struct MemoryStateStore {
    runs: RwLock<HashMap<Uuid, PipelineRun>>,
    records: RwLock<HashMap<Uuid, RunRecord>>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of runs in the store.
    pub fn len(&self) -> usize {
        self.runs.read().expect("runs lock poisoned").len()
    }

    /// Whether the store holds no runs.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn create_run(
        &self,
        source_url: &str,
        user_ref: &str,
    ) -> Result<PipelineRun, StoreError> {
        let run = PipelineRun::new(source_url, user_ref);

        self.runs
            .write()
            .expect("runs lock poisoned")
            .insert(run.id, run.clone());
        self.records
            .write()
            .expect("records lock poisoned")
            .insert(run.id, RunRecord::default());

        Ok(run)
    }

    async fn load_run(&self, run_id: Uuid) -> Result<PipelineRun, StoreError> {
        self.runs
            .read()
            .expect("runs lock poisoned")
            .get(&run_id)
            .cloned()
            .ok_or(StoreError::RunNotFound(run_id))
    }

    async fn advance_stage(
        &self,
        run_id: Uuid,
        expected: Stage,
        new: Stage,
    ) -> Result<bool, StoreError> {
        let mut runs = self.runs.write().expect("runs lock poisoned");
        let run = runs.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;

        if run.stage != expected {
            return Ok(false);
        }

        run.stage = new;
        run.updated_at = Utc::now();
        Ok(true)
    }

    async fn record_attempt(
        &self,
        run_id: Uuid,
        stage: Stage,
        outcome: AttemptOutcome,
    ) -> Result<(), StoreError> {
        let mut runs = self.runs.write().expect("runs lock poisoned");
        let run = runs.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;

        let counter = run.attempts.entry(stage).or_insert(0);
        *counter += 1;
        let attempt = *counter;
        run.updated_at = Utc::now();
        drop(runs);

        let mut records = self.records.write().expect("records lock poisoned");
        let record = records.entry(run_id).or_default();
        record.attempts.push(AttemptRecord {
            stage,
            attempt,
            outcome,
            at: Utc::now(),
        });

        Ok(())
    }

    async fn fail_run(
        &self,
        run_id: Uuid,
        expected: Stage,
        failure: RunFailure,
    ) -> Result<bool, StoreError> {
        let mut runs = self.runs.write().expect("runs lock poisoned");
        let run = runs.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;

        if run.stage != expected {
            return Ok(false);
        }

        run.stage = Stage::Failed;
        run.failure = Some(failure);
        run.updated_at = Utc::now();
        Ok(true)
    }

    async fn request_cancel(&self, run_id: Uuid) -> Result<(), StoreError> {
        let mut runs = self.runs.write().expect("runs lock poisoned");
        let run = runs.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;
        run.cancel_requested = true;
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn save_fetched_content(
        &self,
        run_id: Uuid,
        content: &FetchedContent,
    ) -> Result<(), StoreError> {
        let mut records = self.records.write().expect("records lock poisoned");
        let record = records.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;
        record.content = Some(content.clone());
        Ok(())
    }

    async fn load_fetched_content(
        &self,
        run_id: Uuid,
    ) -> Result<Option<FetchedContent>, StoreError> {
        let records = self.records.read().expect("records lock poisoned");
        let record = records.get(&run_id).ok_or(StoreError::RunNotFound(run_id))?;
        Ok(record.content.clone())
    }

    async fn save_questions(
        &self,
        run_id: Uuid,
        questions: &[ExtractedQuestion],
    ) -> Result<(), StoreError> {
        let mut records = self.records.write().expect("records lock poisoned");
        let record = records.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;
        record.questions = questions.to_vec();
        Ok(())
    }

    async fn load_questions(&self, run_id: Uuid) -> Result<Vec<ExtractedQuestion>, StoreError> {
        let records = self.records.read().expect("records lock poisoned");
        let record = records.get(&run_id).ok_or(StoreError::RunNotFound(run_id))?;
        let mut questions = record.questions.clone();
        questions.sort_by_key(|q| q.order);
        Ok(questions)
    }

    async fn create_task_if_absent(&self, task: &GenerationTask) -> Result<(), StoreError> {
        let mut records = self.records.write().expect("records lock poisoned");
        let record = records
            .get_mut(&task.run_id)
            .ok_or(StoreError::RunNotFound(task.run_id))?;
        record
            .tasks
            .entry(task.question_order)
            .or_insert_with(|| task.clone());
        Ok(())
    }

    async fn claim_task(
        &self,
        run_id: Uuid,
        question_order: u32,
        expected: TaskStatus,
    ) -> Result<bool, StoreError> {
        let mut records = self.records.write().expect("records lock poisoned");
        let record = records.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;
        let task = record
            .tasks
            .get_mut(&question_order)
            .ok_or(StoreError::TaskNotFound {
                run_id,
                question_order,
            })?;

        if task.status != expected {
            return Ok(false);
        }

        task.status = TaskStatus::Running;
        task.attempt_count += 1;
        Ok(true)
    }

    async fn bump_task_attempt(
        &self,
        run_id: Uuid,
        question_order: u32,
    ) -> Result<(), StoreError> {
        let mut records = self.records.write().expect("records lock poisoned");
        let record = records.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;
        let task = record
            .tasks
            .get_mut(&question_order)
            .ok_or(StoreError::TaskNotFound {
                run_id,
                question_order,
            })?;
        task.attempt_count += 1;
        Ok(())
    }

    async fn finish_task(
        &self,
        run_id: Uuid,
        question_order: u32,
        status: TaskStatus,
        answer: Option<String>,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut records = self.records.write().expect("records lock poisoned");
        let record = records.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;
        let task = record
            .tasks
            .get_mut(&question_order)
            .ok_or(StoreError::TaskNotFound {
                run_id,
                question_order,
            })?;

        task.status = status;
        task.answer = answer;
        task.error = error;
        Ok(())
    }

    async fn load_tasks(&self, run_id: Uuid) -> Result<Vec<GenerationTask>, StoreError> {
        let records = self.records.read().expect("records lock poisoned");
        let record = records.get(&run_id).ok_or(StoreError::RunNotFound(run_id))?;
        let mut tasks: Vec<GenerationTask> = record.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.question_order);
        Ok(tasks)
    }

    async fn save_answers(&self, run_id: Uuid, answers: &[Answer]) -> Result<(), StoreError> {
        let mut records = self.records.write().expect("records lock poisoned");
        let record = records.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;
        let mut sorted = answers.to_vec();
        sorted.sort_by_key(|a| a.question_order);
        record.answers = sorted;
        Ok(())
    }

    async fn load_answers(&self, run_id: Uuid) -> Result<Vec<Answer>, StoreError> {
        let records = self.records.read().expect("records lock poisoned");
        let record = records.get(&run_id).ok_or(StoreError::RunNotFound(run_id))?;
        Ok(record.answers.clone())
    }

    async fn run_status(&self, run_id: Uuid) -> Result<RunStatus, StoreError> {
        let stage = self.load_run(run_id).await?.stage;

        let records = self.records.read().expect("records lock poisoned");
        let record = records.get(&run_id).ok_or(StoreError::RunNotFound(run_id))?;

        let answers_generated = record
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Succeeded)
            .count() as u32;
        let answers_failed = record
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Failed)
            .count() as u32;

        Ok(RunStatus {
            run_id,
            stage,
            questions_extracted: record.questions.len() as u32,
            answers_generated,
            answers_failed,
        })
    }

    async fn attempt_history(&self, run_id: Uuid) -> Result<Vec<AttemptRecord>, StoreError> {
        let records = self.records.read().expect("records lock poisoned");
        let record = records.get(&run_id).ok_or(StoreError::RunNotFound(run_id))?;
        Ok(record.attempts.clone())
    }

    async fn list_stale_runs(&self, stale_after_seconds: i64) -> Result<Vec<Uuid>, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::seconds(stale_after_seconds);
        let runs = self.runs.read().expect("runs lock poisoned");
        Ok(runs
            .values()
            .filter(|r| !r.is_terminal() && r.updated_at < cutoff)
            .map(|r| r.id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use crate::extract::QuestionKind;

    #[tokio::test]
    async fn test_create_and_load_run() {
        let store = MemoryStateStore::new();

        let run = store
            .create_run("https://example.com/job/42", "user-1")
            .await
            .unwrap();
        let loaded = store.load_run(run.id).await.unwrap();

        assert_eq!(loaded.id, run.id);
        assert_eq!(loaded.stage, Stage::Fetch);
        assert_eq!(loaded.source_url, "https://example.com/job/42");
    }

    #[tokio::test]
    async fn test_load_missing_run() {
        let store = MemoryStateStore::new();
        let err = store.load_run(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StoreError::RunNotFound(_)));
    }

    #[tokio::test]
    async fn test_advance_stage_conditional() {
        let store = MemoryStateStore::new();
        let run = store.create_run("https://example.com", "u").await.unwrap();

        // First transition is accepted.
        assert!(store
            .advance_stage(run.id, Stage::Fetch, Stage::Extract)
            .await
            .unwrap());

        // A second caller with the same expectation observes a conflict.
        assert!(!store
            .advance_stage(run.id, Stage::Fetch, Stage::Extract)
            .await
            .unwrap());

        let loaded = store.load_run(run.id).await.unwrap();
        assert_eq!(loaded.stage, Stage::Extract);
    }

    #[tokio::test]
    async fn test_record_attempt_bumps_counter_and_history() {
        let store = MemoryStateStore::new();
        let run = store.create_run("https://example.com", "u").await.unwrap();

        store
            .record_attempt(
                run.id,
                Stage::Fetch,
                AttemptOutcome::failed(ErrorClass::Transient, "HTTP 503"),
            )
            .await
            .unwrap();
        store
            .record_attempt(run.id, Stage::Fetch, AttemptOutcome::Succeeded)
            .await
            .unwrap();

        let loaded = store.load_run(run.id).await.unwrap();
        assert_eq!(loaded.attempts_for(Stage::Fetch), 2);

        let history = store.attempt_history(run.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].attempt, 1);
        assert_eq!(history[1].attempt, 2);
        assert_eq!(history[1].outcome, AttemptOutcome::Succeeded);
    }

    #[tokio::test]
    async fn test_fail_run_conditional() {
        let store = MemoryStateStore::new();
        let run = store.create_run("https://example.com", "u").await.unwrap();

        let failure = RunFailure::new(Stage::Fetch, ErrorClass::Permanent, "empty content");
        assert!(store.fail_run(run.id, Stage::Fetch, failure).await.unwrap());

        let loaded = store.load_run(run.id).await.unwrap();
        assert_eq!(loaded.stage, Stage::Failed);
        assert!(loaded.failure.is_some());

        // Failing again from a stale expectation is a no-op conflict.
        let failure = RunFailure::new(Stage::Fetch, ErrorClass::Permanent, "again");
        assert!(!store.fail_run(run.id, Stage::Fetch, failure).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_flag() {
        let store = MemoryStateStore::new();
        let run = store.create_run("https://example.com", "u").await.unwrap();

        store.request_cancel(run.id).await.unwrap();
        assert!(store.load_run(run.id).await.unwrap().cancel_requested);
    }

    #[tokio::test]
    async fn test_questions_roundtrip_sorted() {
        let store = MemoryStateStore::new();
        let run = store.create_run("https://example.com", "u").await.unwrap();

        let questions = vec![
            ExtractedQuestion::new("b", QuestionKind::Essay, false, 1),
            ExtractedQuestion::new("a", QuestionKind::ShortAnswer, true, 0),
        ];
        store.save_questions(run.id, &questions).await.unwrap();

        let loaded = store.load_questions(run.id).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].text, "a");
        assert_eq!(loaded[1].text, "b");
    }

    #[tokio::test]
    async fn test_task_lifecycle() {
        let store = MemoryStateStore::new();
        let run = store.create_run("https://example.com", "u").await.unwrap();

        let task = GenerationTask::pending(run.id, 0, "digest");
        store.create_task_if_absent(&task).await.unwrap();

        // Claiming from Pending succeeds once.
        assert!(store.claim_task(run.id, 0, TaskStatus::Pending).await.unwrap());
        assert!(!store.claim_task(run.id, 0, TaskStatus::Pending).await.unwrap());

        store
            .finish_task(run.id, 0, TaskStatus::Succeeded, Some("answer".into()), None)
            .await
            .unwrap();

        let tasks = store.load_tasks(run.id).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Succeeded);
        assert_eq!(tasks[0].attempt_count, 1);
        assert_eq!(tasks[0].answer.as_deref(), Some("answer"));
    }

    #[tokio::test]
    async fn test_create_task_if_absent_preserves_terminal_state() {
        let store = MemoryStateStore::new();
        let run = store.create_run("https://example.com", "u").await.unwrap();

        let task = GenerationTask::pending(run.id, 0, "digest");
        store.create_task_if_absent(&task).await.unwrap();
        store.claim_task(run.id, 0, TaskStatus::Pending).await.unwrap();
        store
            .finish_task(run.id, 0, TaskStatus::Succeeded, Some("kept".into()), None)
            .await
            .unwrap();

        // Re-creating (as crash-replay would) must not reset the task.
        let replay = GenerationTask::pending(run.id, 0, "digest");
        store.create_task_if_absent(&replay).await.unwrap();

        let tasks = store.load_tasks(run.id).await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Succeeded);
        assert_eq!(tasks[0].answer.as_deref(), Some("kept"));
    }

    #[tokio::test]
    async fn test_run_status_counts() {
        let store = MemoryStateStore::new();
        let run = store.create_run("https://example.com", "u").await.unwrap();

        store
            .save_questions(
                run.id,
                &[
                    ExtractedQuestion::new("a", QuestionKind::Essay, true, 0),
                    ExtractedQuestion::new("b", QuestionKind::Essay, true, 1),
                    ExtractedQuestion::new("c", QuestionKind::Essay, true, 2),
                ],
            )
            .await
            .unwrap();

        for order in 0..3u32 {
            let task = GenerationTask::pending(run.id, order, "digest");
            store.create_task_if_absent(&task).await.unwrap();
            store.claim_task(run.id, order, TaskStatus::Pending).await.unwrap();
        }
        store
            .finish_task(run.id, 0, TaskStatus::Succeeded, Some("x".into()), None)
            .await
            .unwrap();
        store
            .finish_task(run.id, 1, TaskStatus::Succeeded, Some("y".into()), None)
            .await
            .unwrap();
        store
            .finish_task(run.id, 2, TaskStatus::Failed, None, Some("rejected".into()))
            .await
            .unwrap();

        let status = store.run_status(run.id).await.unwrap();
        assert_eq!(status.questions_extracted, 3);
        assert_eq!(status.answers_generated, 2);
        assert_eq!(status.answers_failed, 1);
    }

    #[tokio::test]
    async fn test_list_stale_runs() {
        let store = MemoryStateStore::new();
        let run = store.create_run("https://example.com", "u").await.unwrap();

        // Fresh runs are not stale.
        assert!(store.list_stale_runs(60).await.unwrap().is_empty());

        // With a zero threshold every non-terminal run is stale.
        let stale = store.list_stale_runs(-1).await.unwrap();
        assert_eq!(stale, vec![run.id]);

        // Terminal runs are never reported.
        store
            .advance_stage(run.id, Stage::Fetch, Stage::Extract)
            .await
            .unwrap();
        let failure = RunFailure::new(Stage::Extract, ErrorClass::Permanent, "done");
        store.fail_run(run.id, Stage::Extract, failure).await.unwrap();
        assert!(store.list_stale_runs(-1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fetched_content_roundtrip() {
        let store = MemoryStateStore::new();
        let run = store.create_run("https://example.com", "u").await.unwrap();

        assert!(store.load_fetched_content(run.id).await.unwrap().is_none());

        let content = FetchedContent {
            content: "posting text".to_string(),
            title: Some("Posting".to_string()),
            method: crate::fetch::FetchMethod::Static,
        };
        store.save_fetched_content(run.id, &content).await.unwrap();

        let loaded = store.load_fetched_content(run.id).await.unwrap().unwrap();
        assert_eq!(loaded, content);
    }
}
