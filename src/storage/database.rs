//! PostgreSQL state store.
//!
//! The production [`StateStore`] implementation. Conditional transitions
//! (`advance_stage`, `fail_run`, `claim_task`) are single `UPDATE`
//! statements guarded by the expected stage/status in the `WHERE` clause;
//! the affected-row count is the optimistic check.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::extract::{ExtractedQuestion, QuestionKind};
use crate::fetch::{FetchMethod, FetchedContent};
use crate::pipeline::run::{
    Answer, AttemptOutcome, AttemptRecord, GenerationTask, PipelineRun, RunFailure, RunStatus,
    Stage, TaskStatus,
};

use super::migrations::MigrationRunner;
use super::{StateStore, StoreError};

/// PostgreSQL-backed state store.
pub struct PostgresStateStore {
    pool: PgPool,
}

impl PostgresStateStore {
    /// Connects to the database and returns a new store.
    ///
    /// # Arguments
    ///
    /// * `database_url` - PostgreSQL connection string
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Creates a store from an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs database migrations.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        let runner = MigrationRunner::new(self.pool.clone());
        runner.run_migrations().await?;
        Ok(())
    }

    /// Parses a run row into a `PipelineRun`.
    fn run_from_row(row: &sqlx::postgres::PgRow) -> Result<PipelineRun, StoreError> {
        let stage_text: String = row.get("stage");
        let stage = Stage::parse(&stage_text)
            .ok_or_else(|| StoreError::CorruptRecord(format!("unknown stage '{}'", stage_text)))?;

        let attempts_json: serde_json::Value = row.get("attempts");
        let attempts = serde_json::from_value(attempts_json)?;

        let failure_json: Option<serde_json::Value> = row.get("failure");
        let failure: Option<RunFailure> = match failure_json {
            Some(value) => Some(serde_json::from_value(value)?),
            None => None,
        };

        Ok(PipelineRun {
            id: row.get("id"),
            source_url: row.get("source_url"),
            user_ref: row.get("user_ref"),
            stage,
            attempts,
            cancel_requested: row.get("cancel_requested"),
            failure,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl StateStore for PostgresStateStore {
    async fn create_run(
        &self,
        source_url: &str,
        user_ref: &str,
    ) -> Result<PipelineRun, StoreError> {
        let run = PipelineRun::new(source_url, user_ref);

        sqlx::query(
            r#"
            INSERT INTO pipeline_runs (
                id, source_url, user_ref, stage, attempts,
                cancel_requested, failure, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, NULL, $7, $8)
            "#,
        )
        .bind(run.id)
        .bind(&run.source_url)
        .bind(&run.user_ref)
        .bind(run.stage.as_str())
        .bind(serde_json::to_value(&run.attempts)?)
        .bind(run.cancel_requested)
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(run)
    }

    async fn load_run(&self, run_id: Uuid) -> Result<PipelineRun, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, source_url, user_ref, stage, attempts,
                   cancel_requested, failure, created_at, updated_at
            FROM pipeline_runs
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::RunNotFound(run_id))?;

        Self::run_from_row(&row)
    }

    async fn advance_stage(
        &self,
        run_id: Uuid,
        expected: Stage,
        new: Stage,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_runs
            SET stage = $3, updated_at = NOW()
            WHERE id = $1 AND stage = $2
            "#,
        )
        .bind(run_id)
        .bind(expected.as_str())
        .bind(new.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_attempt(
        &self,
        run_id: Uuid,
        stage: Stage,
        outcome: AttemptOutcome,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        // Bump the per-stage counter inside the attempts JSONB map and read
        // back the new value for the history row.
        let row = sqlx::query(
            r#"
            UPDATE pipeline_runs
            SET attempts = jsonb_set(
                    attempts,
                    ARRAY[$2],
                    (COALESCE(attempts->>$2, '0')::int + 1)::text::jsonb
                ),
                updated_at = NOW()
            WHERE id = $1
            RETURNING (attempts->>$2)::int AS attempt
            "#,
        )
        .bind(run_id)
        .bind(stage.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::RunNotFound(run_id))?;

        let attempt: i32 = row.get("attempt");

        sqlx::query(
            r#"
            INSERT INTO run_attempts (run_id, stage, attempt, outcome, at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(run_id)
        .bind(stage.as_str())
        .bind(attempt)
        .bind(serde_json::to_value(&outcome)?)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn fail_run(
        &self,
        run_id: Uuid,
        expected: Stage,
        failure: RunFailure,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_runs
            SET stage = $3, failure = $4, updated_at = NOW()
            WHERE id = $1 AND stage = $2
            "#,
        )
        .bind(run_id)
        .bind(expected.as_str())
        .bind(Stage::Failed.as_str())
        .bind(serde_json::to_value(&failure)?)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn request_cancel(&self, run_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_runs
            SET cancel_requested = TRUE, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RunNotFound(run_id));
        }
        Ok(())
    }

    async fn save_fetched_content(
        &self,
        run_id: Uuid,
        content: &FetchedContent,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO run_content (run_id, content, title, method)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (run_id) DO UPDATE SET
                content = EXCLUDED.content,
                title = EXCLUDED.title,
                method = EXCLUDED.method
            "#,
        )
        .bind(run_id)
        .bind(&content.content)
        .bind(&content.title)
        .bind(match content.method {
            FetchMethod::Static => "static",
            FetchMethod::Rendered => "rendered",
        })
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_fetched_content(
        &self,
        run_id: Uuid,
    ) -> Result<Option<FetchedContent>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT content, title, method
            FROM run_content
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let method_text: String = row.get("method");
        let method = match method_text.as_str() {
            "static" => FetchMethod::Static,
            "rendered" => FetchMethod::Rendered,
            other => {
                return Err(StoreError::CorruptRecord(format!(
                    "unknown fetch method '{}'",
                    other
                )))
            }
        };

        Ok(Some(FetchedContent {
            content: row.get("content"),
            title: row.get("title"),
            method,
        }))
    }

    async fn save_questions(
        &self,
        run_id: Uuid,
        questions: &[ExtractedQuestion],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM run_questions WHERE run_id = $1")
            .bind(run_id)
            .execute(&mut *tx)
            .await?;

        for question in questions {
            sqlx::query(
                r#"
                INSERT INTO run_questions (run_id, question_order, text, kind, required)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(run_id)
            .bind(question.order as i32)
            .bind(&question.text)
            .bind(question.kind.as_str())
            .bind(question.required)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load_questions(&self, run_id: Uuid) -> Result<Vec<ExtractedQuestion>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT question_order, text, kind, required
            FROM run_questions
            WHERE run_id = $1
            ORDER BY question_order
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let order: i32 = row.get("question_order");
                let kind_text: String = row.get("kind");
                Ok(ExtractedQuestion {
                    text: row.get("text"),
                    kind: QuestionKind::coerce(&kind_text),
                    required: row.get("required"),
                    order: order as u32,
                })
            })
            .collect()
    }

    async fn create_task_if_absent(&self, task: &GenerationTask) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO generation_tasks (
                run_id, question_order, context_digest, status, attempt_count, answer, error
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (run_id, question_order) DO NOTHING
            "#,
        )
        .bind(task.run_id)
        .bind(task.question_order as i32)
        .bind(&task.context_digest)
        .bind(task.status.as_str())
        .bind(task.attempt_count as i32)
        .bind(&task.answer)
        .bind(&task.error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn claim_task(
        &self,
        run_id: Uuid,
        question_order: u32,
        expected: TaskStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE generation_tasks
            SET status = $4, attempt_count = attempt_count + 1
            WHERE run_id = $1 AND question_order = $2 AND status = $3
            "#,
        )
        .bind(run_id)
        .bind(question_order as i32)
        .bind(expected.as_str())
        .bind(TaskStatus::Running.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn bump_task_attempt(
        &self,
        run_id: Uuid,
        question_order: u32,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE generation_tasks
            SET attempt_count = attempt_count + 1
            WHERE run_id = $1 AND question_order = $2
            "#,
        )
        .bind(run_id)
        .bind(question_order as i32)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound {
                run_id,
                question_order,
            });
        }
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
        let result = sqlx::query(
            r#"
            UPDATE generation_tasks
            SET status = $3, answer = $4, error = $5
            WHERE run_id = $1 AND question_order = $2
            "#,
        )
        .bind(run_id)
        .bind(question_order as i32)
        .bind(status.as_str())
        .bind(answer)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound {
                run_id,
                question_order,
            });
        }
        Ok(())
    }

    async fn load_tasks(&self, run_id: Uuid) -> Result<Vec<GenerationTask>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT question_order, context_digest, status, attempt_count, answer, error
            FROM generation_tasks
            WHERE run_id = $1
            ORDER BY question_order
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let order: i32 = row.get("question_order");
                let status_text: String = row.get("status");
                let status = TaskStatus::parse(&status_text).ok_or_else(|| {
                    StoreError::CorruptRecord(format!("unknown task status '{}'", status_text))
                })?;
                let attempt_count: i32 = row.get("attempt_count");

                Ok(GenerationTask {
                    run_id,
                    question_order: order as u32,
                    context_digest: row.get("context_digest"),
                    status,
                    attempt_count: attempt_count as u32,
                    answer: row.get("answer"),
                    error: row.get("error"),
                })
            })
            .collect()
    }

    async fn save_answers(&self, run_id: Uuid, answers: &[Answer]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM run_answers WHERE run_id = $1")
            .bind(run_id)
            .execute(&mut *tx)
            .await?;

        for answer in answers {
            sqlx::query(
                r#"
                INSERT INTO run_answers (run_id, question_order, text, generated_at)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(run_id)
            .bind(answer.question_order as i32)
            .bind(&answer.text)
            .bind(answer.generated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load_answers(&self, run_id: Uuid) -> Result<Vec<Answer>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT question_order, text, generated_at
            FROM run_answers
            WHERE run_id = $1
            ORDER BY question_order
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let order: i32 = row.get("question_order");
                let generated_at: DateTime<Utc> = row.get("generated_at");
                Answer {
                    question_order: order as u32,
                    text: row.get("text"),
                    generated_at,
                }
            })
            .collect())
    }

    async fn run_status(&self, run_id: Uuid) -> Result<RunStatus, StoreError> {
        let stage = self.load_run(run_id).await?.stage;

        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM run_questions WHERE run_id = $1) AS questions,
                (SELECT COUNT(*) FROM generation_tasks
                 WHERE run_id = $1 AND status = 'succeeded') AS generated,
                (SELECT COUNT(*) FROM generation_tasks
                 WHERE run_id = $1 AND status = 'failed') AS failed
            "#,
        )
        .bind(run_id)
        .fetch_one(&self.pool)
        .await?;

        let questions: i64 = row.get("questions");
        let generated: i64 = row.get("generated");
        let failed: i64 = row.get("failed");

        Ok(RunStatus {
            run_id,
            stage,
            questions_extracted: questions as u32,
            answers_generated: generated as u32,
            answers_failed: failed as u32,
        })
    }

    async fn attempt_history(&self, run_id: Uuid) -> Result<Vec<AttemptRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT stage, attempt, outcome, at
            FROM run_attempts
            WHERE run_id = $1
            ORDER BY id
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let stage_text: String = row.get("stage");
                let stage = Stage::parse(&stage_text).ok_or_else(|| {
                    StoreError::CorruptRecord(format!("unknown stage '{}'", stage_text))
                })?;
                let attempt: i32 = row.get("attempt");
                let outcome_json: serde_json::Value = row.get("outcome");
                let at: DateTime<Utc> = row.get("at");

                Ok(AttemptRecord {
                    stage,
                    attempt: attempt as u32,
                    outcome: serde_json::from_value(outcome_json)?,
                    at,
                })
            })
            .collect()
    }

    async fn list_stale_runs(&self, stale_after_seconds: i64) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id
            FROM pipeline_runs
            WHERE stage NOT IN ('complete', 'failed')
              AND updated_at < NOW() - ($1 * INTERVAL '1 second')
            ORDER BY updated_at
            "#,
        )
        .bind(stale_after_seconds)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|row| row.get("id")).collect())
    }
}
