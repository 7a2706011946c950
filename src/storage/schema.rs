//! Database schema definitions.
//!
//! All statements are idempotent (`IF NOT EXISTS`) so the migration runner
//! can re-apply them safely.

/// Schema for the run records table.
pub const CREATE_PIPELINE_RUNS: &str = r#"
CREATE TABLE IF NOT EXISTS pipeline_runs (
    id UUID PRIMARY KEY,
    source_url TEXT NOT NULL,
    user_ref TEXT NOT NULL,
    stage TEXT NOT NULL,
    attempts JSONB NOT NULL DEFAULT '{}'::jsonb,
    cancel_requested BOOLEAN NOT NULL DEFAULT FALSE,
    failure JSONB,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
)
"#;

/// Index for the stale-run recovery sweep.
pub const CREATE_PIPELINE_RUNS_STAGE_IDX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_pipeline_runs_stage_updated
ON pipeline_runs (stage, updated_at)
"#;

/// Schema for fetched page content, one row per run.
pub const CREATE_RUN_CONTENT: &str = r#"
CREATE TABLE IF NOT EXISTS run_content (
    run_id UUID PRIMARY KEY REFERENCES pipeline_runs(id) ON DELETE CASCADE,
    content TEXT NOT NULL,
    title TEXT,
    method TEXT NOT NULL
)
"#;

/// Schema for extracted questions.
pub const CREATE_RUN_QUESTIONS: &str = r#"
CREATE TABLE IF NOT EXISTS run_questions (
    run_id UUID NOT NULL REFERENCES pipeline_runs(id) ON DELETE CASCADE,
    question_order INTEGER NOT NULL,
    text TEXT NOT NULL,
    kind TEXT NOT NULL,
    required BOOLEAN NOT NULL DEFAULT FALSE,
    PRIMARY KEY (run_id, question_order)
)
"#;

/// Schema for generation tasks.
pub const CREATE_GENERATION_TASKS: &str = r#"
CREATE TABLE IF NOT EXISTS generation_tasks (
    run_id UUID NOT NULL REFERENCES pipeline_runs(id) ON DELETE CASCADE,
    question_order INTEGER NOT NULL,
    context_digest TEXT NOT NULL,
    status TEXT NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    answer TEXT,
    error TEXT,
    PRIMARY KEY (run_id, question_order)
)
"#;

/// Schema for persisted answers.
pub const CREATE_RUN_ANSWERS: &str = r#"
CREATE TABLE IF NOT EXISTS run_answers (
    run_id UUID NOT NULL REFERENCES pipeline_runs(id) ON DELETE CASCADE,
    question_order INTEGER NOT NULL,
    text TEXT NOT NULL,
    generated_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (run_id, question_order)
)
"#;

/// Schema for the stage attempt history.
pub const CREATE_RUN_ATTEMPTS: &str = r#"
CREATE TABLE IF NOT EXISTS run_attempts (
    id BIGSERIAL PRIMARY KEY,
    run_id UUID NOT NULL REFERENCES pipeline_runs(id) ON DELETE CASCADE,
    stage TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    outcome JSONB NOT NULL,
    at TIMESTAMPTZ NOT NULL
)
"#;

/// Index for reading a run's attempt history in order.
pub const CREATE_RUN_ATTEMPTS_IDX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_run_attempts_run
ON run_attempts (run_id, id)
"#;

/// Returns all schema statements in application order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_PIPELINE_RUNS,
        CREATE_PIPELINE_RUNS_STAGE_IDX,
        CREATE_RUN_CONTENT,
        CREATE_RUN_QUESTIONS,
        CREATE_GENERATION_TASKS,
        CREATE_RUN_ANSWERS,
        CREATE_RUN_ATTEMPTS,
        CREATE_RUN_ATTEMPTS_IDX,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_statements_are_idempotent() {
        for statement in all_schema_statements() {
            assert!(
                statement.contains("IF NOT EXISTS"),
                "statement missing IF NOT EXISTS: {}",
                statement
            );
        }
    }

    #[test]
    fn test_statement_order_respects_foreign_keys() {
        let statements = all_schema_statements();
        let runs_idx = statements
            .iter()
            .position(|s| s.contains("pipeline_runs ("))
            .unwrap();
        let tasks_idx = statements
            .iter()
            .position(|s| s.contains("generation_tasks"))
            .unwrap();
        assert!(runs_idx < tasks_idx);
    }
}
