//! Answer generation: fan-out over questions, fan-in on terminal tasks.
//!
//! One [`GenerationTask`](crate::pipeline::run::GenerationTask) is created
//! per extracted question. Tasks execute concurrently under a semaphore
//! shared by every run in the process, each independently retryable, with a
//! cache lookup short-circuiting the external call for question/context
//! pairs that were already answered. The fan-in barrier is the `join_all`
//! over the task futures: the caller only proceeds once every task for the
//! run is terminal.

pub mod cache;
pub mod context;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CapabilityError, ErrorClass, GenerationError};
use crate::extract::ExtractedQuestion;
use crate::llm::{CompletionProvider, CompletionRequest, Message};
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::run::{GenerationTask, TaskStatus};
use crate::storage::{StateStore, StoreError};

pub use cache::{AnswerCache, AnswerCacheStats, AnswerKey, SharedAnswerCache};
pub use context::{ContextBundle, ContextDigest, ContextSource, StaticContextSource};

/// Default bound on concurrent generation calls across all runs.
pub const DEFAULT_MAX_CONCURRENT: usize = 8;

/// Default attempt ceiling for a single generation task.
const DEFAULT_TASK_ATTEMPTS: u32 = 3;

/// System prompt for the generation capability.
const ANSWER_SYSTEM_PROMPT: &str = "You draft application answers on behalf of a candidate. \
Write in first person, grounded strictly in the provided candidate facts. Output only the \
answer text.";

/// Instruction contract for one answer.
const ANSWER_PROMPT: &str = r#"
Draft an answer to the application question below.

Question ({kind}): {question}

Candidate facts:
{context}

Keep the answer specific to the facts given; do not invent credentials.
"#;

/// Summary of one fan-out pass over a run's tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOutReport {
    /// Total tasks for the run.
    pub total: usize,
    /// Tasks terminal as `Succeeded`.
    pub succeeded: usize,
    /// Tasks terminal as `Failed`.
    pub failed: usize,
    /// Tasks that were already terminal when the pass started.
    pub already_terminal: usize,
}

impl FanOutReport {
    /// Whether every task for the run is terminal.
    pub fn all_terminal(&self) -> bool {
        self.succeeded + self.failed == self.total
    }
}

/// Fan-out answer generator over the generation capability.
pub struct AnswerGenerator {
    provider: Arc<dyn CompletionProvider>,
    cache: SharedAnswerCache,
    permits: Arc<Semaphore>,
    task_policy: RetryPolicy,
    model: String,
}

impl AnswerGenerator {
    /// Creates a generator.
    ///
    /// # Arguments
    ///
    /// * `provider` - The generation capability backend
    /// * `cache` - Answer cache shared across runs
    /// * `max_concurrent` - Bound on concurrent external calls, shared by
    ///   every run in the process
    /// * `model` - Model identifier passed to the capability
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        cache: SharedAnswerCache,
        max_concurrent: usize,
        model: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            cache,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            task_policy: RetryPolicy::new(DEFAULT_TASK_ATTEMPTS)
                .with_base_delay(Duration::from_secs(1)),
            model: model.into(),
        }
    }

    /// Sets the per-task retry policy.
    pub fn with_task_policy(mut self, policy: RetryPolicy) -> Self {
        self.task_policy = policy;
        self
    }

    /// The answer cache used by this generator.
    pub fn cache(&self) -> &SharedAnswerCache {
        &self.cache
    }

    /// Runs the fan-out pass for a run and waits for the fan-in barrier.
    ///
    /// Creates one task per question (skipping any that already exist),
    /// executes every non-terminal task concurrently, and returns once all
    /// tasks are terminal. Re-entering after a crash is safe: terminal tasks
    /// are never re-executed, so zero new capability calls are made for a
    /// run whose tasks already finished.
    pub async fn run_fan_out(
        &self,
        store: &Arc<dyn StateStore>,
        run_id: Uuid,
        questions: &[ExtractedQuestion],
        bundle: &ContextBundle,
    ) -> Result<FanOutReport, StoreError> {
        let digest = bundle.digest();
        // Rendered once per run, not per question.
        let bundle_text = Arc::new(bundle.render());

        for question in questions {
            let task = GenerationTask::pending(run_id, question.order, digest.as_str());
            store.create_task_if_absent(&task).await?;
        }

        let tasks = store.load_tasks(run_id).await?;
        let already_terminal = tasks.iter().filter(|t| t.is_terminal()).count();

        let mut futures = Vec::new();
        for task in tasks.iter().filter(|t| !t.is_terminal()) {
            let Some(question) = questions.iter().find(|q| q.order == task.question_order) else {
                warn!(
                    run_id = %run_id,
                    question_order = task.question_order,
                    "Task has no matching question, marking failed"
                );
                store
                    .finish_task(
                        run_id,
                        task.question_order,
                        TaskStatus::Failed,
                        None,
                        Some("no matching question".to_string()),
                    )
                    .await?;
                continue;
            };

            futures.push(self.execute_task(
                Arc::clone(store),
                run_id,
                question.clone(),
                task.status,
                digest.clone(),
                Arc::clone(&bundle_text),
            ));
        }

        // Fan-in barrier: every spawned task reaches a terminal status
        // before the run may proceed to persisting answers.
        let results = join_all(futures).await;
        for result in results {
            result?;
        }

        let tasks = store.load_tasks(run_id).await?;
        let report = FanOutReport {
            total: tasks.len(),
            succeeded: tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Succeeded)
                .count(),
            failed: tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Failed)
                .count(),
            already_terminal,
        };

        info!(
            run_id = %run_id,
            total = report.total,
            succeeded = report.succeeded,
            failed = report.failed,
            "Generation fan-out complete"
        );

        Ok(report)
    }

    /// Re-runs a single failed task, for the user-triggered retry action.
    ///
    /// Returns the task's new terminal status, or `None` if the task was
    /// not in `Failed` state (nothing to retry, or another worker got there
    /// first).
    pub async fn retry_failed_task(
        &self,
        store: &Arc<dyn StateStore>,
        run_id: Uuid,
        question: &ExtractedQuestion,
        bundle: &ContextBundle,
    ) -> Result<Option<TaskStatus>, StoreError> {
        let digest = bundle.digest();

        if !store
            .claim_task(run_id, question.order, TaskStatus::Failed)
            .await?
        {
            return Ok(None);
        }

        let status = self
            .execute_claimed(store, run_id, question, &digest, &bundle.render())
            .await?;
        Ok(Some(status))
    }

    /// Executes one task from its observed pre-claim status to terminal.
    async fn execute_task(
        &self,
        store: Arc<dyn StateStore>,
        run_id: Uuid,
        question: ExtractedQuestion,
        observed_status: TaskStatus,
        digest: ContextDigest,
        bundle_text: Arc<String>,
    ) -> Result<(), StoreError> {
        // Conditional claim: if another worker already moved this task, the
        // claim fails and this worker walks away without a capability call.
        if !store
            .claim_task(run_id, question.order, observed_status)
            .await?
        {
            debug!(
                run_id = %run_id,
                question_order = question.order,
                "Task claim lost, skipping"
            );
            return Ok(());
        }

        self.execute_claimed(&store, run_id, &question, &digest, &bundle_text)
            .await?;
        Ok(())
    }

    /// Runs a claimed task to a terminal status.
    async fn execute_claimed(
        &self,
        store: &Arc<dyn StateStore>,
        run_id: Uuid,
        question: &ExtractedQuestion,
        digest: &ContextDigest,
        bundle_text: &str,
    ) -> Result<TaskStatus, StoreError> {
        let key = AnswerKey::for_question(question, digest);

        // A cache hit is served without any external call; this is what
        // makes re-execution of a run idempotent in cost as well as state.
        if let Some(answer) = self.cache.get(&key) {
            debug!(
                run_id = %run_id,
                question_order = question.order,
                "Answer served from cache"
            );
            store
                .finish_task(
                    run_id,
                    question.order,
                    TaskStatus::Succeeded,
                    Some(answer),
                    None,
                )
                .await?;
            return Ok(TaskStatus::Succeeded);
        }

        let mut attempt: u32 = 1;

        loop {
            let outcome = self.call_capability(question, bundle_text).await;

            match outcome {
                Ok(answer) => {
                    self.cache.insert(key, answer.clone());
                    store
                        .finish_task(
                            run_id,
                            question.order,
                            TaskStatus::Succeeded,
                            Some(answer),
                            None,
                        )
                        .await?;
                    return Ok(TaskStatus::Succeeded);
                }
                Err(e) if e.class() == ErrorClass::Transient
                    && self.task_policy.should_retry(attempt) =>
                {
                    let delay = self.task_policy.delay_for(attempt);
                    warn!(
                        run_id = %run_id,
                        question_order = question.order,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Generation attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    store.bump_task_attempt(run_id, question.order).await?;
                }
                Err(e) => {
                    warn!(
                        run_id = %run_id,
                        question_order = question.order,
                        attempt,
                        class = %e.class(),
                        error = %e,
                        "Generation task failed terminally"
                    );
                    store
                        .finish_task(
                            run_id,
                            question.order,
                            TaskStatus::Failed,
                            None,
                            Some(e.to_string()),
                        )
                        .await?;
                    return Ok(TaskStatus::Failed);
                }
            }
        }
    }

    /// Makes one bounded external call for a question.
    async fn call_capability(
        &self,
        question: &ExtractedQuestion,
        context_text: &str,
    ) -> Result<String, GenerationError> {
        // The permit bounds concurrent external calls across all runs.
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| CapabilityError::RequestFailed(e.to_string()))
            .map_err(GenerationError::Capability)?;

        let prompt = ANSWER_PROMPT
            .replace("{kind}", question.kind.as_str())
            .replace("{question}", &question.text)
            .replace("{context}", context_text);

        let request = CompletionRequest::new(
            self.model.clone(),
            vec![
                Message::system(ANSWER_SYSTEM_PROMPT),
                Message::user(prompt),
            ],
        )
        .with_temperature(0.4)
        .with_max_tokens(1200);

        let response = self.provider.complete(request).await?;
        let answer = response
            .first_content()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(GenerationError::EmptyCompletion)?;

        Ok(answer.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::QuestionKind;
    use crate::llm::{Choice, CompletionResponse, Usage};
    use crate::storage::MemoryStateStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Counting capability stub with a per-question failure script.
    struct ScriptedProvider {
        calls: AtomicU32,
        /// Questions containing this marker fail with the given error kind.
        reject_marker: Option<String>,
        /// Number of leading transient failures before succeeding.
        transient_failures: AtomicU32,
    }

    impl ScriptedProvider {
        fn ok() -> Self {
            Self {
                calls: AtomicU32::new(0),
                reject_marker: None,
                transient_failures: AtomicU32::new(0),
            }
        }

        fn rejecting(marker: &str) -> Self {
            Self {
                calls: AtomicU32::new(0),
                reject_marker: Some(marker.to_string()),
                transient_failures: AtomicU32::new(0),
            }
        }

        fn flaky(failures: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                reject_marker: None,
                transient_failures: AtomicU32::new(failures),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CompletionProvider for ScriptedProvider {
        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<CompletionResponse, CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            if let Some(ref marker) = self.reject_marker {
                if request.messages.iter().any(|m| m.content.contains(marker)) {
                    return Err(CapabilityError::PolicyRejected("rejected".into()));
                }
            }

            if self
                .transient_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(CapabilityError::RequestFailed("connection reset".into()));
            }

            let echo = request
                .messages
                .iter()
                .find(|m| m.role == "user")
                .map(|m| m.content.len())
                .unwrap_or(0);

            Ok(CompletionResponse {
                model: "stub".to_string(),
                choices: vec![Choice {
                    index: 0,
                    message: Message::assistant(format!("draft answer ({} chars in)", echo)),
                    finish_reason: "stop".to_string(),
                }],
                usage: Usage::default(),
            })
        }
    }

    fn questions(n: u32) -> Vec<ExtractedQuestion> {
        (0..n)
            .map(|i| {
                ExtractedQuestion::new(format!("Question {}?", i), QuestionKind::Essay, true, i)
            })
            .collect()
    }

    fn bundle() -> ContextBundle {
        ContextBundle::from_pairs([("skills", "Rust"), ("experience", "3 years backend")])
    }

    fn generator(provider: Arc<ScriptedProvider>) -> AnswerGenerator {
        AnswerGenerator::new(
            provider,
            Arc::new(AnswerCache::new(64)),
            4,
            "stub-model",
        )
        .with_task_policy(
            RetryPolicy::new(3)
                .with_base_delay(Duration::from_millis(1))
                .with_jitter(0.0),
        )
    }

    async fn new_run(store: &Arc<dyn StateStore>) -> Uuid {
        store
            .create_run("https://example.com/job/42", "user-1")
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_fan_out_all_succeed() {
        let provider = Arc::new(ScriptedProvider::ok());
        let gen = generator(provider.clone());
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let run_id = new_run(&store).await;

        let report = gen
            .run_fan_out(&store, run_id, &questions(3), &bundle())
            .await
            .unwrap();

        assert_eq!(report.total, 3);
        assert_eq!(report.succeeded, 3);
        assert_eq!(report.failed, 0);
        assert!(report.all_terminal());
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_reentry_makes_zero_new_calls() {
        let provider = Arc::new(ScriptedProvider::ok());
        let gen = generator(provider.clone());
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let run_id = new_run(&store).await;
        let qs = questions(3);
        let ctx = bundle();

        gen.run_fan_out(&store, run_id, &qs, &ctx).await.unwrap();
        assert_eq!(provider.calls(), 3);

        // Crash-replay: GENERATE re-entered with all tasks terminal.
        let report = gen.run_fan_out(&store, run_id, &qs, &ctx).await.unwrap();
        assert_eq!(provider.calls(), 3, "no new capability calls on re-entry");
        assert_eq!(report.already_terminal, 3);
        assert_eq!(report.succeeded, 3);
    }

    #[tokio::test]
    async fn test_cache_hit_across_runs() {
        let provider = Arc::new(ScriptedProvider::ok());
        let gen = generator(provider.clone());
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let qs = questions(2);
        let ctx = bundle();

        let first = new_run(&store).await;
        gen.run_fan_out(&store, first, &qs, &ctx).await.unwrap();
        assert_eq!(provider.calls(), 2);

        // A different run with identical (question, context) pairs is
        // served entirely from the cache.
        let second = new_run(&store).await;
        let report = gen.run_fan_out(&store, second, &qs, &ctx).await.unwrap();
        assert_eq!(provider.calls(), 2, "second run must not call the capability");
        assert_eq!(report.succeeded, 2);

        let first_answers: Vec<_> = store
            .load_tasks(first)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.answer)
            .collect();
        let second_answers: Vec<_> = store
            .load_tasks(second)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.answer)
            .collect();
        assert_eq!(first_answers, second_answers);
    }

    #[tokio::test]
    async fn test_changed_context_misses_cache() {
        let provider = Arc::new(ScriptedProvider::ok());
        let gen = generator(provider.clone());
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let qs = questions(1);

        let first = new_run(&store).await;
        gen.run_fan_out(&store, first, &qs, &bundle()).await.unwrap();

        let second = new_run(&store).await;
        let other_ctx = ContextBundle::from_pairs([("skills", "Go")]);
        gen.run_fan_out(&store, second, &qs, &other_ctx).await.unwrap();

        assert_eq!(provider.calls(), 2, "different digest must call again");
    }

    #[tokio::test]
    async fn test_partial_failure_isolated() {
        // Question 1 is policy-rejected; the others still succeed.
        let provider = Arc::new(ScriptedProvider::rejecting("Question 1?"));
        let gen = generator(provider.clone());
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let run_id = new_run(&store).await;

        let report = gen
            .run_fan_out(&store, run_id, &questions(3), &bundle())
            .await
            .unwrap();

        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert!(report.all_terminal());

        let tasks = store.load_tasks(run_id).await.unwrap();
        assert_eq!(tasks[1].status, TaskStatus::Failed);
        assert!(tasks[1].error.as_deref().unwrap().contains("Policy"));
        // A policy rejection is permanent: exactly one attempt.
        assert_eq!(tasks[1].attempt_count, 1);
    }

    #[tokio::test]
    async fn test_transient_errors_retried_to_success() {
        let provider = Arc::new(ScriptedProvider::flaky(2));
        let gen = generator(provider.clone());
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let run_id = new_run(&store).await;

        let report = gen
            .run_fan_out(&store, run_id, &questions(1), &bundle())
            .await
            .unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(provider.calls(), 3, "two transient failures then success");

        let tasks = store.load_tasks(run_id).await.unwrap();
        assert_eq!(tasks[0].attempt_count, 3);
    }

    #[tokio::test]
    async fn test_attempt_ceiling_marks_failed() {
        // More failures than the 3-attempt policy allows.
        let provider = Arc::new(ScriptedProvider::flaky(10));
        let gen = generator(provider.clone());
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let run_id = new_run(&store).await;

        let report = gen
            .run_fan_out(&store, run_id, &questions(1), &bundle())
            .await
            .unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(provider.calls(), 3, "exactly max_attempts calls");

        let tasks = store.load_tasks(run_id).await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Failed);
        assert_eq!(tasks[0].attempt_count, 3);
    }

    #[tokio::test]
    async fn test_retry_failed_task() {
        let rejecting = Arc::new(ScriptedProvider::rejecting("Question 0?"));
        let gen = generator(rejecting.clone());
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let run_id = new_run(&store).await;
        let qs = questions(1);
        let ctx = bundle();

        gen.run_fan_out(&store, run_id, &qs, &ctx).await.unwrap();
        assert_eq!(
            store.load_tasks(run_id).await.unwrap()[0].status,
            TaskStatus::Failed
        );

        // The user retries the single failed question against a now-working
        // capability.
        let working = generator(Arc::new(ScriptedProvider::ok()));
        let status = working
            .retry_failed_task(&store, run_id, &qs[0], &ctx)
            .await
            .unwrap();
        assert_eq!(status, Some(TaskStatus::Succeeded));

        // Retrying a task that is not Failed is a no-op.
        let status = working
            .retry_failed_task(&store, run_id, &qs[0], &ctx)
            .await
            .unwrap();
        assert_eq!(status, None);
    }

    #[tokio::test]
    async fn test_fan_in_leaves_no_pending_or_running() {
        let provider = Arc::new(ScriptedProvider::rejecting("Question 2?"));
        let gen = generator(provider);
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let run_id = new_run(&store).await;

        gen.run_fan_out(&store, run_id, &questions(4), &bundle())
            .await
            .unwrap();

        let tasks = store.load_tasks(run_id).await.unwrap();
        assert!(tasks.iter().all(|t| t.is_terminal()));
    }
}
