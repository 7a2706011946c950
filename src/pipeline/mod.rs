//! The job-orchestration pipeline.
//!
//! This module owns the run state machine and its policies:
//!
//! - **run**: run, stage, and task records
//! - **retry**: exponential backoff with jitter, pure over (attempt, policy)
//! - **orchestrator**: the state machine driving a run to a terminal stage
//! - **config**: configuration for the orchestrator and its components
//!
//! # Control flow
//!
//! ```text
//!  submit(url)
//!      │
//!      ▼
//!   FETCH ──► EXTRACT ──► PERSIST_QUESTIONS ──► GENERATE ──► PERSIST_ANSWERS ──► COMPLETE
//!      │          │               │            (fan-out/fan-in)      │
//!      └──────────┴───────────────┴─────────────────┴────────────────┴──► FAILED
//! ```
//!
//! Every transition is a conditional write on the state store; a run can be
//! resumed after a crash without duplicating side effects.

pub mod config;
pub mod orchestrator;
pub mod retry;
pub mod run;

pub use config::{ConfigError, PipelineConfig};
pub use orchestrator::{JobOrchestrator, OrchestratorError};
pub use retry::RetryPolicy;
pub use run::{
    Answer, AttemptOutcome, AttemptRecord, GenerationTask, PipelineRun, RunFailure, RunStatus,
    Stage, TaskStatus,
};
