//! Run scheduling: queue and worker pool.
//!
//! Submitted runs are handed to a pool of workers through an in-process
//! queue. There is deliberately no message broker: the durable state store
//! is the single source of truth, and abandoned runs are re-discovered from
//! it by a periodic stale-run sweep.
//!
//! ```text
//!   submit ──► RunQueue ──► Worker 1..N ──► JobOrchestrator::drive
//!                 ▲                              │
//!                 └────── stale-run sweep ◄──────┘ (state store)
//! ```

pub mod queue;
pub mod worker_pool;

pub use queue::{QueueError, QueuedRun, RunQueue};
pub use worker_pool::{PoolError, PoolStats, WorkerPool, WorkerPoolConfig};
