//! Worker pool driving queued runs through the orchestrator.
//!
//! Each worker is an independent async task pulling run ids from the shared
//! queue and calling [`JobOrchestrator::drive`]. Concurrent workers on the
//! same run are harmless (the store's conditional writes let exactly one
//! transition win), but the pool avoids routine duplication by only
//! re-enqueuing runs the recovery sweep considers abandoned.
//!
//! # Features
//!
//! - Configurable number of workers
//! - Graceful shutdown with broadcast channel
//! - Startup recovery sweep for stale non-terminal runs
//! - Pool statistics tracking

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::pipeline::run::Stage;
use crate::pipeline::JobOrchestrator;
use crate::storage::StateStore;

use super::queue::{QueueError, RunQueue};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Queue failure.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// How long a worker waits on an empty queue before re-polling.
    pub poll_interval: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
    /// Age after which a non-terminal run counts as abandoned.
    pub stale_run_after: Duration,
    /// How often the recovery sweep re-checks the store.
    pub sweep_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 2,
            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(60),
            stale_run_after: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Sets the abandoned-run threshold.
    pub fn with_stale_run_after(mut self, stale_run_after: Duration) -> Self {
        self.stale_run_after = stale_run_after;
        self
    }

    /// Sets the recovery sweep interval.
    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently driving runs.
    pub active_workers: usize,
    /// Runs driven to COMPLETE.
    pub runs_completed: u64,
    /// Runs driven to FAILED.
    pub runs_failed: u64,
    /// Average drive duration.
    pub average_drive_duration: Duration,
}

impl PoolStats {
    /// Total runs driven to a terminal stage.
    pub fn total_driven(&self) -> u64 {
        self.runs_completed + self.runs_failed
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    runs_completed: AtomicU64,
    runs_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            runs_completed: AtomicU64::new(0),
            runs_failed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record(&self, completed: bool, duration: Duration) {
        if completed {
            self.runs_completed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.runs_failed.fetch_add(1, Ordering::SeqCst);
        }
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.runs_completed.load(Ordering::SeqCst);
        let failed = self.runs_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let total = completed + failed;

        let average = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            runs_completed: completed,
            runs_failed: failed,
            average_drive_duration: average,
        }
    }
}

/// Worker pool that drives queued runs to their terminal stage.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: Arc<RunQueue>,
    orchestrator: Arc<JobOrchestrator>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a worker pool over a queue and an orchestrator.
    pub fn new(
        config: WorkerPoolConfig,
        queue: Arc<RunQueue>,
        orchestrator: Arc<JobOrchestrator>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            queue,
            orchestrator,
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Starts all workers and the recovery sweep.
    ///
    /// The sweep re-enqueues non-terminal runs whose last update is older
    /// than the stale threshold, which is how runs abandoned by a crashed
    /// process get picked up again.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        // Initial recovery: anything non-terminal and stale gets a worker.
        match self.sweep_stale_runs().await {
            Ok(recovered) if recovered > 0 => {
                info!(recovered, "Recovered stale runs at startup");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Startup recovery sweep failed"),
        }

        for i in 0..self.config.num_workers {
            let worker = Worker {
                id: format!("worker-{}", i),
                queue: Arc::clone(&self.queue),
                orchestrator: Arc::clone(&self.orchestrator),
                shutdown_rx: self.shutdown_tx.subscribe(),
                poll_interval: self.config.poll_interval,
                stats: Arc::clone(&self.stats),
            };

            self.worker_handles.push(tokio::spawn(async move {
                worker.run().await;
            }));
        }

        // Periodic recovery sweep.
        let sweeper = Sweeper {
            queue: Arc::clone(&self.queue),
            orchestrator: Arc::clone(&self.orchestrator),
            shutdown_rx: self.shutdown_tx.subscribe(),
            stale_run_after: self.config.stale_run_after,
            sweep_interval: self.config.sweep_interval,
        };
        self.worker_handles.push(tokio::spawn(async move {
            sweeper.run().await;
        }));

        self.is_running.store(true, Ordering::SeqCst);
        info!(num_workers = self.config.num_workers, "Worker pool started");
        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");
        // Ignore send error - workers may have already stopped.
        let _ = self.shutdown_tx.send(());

        let shutdown_future = async {
            for handle in self.worker_handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        match tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await {
            Ok(()) => {
                self.is_running.store(false, Ordering::SeqCst);
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => {
                self.is_running.store(false, Ordering::SeqCst);
                Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout))
            }
        }
    }

    /// Re-enqueues stale non-terminal runs. Returns how many were queued.
    async fn sweep_stale_runs(&self) -> Result<usize, PoolError> {
        sweep_once(
            &self.queue,
            &self.orchestrator,
            self.config.stale_run_after,
        )
        .await
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the run queue.
    pub fn queue(&self) -> &Arc<RunQueue> {
        &self.queue
    }
}

/// One pass of the stale-run recovery sweep.
async fn sweep_once(
    queue: &Arc<RunQueue>,
    orchestrator: &Arc<JobOrchestrator>,
    stale_run_after: Duration,
) -> Result<usize, PoolError> {
    let stale = match orchestrator
        .store()
        .list_stale_runs(stale_run_after.as_secs() as i64)
        .await
    {
        Ok(ids) => ids,
        Err(e) => {
            warn!(error = %e, "Stale-run listing failed");
            return Ok(0);
        }
    };

    let count = stale.len();
    for run_id in stale {
        queue.enqueue(run_id)?;
    }
    Ok(count)
}

/// Periodic recovery sweep task.
struct Sweeper {
    queue: Arc<RunQueue>,
    orchestrator: Arc<JobOrchestrator>,
    shutdown_rx: broadcast::Receiver<()>,
    stale_run_after: Duration,
    sweep_interval: Duration,
}

impl Sweeper {
    async fn run(mut self) {
        loop {
            match tokio::time::timeout(self.sweep_interval, self.shutdown_rx.recv()).await {
                Ok(_) => {
                    debug!("Sweeper received shutdown signal");
                    return;
                }
                Err(_) => {
                    // Interval elapsed without shutdown; sweep.
                    match sweep_once(&self.queue, &self.orchestrator, self.stale_run_after).await {
                        Ok(recovered) if recovered > 0 => {
                            info!(recovered, "Recovery sweep re-enqueued stale runs");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "Recovery sweep failed");
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// A single worker that drives runs from the queue.
struct Worker {
    id: String,
    queue: Arc<RunQueue>,
    orchestrator: Arc<JobOrchestrator>,
    shutdown_rx: broadcast::Receiver<()>,
    poll_interval: Duration,
    stats: Arc<SharedPoolStats>,
}

impl Worker {
    /// Main worker loop: poll, drive, repeat until shutdown.
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.queue.dequeue(self.poll_interval).await {
                Ok(Some(queued)) => self.drive_run(queued.run_id).await,
                Ok(None) => {
                    debug!(worker_id = %self.id, "No runs queued");
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Queue closed, stopping worker");
                    break;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Drives one run to a terminal stage and records stats.
    async fn drive_run(&self, run_id: uuid::Uuid) {
        let start = Instant::now();
        self.stats.active_workers.fetch_add(1, Ordering::SeqCst);

        info!(worker_id = %self.id, run_id = %run_id, "Driving run");
        let result = self.orchestrator.drive(run_id).await;
        let duration = start.elapsed();

        self.stats.active_workers.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(run) => {
                let completed = run.stage == Stage::Complete;
                self.stats.record(completed, duration);
                info!(
                    worker_id = %self.id,
                    run_id = %run_id,
                    stage = %run.stage,
                    duration_ms = duration.as_millis() as u64,
                    "Run reached terminal stage"
                );
            }
            Err(e) => {
                self.stats.record(false, duration);
                error!(
                    worker_id = %self.id,
                    run_id = %run_id,
                    error = %e,
                    "Drive failed on infrastructure error"
                );
            }
        }
    }
}
