//! Job managers: one queue plus the worker pools draining it.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::job::{JobKind, StatusSnapshot};
use crate::processor::{Process, ProcessorContext};
use crate::queue::{JobQueue, Lane, QueueConfig, QueueSnapshot};
use crate::worker_pool::{WorkerPool, WorkerPoolConfig};

/// Configuration for a [`JobManager`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobManagerConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    /// Fast lane pool. The slow lane, when present, always has one worker.
    #[serde(default)]
    pub pool: WorkerPoolConfig,
}

/// Queue and workers for one job kind.
///
/// Pipeline managers run a fast pool and a single-worker slow pool. Step
/// managers only have the fast pool.
pub struct JobManager<J> {
    config: JobManagerConfig,
    ctx: Arc<ProcessorContext>,
    queue: Arc<JobQueue<J>>,
    fast_pool: WorkerPool,
    slow_pool: Option<WorkerPool>,
}

impl<J: Process> JobManager<J> {
    /// Build the queue and start the workers. Must run inside a tokio runtime.
    pub fn new(config: JobManagerConfig, ctx: Arc<ProcessorContext>) -> Self {
        let (label, slow_lane) = match J::KIND {
            JobKind::Pipeline => ("Pipeline Processor", true),
            JobKind::Step => ("Step Processor", false),
        };

        let queue = Arc::new(JobQueue::new(
            J::KIND.to_string(),
            config.queue.clone(),
            slow_lane,
        ));

        let fast_pool = WorkerPool::new(label, Lane::Fast, config.pool.clone());
        fast_pool.start(queue.clone(), ctx.clone());

        let slow_pool = slow_lane.then(|| {
            let pool = WorkerPool::new(
                format!("{label} (slow)"),
                Lane::Slow,
                config.pool.clone().with_max_workers(1),
            );
            pool.start(queue.clone(), ctx.clone());
            pool
        });

        info!(kind = %J::KIND, workers = config.pool.max_workers, slow_lane, "Job manager started");

        Self {
            config,
            ctx,
            queue,
            fast_pool,
            slow_pool,
        }
    }

    /// Queue a job. Returns its id.
    pub fn add_job(&self, job: Arc<J>) -> String {
        let id = job.id().to_string();
        self.queue.enqueue(job);
        id
    }

    pub fn check_status(&self, job_id: &str) -> Option<StatusSnapshot> {
        self.queue.lookup(job_id).map(|job| job.status().snapshot())
    }

    pub fn get_job(&self, job_id: &str) -> Option<Arc<J>> {
        self.queue.lookup(job_id)
    }

    /// Jobs not yet picked up by a worker.
    pub fn pending_count(&self) -> usize {
        self.queue.size()
    }

    pub fn snapshot(&self) -> QueueSnapshot<J> {
        self.queue.snapshot()
    }

    pub fn queue(&self) -> &Arc<JobQueue<J>> {
        &self.queue
    }

    pub fn config(&self) -> &JobManagerConfig {
        &self.config
    }

    async fn halt(&self) -> usize {
        self.fast_pool.stop().await;
        if let Some(pool) = &self.slow_pool {
            pool.stop().await;
        }
        self.queue.drain_and_lock()
    }

    /// Stop the workers, discard every queued job and return a fresh manager
    /// built from the same configuration.
    pub async fn stop(self) -> Self {
        let stopped = self.halt().await;
        info!(kind = %J::KIND, stopped, "Job manager restarted");
        Self::new(self.config, self.ctx)
    }

    /// Stop the workers and discard every queued job.
    pub async fn close(self) {
        let stopped = self.halt().await;
        info!(kind = %J::KIND, stopped, "Job manager closed");
    }
}
