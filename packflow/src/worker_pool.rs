//! Fixed-size pools of long-lived worker tasks, one pool per lane.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::processor::{Process, ProcessorContext, run_worker};
use crate::queue::{JobQueue, Lane};

/// Configuration for a worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Pause after each job, in milliseconds.
    #[serde(default = "default_rest_interval_ms")]
    pub rest_interval_ms: u64,
}

fn default_max_workers() -> usize {
    1
}

fn default_rest_interval_ms() -> u64 {
    1000
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            rest_interval_ms: default_rest_interval_ms(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_rest_interval_ms(mut self, ms: u64) -> Self {
        self.rest_interval_ms = ms;
        self
    }

    pub fn rest_interval(&self) -> Duration {
        Duration::from_millis(self.rest_interval_ms)
    }
}

/// A pool of workers draining one lane of a queue.
pub struct WorkerPool {
    name: String,
    lane: Lane,
    config: WorkerPoolConfig,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, lane: Lane, config: WorkerPoolConfig) -> Self {
        Self {
            name: name.into(),
            lane,
            config,
            cancellation_token: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Spawn `max_workers` tasks taking jobs from this pool's lane.
    pub fn start<J: Process>(&self, queue: Arc<JobQueue<J>>, ctx: Arc<ProcessorContext>) {
        info!(
            pool = %self.name,
            lane = %self.lane,
            workers = self.config.max_workers,
            "Starting worker pool"
        );

        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            warn!(pool = %self.name, "Worker pool already stopped, not starting");
            return;
        };

        for i in 0..self.config.max_workers {
            join_set.spawn(run_worker(
                format!("{} - {}", self.name, i + 1),
                queue.clone(),
                self.lane,
                ctx.clone(),
                self.config.rest_interval(),
                self.cancellation_token.clone(),
            ));
        }
    }

    /// Stop the pool. In-flight jobs are interrupted, not awaited.
    pub async fn stop(&self) {
        info!(pool = %self.name, "Stopping worker pool");
        self.cancellation_token.cancel();

        let join_set = self.tasks.lock().take();
        if let Some(mut join_set) = join_set {
            join_set.abort_all();
            while let Some(joined) = join_set.join_next().await {
                if let Err(e) = joined
                    && !e.is_cancelled()
                {
                    warn!(pool = %self.name, error = %e, "Worker task ended abnormally");
                }
            }
        }

        debug!(pool = %self.name, "Worker pool stopped");
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lane(&self) -> Lane {
        self.lane
    }

    pub fn max_workers(&self) -> usize {
        self.config.max_workers
    }

    /// Number of worker tasks still alive.
    pub fn worker_count(&self) -> usize {
        self.tasks.lock().as_ref().map_or(0, JoinSet::len)
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.max_workers, 1);
        assert_eq!(config.rest_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_worker_pool_config_builders() {
        let config = WorkerPoolConfig::default()
            .with_max_workers(3)
            .with_rest_interval_ms(5);
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.rest_interval_ms, 5);
    }

    #[tokio::test]
    async fn test_worker_pool_lifecycle() {
        let queue: Arc<JobQueue<crate::job::PipelineJob>> =
            Arc::new(JobQueue::new("pipeline", Default::default(), true));
        let ctx = Arc::new(ProcessorContext::new(std::env::temp_dir()));
        let pool = WorkerPool::new(
            "Pipeline Processor",
            Lane::Fast,
            WorkerPoolConfig::default().with_max_workers(2),
        );

        assert!(pool.is_running());
        pool.start(queue.clone(), ctx.clone());
        assert_eq!(pool.worker_count(), 2);

        pool.stop().await;
        assert!(!pool.is_running());
        assert_eq!(pool.worker_count(), 0);

        // A stopped pool cannot be restarted.
        pool.start(queue, ctx);
        assert_eq!(pool.worker_count(), 0);
    }
}
