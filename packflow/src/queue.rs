//! In-memory job queue with fast and slow lanes.
//!
//! Jobs move through four buckets: `waiting` or `slow` (FIFO lanes),
//! `running` and a bounded `completed` list. Every transition happens under
//! one lock and updates the id index in the same critical section, so a
//! lookup always reports the bucket a job is really in.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::job::QueuedJob;

/// Default number of completed jobs kept before eviction starts.
pub const DEFAULT_MAX_COMPLETED_JOBS: usize = 1000;

/// Queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Completed jobs kept for lookup before inactive ones are evicted.
    /// Zero falls back to the default.
    #[serde(default = "default_max_completed_jobs")]
    pub max_completed_jobs: usize,
}

fn default_max_completed_jobs() -> usize {
    DEFAULT_MAX_COMPLETED_JOBS
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_completed_jobs: default_max_completed_jobs(),
        }
    }
}

impl QueueConfig {
    pub fn with_max_completed_jobs(mut self, max: usize) -> Self {
        self.max_completed_jobs = max;
        self
    }

    fn effective_max(&self) -> usize {
        if self.max_completed_jobs == 0 {
            DEFAULT_MAX_COMPLETED_JOBS
        } else {
            self.max_completed_jobs
        }
    }
}

/// Which lane a worker takes jobs from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    Fast,
    Slow,
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fast => write!(f, "fast"),
            Self::Slow => write!(f, "slow"),
        }
    }
}

/// Where a job currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    Waiting,
    Slow,
    Running,
    Completed,
}

/// Index record for one job.
pub struct IndexEntry<J> {
    pub bucket: Bucket,
    pub job: Arc<J>,
}

impl<J> Clone for IndexEntry<J> {
    fn clone(&self) -> Self {
        Self {
            bucket: self.bucket,
            job: Arc::clone(&self.job),
        }
    }
}

/// Bulk export of a queue, grouped by bucket.
pub struct QueueSnapshot<J> {
    pub running: Vec<Arc<J>>,
    pub completed: Vec<Arc<J>>,
    pub waiting: Vec<Arc<J>>,
    pub slow: Vec<Arc<J>>,
}

impl<J> QueueSnapshot<J> {
    /// All jobs, running first, then completed, waiting and slow.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<J>> {
        self.running
            .iter()
            .chain(&self.completed)
            .chain(&self.waiting)
            .chain(&self.slow)
    }

    pub fn len(&self) -> usize {
        self.running.len() + self.completed.len() + self.waiting.len() + self.slow.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Something that can tell whether a package still has pending work.
pub trait ActivePackages: Send + Sync {
    fn is_package_active(&self, package_id: &str) -> bool;
}

struct Buckets<J> {
    waiting: VecDeque<Arc<J>>,
    slow: VecDeque<Arc<J>>,
    running: Vec<Arc<J>>,
    completed: VecDeque<Arc<J>>,
}

impl<J> Default for Buckets<J> {
    fn default() -> Self {
        Self {
            waiting: VecDeque::new(),
            slow: VecDeque::new(),
            running: Vec::new(),
            completed: VecDeque::new(),
        }
    }
}

/// Job queue for one job kind.
pub struct JobQueue<J> {
    name: String,
    config: QueueConfig,
    has_slow_lane: bool,
    buckets: Mutex<Buckets<J>>,
    /// Job id to bucket + job.
    index: DashMap<String, IndexEntry<J>>,
    /// Package id to ids of its waiting, slow or running jobs.
    active_packages: DashMap<String, Vec<String>>,
    fast_notify: Notify,
    slow_notify: Notify,
    locked: AtomicBool,
}

impl<J: QueuedJob> JobQueue<J> {
    pub fn new(name: impl Into<String>, config: QueueConfig, has_slow_lane: bool) -> Self {
        Self {
            name: name.into(),
            config,
            has_slow_lane,
            buckets: Mutex::new(Buckets::default()),
            index: DashMap::new(),
            active_packages: DashMap::new(),
            fast_notify: Notify::new(),
            slow_notify: Notify::new(),
            locked: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_slow_lane(&self) -> bool {
        self.has_slow_lane
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    fn assert_unlocked(&self, op: &str) {
        if self.is_locked() {
            panic!("{op} called on drained job queue '{}'", self.name);
        }
    }

    /// Lane a job is routed to by this queue.
    pub fn lane_for(&self, job: &J) -> Lane {
        if job.is_slow() && self.has_slow_lane {
            Lane::Slow
        } else {
            Lane::Fast
        }
    }

    fn notify_for(&self, lane: Lane) -> &Notify {
        match lane {
            Lane::Fast => &self.fast_notify,
            Lane::Slow => &self.slow_notify,
        }
    }

    /// Add a job to its lane and wake one worker of that lane.
    ///
    /// # Panics
    ///
    /// Panics if the queue has been drained.
    pub fn enqueue(&self, job: Arc<J>) {
        self.assert_unlocked("enqueue");

        let lane = self.lane_for(&job);
        let id = job.id().to_string();
        let evicted = {
            let mut buckets = self.buckets.lock();
            let bucket = match lane {
                Lane::Fast => {
                    buckets.waiting.push_back(Arc::clone(&job));
                    Bucket::Waiting
                }
                Lane::Slow => {
                    buckets.slow.push_back(Arc::clone(&job));
                    Bucket::Slow
                }
            };
            self.index.insert(
                id.clone(),
                IndexEntry {
                    bucket,
                    job: Arc::clone(&job),
                },
            );
            self.active_packages
                .entry(job.package_id().to_string())
                .or_default()
                .push(id.clone());

            self.evict_completed(&mut buckets)
        };

        info!(
            queue = %self.name,
            job_id = %id,
            package_id = %job.package_id(),
            lane = %lane,
            "Enqueued job"
        );
        if evicted > 0 {
            debug!(queue = %self.name, evicted, "Evicted inactive completed jobs");
        }

        self.notify_for(lane).notify_one();
    }

    /// Drop completed jobs, oldest first, while the bucket is at its bound
    /// and the job is past its inactive time.
    fn evict_completed(&self, buckets: &mut Buckets<J>) -> usize {
        let max = self.config.effective_max();
        let mut evicted = 0;
        let mut i = 0;
        while i < buckets.completed.len() {
            if buckets.completed.len() < max {
                break;
            }
            if buckets.completed[i].is_inactive() {
                if let Some(job) = buckets.completed.remove(i) {
                    self.index.remove(job.id());
                    evicted += 1;
                }
            } else {
                i += 1;
            }
        }
        evicted
    }

    fn try_next(&self, lane: Lane) -> Option<Arc<J>> {
        let mut buckets = self.buckets.lock();
        let job = match lane {
            Lane::Fast => buckets.waiting.pop_front(),
            Lane::Slow => buckets.slow.pop_front(),
        }?;
        buckets.running.push(Arc::clone(&job));
        if let Some(mut entry) = self.index.get_mut(job.id()) {
            entry.bucket = Bucket::Running;
        }
        Some(job)
    }

    /// Wait for the next job of `lane` and move it to `running`.
    ///
    /// # Panics
    ///
    /// Panics if the queue has been drained.
    pub async fn next(&self, lane: Lane) -> Arc<J> {
        loop {
            self.assert_unlocked("next");
            if let Some(job) = self.try_next(lane) {
                debug!(queue = %self.name, job_id = %job.id(), lane = %lane, "Dequeued job");
                return job;
            }
            self.notify_for(lane).notified().await;
        }
    }

    /// Move a job from `running` to `completed`. Returns false if it was not running.
    pub fn mark_completed(&self, job: &J) -> bool {
        let mut buckets = self.buckets.lock();
        let Some(pos) = buckets.running.iter().position(|j| j.id() == job.id()) else {
            return false;
        };
        let job = buckets.running.swap_remove(pos);
        buckets.completed.push_back(Arc::clone(&job));
        if let Some(mut entry) = self.index.get_mut(job.id()) {
            entry.bucket = Bucket::Completed;
        }
        self.release_package(job.package_id(), job.id());
        true
    }

    fn release_package(&self, package_id: &str, job_id: &str) {
        let now_empty = match self.active_packages.get_mut(package_id) {
            Some(mut ids) => {
                ids.retain(|id| id != job_id);
                ids.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.active_packages
                .remove_if(package_id, |_, ids| ids.is_empty());
        }
    }

    pub fn lookup(&self, job_id: &str) -> Option<Arc<J>> {
        self.index.get(job_id).map(|entry| Arc::clone(&entry.job))
    }

    pub fn lookup_entry(&self, job_id: &str) -> Option<IndexEntry<J>> {
        self.index.get(job_id).map(|entry| entry.clone())
    }

    /// Jobs waiting in either lane.
    pub fn size(&self) -> usize {
        let buckets = self.buckets.lock();
        buckets.waiting.len() + buckets.slow.len()
    }

    pub fn running_count(&self) -> usize {
        self.buckets.lock().running.len()
    }

    pub fn completed_count(&self) -> usize {
        self.buckets.lock().completed.len()
    }

    pub fn snapshot(&self) -> QueueSnapshot<J> {
        let buckets = self.buckets.lock();
        QueueSnapshot {
            running: buckets.running.clone(),
            completed: buckets.completed.iter().cloned().collect(),
            waiting: buckets.waiting.iter().cloned().collect(),
            slow: buckets.slow.iter().cloned().collect(),
        }
    }

    /// Stop every unfinished job, empty the queue and lock it for good.
    ///
    /// Returns the number of jobs marked STOPPED.
    pub fn drain_and_lock(&self) -> usize {
        self.locked.store(true, Ordering::Release);

        let drained = std::mem::take(&mut *self.buckets.lock());
        let mut stopped = 0;
        for job in drained
            .waiting
            .iter()
            .chain(&drained.slow)
            .chain(&drained.running)
        {
            if job.status().stop() {
                stopped += 1;
            }
        }
        self.index.clear();
        self.active_packages.clear();

        info!(queue = %self.name, stopped, "Job queue drained");
        stopped
    }
}

impl<J: QueuedJob> ActivePackages for JobQueue<J> {
    fn is_package_active(&self, package_id: &str) -> bool {
        self.active_packages
            .get(package_id)
            .is_some_and(|ids| !ids.is_empty())
    }
}
