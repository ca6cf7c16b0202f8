//! The engine: package store, both job managers and the cleanup sweeper.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::job::{JobSummary, PipelineJob, QueuedJob, StatusSnapshot, StepJob};
use crate::manager::{JobManager, JobManagerConfig};
use crate::model::Model;
use crate::package::{PackageData, PackageStore};
use crate::processor::ProcessorContext;
use crate::queue::{ActivePackages, QueueSnapshot};
use crate::sweeper::{CleanupSweeper, SweeperStatus};
use crate::utils::fs::ensure_dir_all_sync;
use crate::{Error, Result};

/// Jobs of one kind, grouped by bucket.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueOverview {
    pub running: Vec<JobSummary>,
    pub completed: Vec<JobSummary>,
    pub waiting: Vec<JobSummary>,
    pub slow: Vec<JobSummary>,
}

impl QueueOverview {
    fn from_snapshot<J: QueuedJob>(snapshot: &QueueSnapshot<J>) -> Self {
        let summarize = |jobs: &[Arc<J>]| jobs.iter().map(|j| j.summary()).collect::<Vec<_>>();
        Self {
            running: summarize(&snapshot.running),
            completed: summarize(&snapshot.completed),
            waiting: summarize(&snapshot.waiting),
            slow: summarize(&snapshot.slow),
        }
    }

    pub fn len(&self) -> usize {
        self.running.len() + self.completed.len() + self.waiting.len() + self.slow.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Status document covering every job the engine knows about.
#[derive(Debug, Clone, Serialize)]
pub struct EngineOverview {
    pub pipelines: QueueOverview,
    pub steps: QueueOverview,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweeper: Option<SweeperStatus>,
}

struct SweeperTask {
    sweeper: Arc<CleanupSweeper>,
    handle: JoinHandle<()>,
}

impl SweeperTask {
    async fn stop(self) {
        self.sweeper.stop();
        if let Err(e) = self.handle.await
            && !e.is_cancelled()
        {
            warn!(error = %e, "Cleanup sweeper task ended abnormally");
        }
    }
}

/// Entry point for creating packages and running them through pipelines.
pub struct Engine {
    config: EngineConfig,
    models: BTreeMap<String, Arc<Model>>,
    store: PackageStore,
    pipelines: JobManager<PipelineJob>,
    steps: JobManager<StepJob>,
    sweeper: Option<SweeperTask>,
}

impl Engine {
    /// Build and start an engine. Must be called inside a tokio runtime.
    pub fn new(config: EngineConfig, models: Vec<Arc<Model>>) -> Result<Self> {
        config.validate()?;

        let mut by_name = BTreeMap::new();
        for model in models {
            let name = model.name().to_string();
            if by_name.insert(name.clone(), model).is_some() {
                return Err(Error::config(format!("duplicate model '{name}'")));
            }
        }

        let store = PackageStore::open(&config.packages_root)?;
        ensure_dir_all_sync(&config.download_dir())?;
        ensure_dir_all_sync(&config.upload_dir())?;

        let ctx = Arc::new(ProcessorContext::new(config.download_dir()));
        let pipelines = JobManager::new(
            JobManagerConfig {
                queue: config.pipeline_queue.clone(),
                pool: config.pipeline_pool.clone(),
            },
            ctx.clone(),
        );
        let steps = JobManager::new(
            JobManagerConfig {
                queue: config.step_queue.clone(),
                pool: config.step_pool.clone(),
            },
            ctx,
        );

        let sweeper = start_sweeper(&config, &pipelines, &steps)?;

        info!(
            root = %config.packages_root.display(),
            models = by_name.len(),
            sweeper = sweeper.is_some(),
            "Engine started"
        );

        Ok(Self {
            config,
            models: by_name,
            store,
            pipelines,
            steps,
            sweeper,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &PackageStore {
        &self.store
    }

    pub fn model(&self, name: &str) -> Option<&Arc<Model>> {
        self.models.get(name)
    }

    pub fn models(&self) -> impl Iterator<Item = &Arc<Model>> {
        self.models.values()
    }

    fn require_model(&self, name: &str) -> Result<&Arc<Model>> {
        self.model(name).ok_or_else(|| Error::not_found("Model", name))
    }

    /// Create a package for `model`, optionally copying in an original file.
    pub async fn create_package(
        &self,
        model: &str,
        original: Option<&Path>,
        parameters: &BTreeMap<String, String>,
    ) -> Result<Arc<PackageData>> {
        let model = self.require_model(model)?;
        let package = self.store.create(model.name(), original).await?;
        if !parameters.is_empty() {
            for (name, value) in parameters {
                package.set_parameter(name.as_str(), value.as_str());
            }
            package.persist().await?;
        }
        Ok(package)
    }

    /// Queue `package` for a whole pipeline. `None` picks the model's default
    /// pipeline. Returns the job id.
    pub fn submit_pipeline(
        &self,
        model: &str,
        pipeline_id: Option<&str>,
        package: Arc<PackageData>,
    ) -> Result<String> {
        let model = self.require_model(model)?;
        let pipeline = match pipeline_id {
            Some(id) => model.pipeline(id),
            None => model.default_pipeline(),
        }
        .ok_or_else(|| Error::not_found("Pipeline", pipeline_id.unwrap_or("<default>")))?
        .clone();
        package.check_directory()?;

        let size = package.original_size();
        let slow = size > self.config.slow_threshold_bytes;
        let job = PipelineJob::new(model.clone(), pipeline, package, self.config.max_inactive())
            .with_slow(slow);

        let id = self.pipelines.add_job(Arc::new(job));
        info!(job_id = %id, model = %model.name(), size, slow, "Pipeline job submitted");
        Ok(id)
    }

    /// Queue a single step of a pipeline. `None` picks the first step.
    pub fn submit_step(
        &self,
        model: &str,
        pipeline_id: &str,
        step_id: Option<&str>,
        package: Arc<PackageData>,
    ) -> Result<String> {
        let model = self.require_model(model)?;
        let pipeline = model
            .pipeline(pipeline_id)
            .ok_or_else(|| Error::not_found("Pipeline", pipeline_id))?
            .clone();
        let step_id = match step_id {
            Some(id) => id.to_string(),
            None => pipeline
                .step_at(0)
                .map(|s| s.id().to_string())
                .ok_or_else(|| {
                    Error::validation(format!("pipeline '{pipeline_id}' has no steps"))
                })?,
        };
        package.check_directory()?;

        let job = StepJob::new(
            model.clone(),
            pipeline,
            &step_id,
            package,
            self.config.max_inactive(),
        )?;

        let id = self.steps.add_job(Arc::new(job));
        info!(job_id = %id, model = %model.name(), step = %step_id, "Step job submitted");
        Ok(id)
    }

    pub fn pipeline_status(&self, job_id: &str) -> Option<StatusSnapshot> {
        self.pipelines.check_status(job_id)
    }

    pub fn step_status(&self, job_id: &str) -> Option<StatusSnapshot> {
        self.steps.check_status(job_id)
    }

    pub fn pipeline_job(&self, job_id: &str) -> Option<Arc<PipelineJob>> {
        self.pipelines.get_job(job_id)
    }

    pub fn step_job(&self, job_id: &str) -> Option<Arc<StepJob>> {
        self.steps.get_job(job_id)
    }

    /// Jobs of either kind not yet picked up by a worker.
    pub fn pending_count(&self) -> usize {
        self.pipelines.pending_count() + self.steps.pending_count()
    }

    pub fn sweeper_status(&self) -> Option<SweeperStatus> {
        self.sweeper.as_ref().map(|s| s.sweeper.status())
    }

    pub fn overview(&self) -> EngineOverview {
        EngineOverview {
            pipelines: QueueOverview::from_snapshot(&self.pipelines.snapshot()),
            steps: QueueOverview::from_snapshot(&self.steps.snapshot()),
            sweeper: self.sweeper_status(),
        }
    }

    /// Stop everything and return a fresh engine with the same models and
    /// configuration. Every queued job is discarded.
    pub async fn shutdown(self) -> Result<Engine> {
        info!("Shutting down engine");
        if let Some(sweeper) = self.sweeper {
            sweeper.stop().await;
        }
        let pipelines = self.pipelines.stop().await;
        let steps = self.steps.stop().await;
        let sweeper = start_sweeper(&self.config, &pipelines, &steps)?;

        info!("Engine restarted");
        Ok(Self {
            config: self.config,
            models: self.models,
            store: self.store,
            pipelines,
            steps,
            sweeper,
        })
    }

    /// Stop everything for good.
    pub async fn close(self) {
        info!("Closing engine");
        if let Some(sweeper) = self.sweeper {
            sweeper.stop().await;
        }
        self.pipelines.close().await;
        self.steps.close().await;
        info!("Engine closed");
    }
}

fn start_sweeper(
    config: &EngineConfig,
    pipelines: &JobManager<PipelineJob>,
    steps: &JobManager<StepJob>,
) -> Result<Option<SweeperTask>> {
    if !config.sweeper.enabled {
        return Ok(None);
    }

    let active: Vec<Arc<dyn ActivePackages>> = vec![
        pipelines.queue().clone() as Arc<dyn ActivePackages>,
        steps.queue().clone() as Arc<dyn ActivePackages>,
    ];
    let sweeper = CleanupSweeper::from_config(&config.packages_root, &config.sweeper, active)?;
    sweeper.add_ignore(config.download_dir());
    sweeper.add_ignore(config.upload_dir());

    let sweeper = Arc::new(sweeper);
    let handle = Arc::clone(&sweeper).start();
    Ok(Some(SweeperTask { sweeper, handle }))
}
