use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use super::{JobCore, JobKind, JobStatus, JobSummary, QueuedJob};
use crate::model::{Model, Pipeline};
use crate::package::PackageData;
use crate::step::StepResult;

/// A package scheduled to run through every step of a pipeline.
#[derive(Debug)]
pub struct PipelineJob {
    core: JobCore,
    model: Arc<Model>,
    pipeline: Arc<Pipeline>,
    slow: bool,
}

impl PipelineJob {
    pub fn new(
        model: Arc<Model>,
        pipeline: Arc<Pipeline>,
        package: Arc<PackageData>,
        max_inactive: Duration,
    ) -> Self {
        Self {
            core: JobCore::new(package, max_inactive),
            model,
            pipeline,
            slow: false,
        }
    }

    /// Route the job to the slow lane.
    pub fn with_slow(mut self, slow: bool) -> Self {
        self.slow = slow;
        self
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub(crate) fn push_result(&self, result: StepResult) {
        self.core.push_result(result);
    }

    pub(crate) fn set_download(&self, path: String) {
        self.core.set_download(path);
    }
}

impl QueuedJob for PipelineJob {
    const KIND: JobKind = JobKind::Pipeline;

    fn id(&self) -> &str {
        &self.core.id
    }

    fn package(&self) -> &Arc<PackageData> {
        &self.core.package
    }

    fn status(&self) -> &JobStatus {
        &self.core.status
    }

    fn is_slow(&self) -> bool {
        self.slow
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.core.created_at
    }

    fn is_inactive(&self) -> bool {
        self.core.is_inactive()
    }

    fn results(&self) -> Vec<StepResult> {
        self.core.results()
    }

    fn download(&self) -> Option<String> {
        self.core.download()
    }

    fn summary(&self) -> JobSummary {
        self.core.summary(
            Self::KIND,
            self.model.name(),
            self.pipeline.id(),
            None,
            self.slow,
        )
    }
}
