use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use super::{JobCore, JobKind, JobStatus, JobSummary, QueuedJob};
use crate::model::{Model, Pipeline, StepDefinition};
use crate::package::PackageData;
use crate::step::StepResult;
use crate::{Error, Result};

/// A single step of a pipeline run against a package.
#[derive(Debug)]
pub struct StepJob {
    core: JobCore,
    model: Arc<Model>,
    pipeline: Arc<Pipeline>,
    step: Arc<StepDefinition>,
}

impl StepJob {
    pub fn new(
        model: Arc<Model>,
        pipeline: Arc<Pipeline>,
        step_id: &str,
        package: Arc<PackageData>,
        max_inactive: Duration,
    ) -> Result<Self> {
        let step = pipeline
            .step(step_id)
            .cloned()
            .ok_or_else(|| Error::not_found("Step", format!("{}/{}", pipeline.id(), step_id)))?;

        Ok(Self {
            core: JobCore::new(package, max_inactive),
            model,
            pipeline,
            step,
        })
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn step(&self) -> &Arc<StepDefinition> {
        &self.step
    }

    /// The one result of this job, once the step has run.
    pub fn result(&self) -> Option<StepResult> {
        self.core.results().into_iter().next()
    }

    pub(crate) fn set_result(&self, result: StepResult) {
        self.core.replace_result(result);
    }

    pub(crate) fn set_download(&self, path: String) {
        self.core.set_download(path);
    }
}

impl QueuedJob for StepJob {
    const KIND: JobKind = JobKind::Step;

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
        false
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
            Some(self.step.id()),
            false,
        )
    }
}
