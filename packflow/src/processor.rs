//! Job processors and the worker loop that drives them.
//!
//! A pipeline job runs its steps strictly in order. Progress moves in two
//! phases per step: a small buffer when the step starts, then the rest of
//! the step's even share when it returns. The job only becomes COMPLETED or
//! FAILED after the last step that is going to run has finished.

use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::job::{JobState, PipelineJob, QueuedJob, StepJob};
use crate::model::{Model, StepDefinition};
use crate::package::PackageData;
use crate::queue::{JobQueue, Lane};
use crate::step::{ResultStatus, StepContext, StepInfo, StepResult};
use crate::utils::archive::zip_directory;
use crate::{Error, Result};

/// Percentage granted when a step starts, capped to the step's share.
pub const STEP_START_BUFFER: usize = 5;

/// Shared settings for processing jobs.
#[derive(Debug, Clone)]
pub struct ProcessorContext {
    /// Root under which downloadable artifacts are captured.
    pub download_dir: PathBuf,
}

impl ProcessorContext {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
        }
    }
}

/// A job kind a worker knows how to run.
#[async_trait]
pub trait Process: QueuedJob {
    /// Run the job to a final state. Faults are recorded on the job itself.
    async fn process(&self, ctx: &ProcessorContext);
}

#[async_trait]
impl Process for PipelineJob {
    async fn process(&self, ctx: &ProcessorContext) {
        let status = self.status();
        let package = self.package();
        let pipeline = self.pipeline();
        status.start();

        let total = pipeline.len();
        info!(
            job_id = %self.id(),
            package_id = %package.id(),
            pipeline = %pipeline.id(),
            steps = total,
            "Pipeline job started"
        );

        let share = if total == 0 { 100 } else { 100 / total };
        let buffer = STEP_START_BUFFER.min(share);
        let mut first_error: Option<String> = None;

        for (index, step) in pipeline.steps().iter().enumerate() {
            if status.state() == JobState::Stopped {
                debug!(job_id = %self.id(), "Job stopped, abandoning remaining steps");
                return;
            }

            status.advance_to(percent(index * share + buffer));
            let input = pipeline.input_for(index, package);
            let mut result = run_step(self.model(), package, step, input).await;
            status.advance_to(percent((index + 1) * share));

            if let Some(download) = capture_if_requested(ctx, package, &mut result).await {
                self.set_download(download);
            }

            let failed = result.is_error();
            if failed {
                let message = result.error.clone().unwrap_or_default();
                warn!(
                    job_id = %self.id(),
                    step = %step.id(),
                    error = %message,
                    fail_on_error = step.fail_on_error(),
                    "Step failed"
                );
                first_error
                    .get_or_insert_with(|| format!("step '{}' failed: {}", step.id(), message));
            } else {
                debug!(
                    job_id = %self.id(),
                    step = %step.id(),
                    status = %result.status,
                    elapsed_ms = result.elapsed_ms,
                    "Step finished"
                );
            }
            self.push_result(result);

            if failed && step.fail_on_error() {
                break;
            }
        }

        match first_error {
            Some(message) => {
                status.fail(message);
                info!(job_id = %self.id(), percentage = status.percentage(), "Pipeline job failed");
            }
            None => {
                status.complete();
                info!(job_id = %self.id(), "Pipeline job completed");
            }
        }
    }
}

#[async_trait]
impl Process for StepJob {
    async fn process(&self, ctx: &ProcessorContext) {
        let status = self.status();
        let package = self.package();
        let step = self.step();
        status.start();
        status.advance_to(percent(STEP_START_BUFFER));

        info!(
            job_id = %self.id(),
            package_id = %package.id(),
            step = %step.id(),
            "Step job started"
        );

        let index = self.pipeline().position(step.id()).unwrap_or(0);
        let input = self.pipeline().input_for(index, package);
        let mut result = run_step(self.model(), package, step, input).await;

        if let Some(download) = capture_if_requested(ctx, package, &mut result).await {
            self.set_download(download);
        }

        let failure = result
            .is_error()
            .then(|| result.error.clone().unwrap_or_default());
        self.set_result(result);

        match failure {
            Some(message) => {
                warn!(job_id = %self.id(), step = %step.id(), error = %message, "Step job failed");
                status.fail(format!("step '{}' failed: {}", step.id(), message));
            }
            None => {
                status.complete();
                info!(job_id = %self.id(), "Step job completed");
            }
        }
    }
}

fn percent(value: usize) -> u8 {
    value.min(100) as u8
}

/// Execute one step. Errors and panics become ERROR results.
pub(crate) async fn run_step(
    model: &Model,
    package: &PackageData,
    step: &StepDefinition,
    input: Option<String>,
) -> StepResult {
    let info = StepInfo {
        step_id: step.id().to_string(),
        name: step.name().to_string(),
        input,
        output: step.output().map(str::to_string),
        parameters: step.step_parameters(package),
    };
    let ctx = StepContext {
        model,
        package,
        info: &info,
    };

    let started = Instant::now();
    let outcome = AssertUnwindSafe(step.step().execute(&ctx))
        .catch_unwind()
        .await;

    let mut result = match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => StepResult::from_error(step.id(), &e),
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(step = %step.id(), panic = %message, "Step panicked");
            StepResult::error(step.id(), format!("step panicked: {message}"))
        }
    };
    result.step_id = step.id().to_string();
    result.elapsed_ms = started.elapsed().as_millis() as u64;
    result
}

/// Capture the result's artifact when it carries one and the step reported OK.
///
/// On failure the result is turned into an ERROR result.
async fn capture_if_requested(
    ctx: &ProcessorContext,
    package: &PackageData,
    result: &mut StepResult,
) -> Option<String> {
    if result.status != ResultStatus::Ok {
        return None;
    }
    let path = result.download_path.clone()?;

    match capture_artifact(&ctx.download_dir, package, &path).await {
        Ok(relative) => {
            debug!(package_id = %package.id(), download = %relative, "Artifact captured");
            Some(relative)
        }
        Err(e) => {
            warn!(
                package_id = %package.id(),
                path = %path.display(),
                error = %e,
                "Artifact capture failed"
            );
            let elapsed_ms = result.elapsed_ms;
            *result = StepResult::error(
                result.step_id.clone(),
                format!("artifact capture failed: {e}"),
            )
            .with_download(path);
            result.elapsed_ms = elapsed_ms;
            None
        }
    }
}

/// Copy a file, or zip a directory, into `<download_root>/<package id>/`.
///
/// Returns the path relative to `download_root`, `/`-separated.
pub(crate) async fn capture_artifact(
    download_root: &Path,
    package: &PackageData,
    path: &Path,
) -> Result<String> {
    let source = if path.is_absolute() {
        path.to_path_buf()
    } else {
        package.directory().join(path)
    };
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::validation(format!("artifact has no name: {}", source.display())))?;

    let dest_dir = package.download_dir(download_root)?;
    let package_id = package.id().to_string();

    tokio::task::spawn_blocking(move || -> Result<String> {
        if source.is_dir() {
            let file_name = format!("{name}.zip");
            zip_directory(&source, &dest_dir.join(&file_name))?;
            Ok(format!("{package_id}/{file_name}"))
        } else if source.is_file() {
            let dest = dest_dir.join(&name);
            if dest != source {
                std::fs::copy(&source, &dest)
                    .map_err(|e| crate::utils::fs::io_error("copying artifact to", &dest, e))?;
            }
            Ok(format!("{package_id}/{name}"))
        } else {
            Err(Error::not_found("Artifact", source.display().to_string()))
        }
    })
    .await
    .map_err(|e| Error::Other(format!("artifact capture task failed: {e}")))?
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic payload".to_string()
}

/// Worker loop: take a job from `lane`, process it, file it, rest, repeat.
///
/// Exits when `cancel` fires. A panic escaping a processor fails the job and
/// the loop carries on.
pub async fn run_worker<J: Process>(
    name: String,
    queue: Arc<JobQueue<J>>,
    lane: Lane,
    ctx: Arc<ProcessorContext>,
    rest_interval: Duration,
    cancel: CancellationToken,
) {
    debug!(worker = %name, lane = %lane, "Worker started");

    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = queue.next(lane) => job,
        };

        let outcome = AssertUnwindSafe(job.process(&ctx)).catch_unwind().await;
        if let Err(panic) = outcome {
            let message = panic_message(panic.as_ref());
            error!(worker = %name, job_id = %job.id(), panic = %message, "Processor panicked");
            job.status().fail(format!("processor panicked: {message}"));
        }

        if job.status().has_completed() {
            queue.mark_completed(&job);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(rest_interval) => {}
        }
    }

    debug!(worker = %name, "Worker stopped");
}
