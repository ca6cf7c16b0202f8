//! Pipeline jobs and single-step jobs.

mod pipeline_job;
mod status;
mod step_job;

pub use pipeline_job::PipelineJob;
pub use status::{JobState, JobStatus, StatusSnapshot};
pub use step_job::StepJob;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::package::PackageData;
use crate::step::StepResult;

/// Which manager a job belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Pipeline,
    Step,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pipeline => write!(f, "pipeline"),
            Self::Step => write!(f, "step"),
        }
    }
}

/// Lane a job was routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobMode {
    Fast,
    Slow,
}

/// Serializable view of a job for status documents.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub id: String,
    pub package_id: String,
    pub kind: JobKind,
    pub model: String,
    pub pipeline_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(flatten)]
    pub status: StatusSnapshot,
    pub mode: JobMode,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download: Option<String>,
    pub results: Vec<StepResult>,
}

/// Behaviour shared by every job kind held in a [`crate::queue::JobQueue`].
pub trait QueuedJob: Send + Sync + 'static {
    const KIND: JobKind;

    fn id(&self) -> &str;

    fn package(&self) -> &Arc<PackageData>;

    fn package_id(&self) -> &str {
        self.package().id()
    }

    fn status(&self) -> &JobStatus;

    fn is_slow(&self) -> bool;

    fn created_at(&self) -> DateTime<Utc>;

    /// True once the job has existed longer than its max inactive time.
    fn is_inactive(&self) -> bool;

    fn results(&self) -> Vec<StepResult>;

    /// Relative path of the captured download, if any.
    fn download(&self) -> Option<String>;

    fn summary(&self) -> JobSummary;
}

/// Bookkeeping common to both job kinds.
#[derive(Debug)]
pub(crate) struct JobCore {
    pub(crate) id: String,
    pub(crate) package: Arc<PackageData>,
    pub(crate) status: JobStatus,
    pub(crate) created_at: DateTime<Utc>,
    created: Instant,
    max_inactive: Duration,
    results: Mutex<Vec<StepResult>>,
    download: Mutex<Option<String>>,
}

impl JobCore {
    pub(crate) fn new(package: Arc<PackageData>, max_inactive: Duration) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            package,
            status: JobStatus::new(),
            created_at: Utc::now(),
            created: Instant::now(),
            max_inactive,
            results: Mutex::new(Vec::new()),
            download: Mutex::new(None),
        }
    }

    pub(crate) fn is_inactive(&self) -> bool {
        self.created.elapsed() >= self.max_inactive
    }

    pub(crate) fn results(&self) -> Vec<StepResult> {
        self.results.lock().clone()
    }

    pub(crate) fn push_result(&self, result: StepResult) {
        self.results.lock().push(result);
    }

    pub(crate) fn replace_result(&self, result: StepResult) {
        *self.results.lock() = vec![result];
    }

    pub(crate) fn download(&self) -> Option<String> {
        self.download.lock().clone()
    }

    pub(crate) fn set_download(&self, path: String) {
        *self.download.lock() = Some(path);
    }

    pub(crate) fn summary(
        &self,
        kind: JobKind,
        model: &str,
        pipeline_id: &str,
        step_id: Option<&str>,
        slow: bool,
    ) -> JobSummary {
        JobSummary {
            id: self.id.clone(),
            package_id: self.package.id().to_string(),
            kind,
            model: model.to_string(),
            pipeline_id: pipeline_id.to_string(),
            step_id: step_id.map(str::to_string),
            status: self.status.snapshot(),
            mode: if slow { JobMode::Slow } else { JobMode::Fast },
            created_at: self.created_at,
            download: self.download(),
            results: self.results(),
        }
    }
}
