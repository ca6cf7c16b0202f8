//! Step trait, step results and the executable registry.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::Result;
use crate::model::Model;
use crate::package::PackageData;

/// Outcome class of a step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResultStatus {
    Ok,
    Warning,
    Error,
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ok => "OK",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Result of running one step against a package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: ResultStatus,
    /// Wall time of the step in milliseconds. Set by the processor.
    #[serde(default)]
    pub elapsed_ms: u64,
    /// File or directory to expose for download. Relative paths are
    /// resolved against the package directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResult {
    fn with_status(step_id: impl Into<String>, status: ResultStatus) -> Self {
        Self {
            step_id: step_id.into(),
            status,
            elapsed_ms: 0,
            download_path: None,
            error: None,
        }
    }

    pub fn ok(step_id: impl Into<String>) -> Self {
        Self::with_status(step_id, ResultStatus::Ok)
    }

    pub fn warning(step_id: impl Into<String>, message: impl Into<String>) -> Self {
        let mut result = Self::with_status(step_id, ResultStatus::Warning);
        result.error = Some(message.into());
        result
    }

    pub fn error(step_id: impl Into<String>, message: impl Into<String>) -> Self {
        let mut result = Self::with_status(step_id, ResultStatus::Error);
        result.error = Some(message.into());
        result
    }

    /// ERROR result carrying the message of a failed execution.
    pub fn from_error(step_id: impl Into<String>, err: &crate::Error) -> Self {
        Self::error(step_id, err.to_string())
    }

    pub fn with_download(mut self, path: impl Into<PathBuf>) -> Self {
        self.download_path = Some(path.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.status == ResultStatus::Error
    }
}

/// Per-execution information about the step being run.
#[derive(Debug, Clone, Default)]
pub struct StepInfo {
    pub step_id: String,
    pub name: String,
    /// Input path relative to the package directory.
    pub input: Option<String>,
    /// Declared output path relative to the package directory.
    pub output: Option<String>,
    /// Static parameters merged with declared inputs.
    pub parameters: BTreeMap<String, String>,
}

impl StepInfo {
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }
}

/// Everything a step may read while executing.
pub struct StepContext<'a> {
    pub model: &'a Model,
    pub package: &'a PackageData,
    pub info: &'a StepInfo,
}

/// A transformation applied to a package.
///
/// Implementations report their outcome through [`StepResult`]. Returning
/// `Err` (or panicking) is also accepted and recorded as an ERROR result.
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepResult>;
}

/// Step that does nothing and always succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStep;

#[async_trait]
impl Step for NoopStep {
    fn name(&self) -> &'static str {
        "nop"
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepResult> {
        Ok(StepResult::ok(&ctx.info.step_id))
    }
}

/// Maps executable names from model descriptors to step implementations.
#[derive(Clone, Default)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<dyn Step>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in steps.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("nop", Arc::new(NoopStep));
        registry
    }

    /// Register a step, replacing any previous one under the same name.
    pub fn register(&mut self, executable: impl Into<String>, step: Arc<dyn Step>) -> &mut Self {
        self.steps.insert(executable.into(), step);
        self
    }

    pub fn get(&self, executable: &str) -> Option<Arc<dyn Step>> {
        self.steps.get(executable).cloned()
    }

    pub fn contains(&self, executable: &str) -> bool {
        self.steps.contains_key(executable)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.steps.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepRegistry")
            .field("steps", &self.names())
            .finish()
    }
}
