//! Models, pipelines and step definitions.
//!
//! A [`Model`] groups the [`Pipeline`]s offered for one kind of content.
//! Each pipeline is an ordered list of [`StepDefinition`]s bound to a
//! [`Step`] implementation. All of these are immutable once loaded.

pub mod descriptor;

pub use descriptor::{
    ModelDescriptor, PipelineDescriptor, StepDescriptor, load_models_dir,
};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::package::PackageData;
use crate::step::Step;

/// A named input a step reads from the package parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepInput {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    /// Human readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// One step of a pipeline.
pub struct StepDefinition {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) executable: String,
    pub(crate) pipeline_id: String,
    pub(crate) asynchronous: bool,
    pub(crate) fail_on_error: bool,
    pub(crate) downloadable: bool,
    pub(crate) viewable: bool,
    pub(crate) wait: bool,
    pub(crate) output: Option<String>,
    pub(crate) parameters: BTreeMap<String, String>,
    pub(crate) inputs: Vec<StepInput>,
    pub(crate) step: Arc<dyn Step>,
}

impl StepDefinition {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn executable(&self) -> &str {
        &self.executable
    }

    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    pub fn is_asynchronous(&self) -> bool {
        self.asynchronous
    }

    /// Whether an ERROR result stops the pipeline.
    pub fn fail_on_error(&self) -> bool {
        self.fail_on_error
    }

    pub fn is_downloadable(&self) -> bool {
        self.downloadable
    }

    pub fn is_viewable(&self) -> bool {
        self.viewable
    }

    pub fn wait(&self) -> bool {
        self.wait
    }

    pub fn output(&self) -> Option<&str> {
        self.output.as_deref()
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    pub fn inputs(&self) -> &[StepInput] {
        &self.inputs
    }

    pub fn step(&self) -> &Arc<dyn Step> {
        &self.step
    }

    /// Static parameters merged with the declared inputs.
    ///
    /// An input takes the package parameter of the same name, falling back
    /// to its default. Inputs with neither are left out.
    pub fn step_parameters(&self, package: &PackageData) -> BTreeMap<String, String> {
        let mut merged = self.parameters.clone();
        for input in &self.inputs {
            if let Some(value) = package.parameter(&input.name).or_else(|| input.default.clone()) {
                merged.insert(input.name.clone(), value);
            }
        }
        merged
    }
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("id", &self.id)
            .field("executable", &self.executable)
            .field("pipeline_id", &self.pipeline_id)
            .field("fail_on_error", &self.fail_on_error)
            .field("downloadable", &self.downloadable)
            .field("output", &self.output)
            .finish_non_exhaustive()
    }
}

/// An ordered sequence of steps.
#[derive(Debug)]
pub struct Pipeline {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) description: Option<String>,
    pub(crate) accepts: Option<String>,
    pub(crate) is_default: bool,
    pub(crate) steps: Vec<Arc<StepDefinition>>,
}

impl Pipeline {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Media type of the input this pipeline accepts.
    pub fn accepts(&self) -> Option<&str> {
        self.accepts.as_deref()
    }

    pub fn is_default(&self) -> bool {
        self.is_default
    }

    pub fn steps(&self) -> &[Arc<StepDefinition>] {
        &self.steps
    }

    pub fn step(&self, id: &str) -> Option<&Arc<StepDefinition>> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_at(&self, index: usize) -> Option<&Arc<StepDefinition>> {
        self.steps.get(index)
    }

    pub fn position(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Input of the step at `index`: the closest previous declared output,
    /// else the package's original file. Relative to the package directory.
    pub fn input_for(&self, index: usize, package: &PackageData) -> Option<String> {
        self.steps[..index.min(self.steps.len())]
            .iter()
            .rev()
            .find_map(|s| s.output.clone())
            .or_else(|| package.original_name())
    }
}

/// A named group of pipelines.
#[derive(Debug)]
pub struct Model {
    pub(crate) name: String,
    pub(crate) description: Option<String>,
    pub(crate) pipelines: Vec<Arc<Pipeline>>,
}

impl Model {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn pipelines(&self) -> &[Arc<Pipeline>] {
        &self.pipelines
    }

    pub fn pipeline(&self, id: &str) -> Option<&Arc<Pipeline>> {
        self.pipelines.iter().find(|p| p.id == id)
    }

    pub fn pipeline_at(&self, index: usize) -> Option<&Arc<Pipeline>> {
        self.pipelines.get(index)
    }

    /// The pipeline flagged as default, else the first one.
    pub fn default_pipeline(&self) -> Option<&Arc<Pipeline>> {
        self.pipelines
            .iter()
            .find(|p| p.is_default)
            .or_else(|| self.pipelines.first())
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}

/// Ids are restricted to ASCII letters, digits, `_` and `-`.
pub(crate) fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepRegistry;
    use tempfile::TempDir;

    const MODEL: &str = r#"{
        "name": "demo",
        "pipelines": [
            {
                "id": "html",
                "steps": [
                    {"id": "tidy", "executable": "nop", "output": "tidy.xml"},
                    {"id": "check", "executable": "nop"},
                    {
                        "id": "render",
                        "executable": "nop",
                        "parameters": {"style": "default.xsl"},
                        "inputs": [
                            {"name": "lang", "default": "en"},
                            {"name": "title"},
                            {"name": "toc"}
                        ]
                    }
                ]
            },
            {"id": "pdf", "default": true, "steps": [{"id": "fo", "executable": "nop"}]}
        ]
    }"#;

    fn model() -> Model {
        Model::from_json_str(MODEL, &StepRegistry::with_builtins()).unwrap()
    }

    #[test]
    fn test_is_valid_id() {
        assert!(is_valid_id("step_1-a"));
        assert!(!is_valid_id(""));
        assert!(!is_valid_id("has space"));
        assert!(!is_valid_id("dot.ted"));
    }

    #[test]
    fn test_model_lookups() {
        let model = model();
        assert_eq!(model.len(), 2);
        assert_eq!(model.default_pipeline().unwrap().id(), "pdf");
        assert_eq!(model.pipeline_at(0).unwrap().id(), "html");
        assert!(model.pipeline("epub").is_none());

        let html = model.pipeline("html").unwrap();
        assert_eq!(html.len(), 3);
        assert_eq!(html.position("render"), Some(2));
        assert_eq!(html.step_at(1).unwrap().id(), "check");
        assert_eq!(html.step("tidy").unwrap().pipeline_id(), "html");
        assert!(html.step("nope").is_none());
    }

    #[test]
    fn test_input_chaining() {
        let temp = TempDir::new().unwrap();
        let pkg = PackageData::new("P".into(), temp.path().to_path_buf(), Some("book.xml".into()));
        let html = model().pipeline("html").unwrap().clone();

        assert_eq!(html.input_for(0, &pkg).as_deref(), Some("book.xml"));
        assert_eq!(html.input_for(1, &pkg).as_deref(), Some("tidy.xml"));
        // Step "check" declares no output, so "tidy" is still the closest.
        assert_eq!(html.input_for(2, &pkg).as_deref(), Some("tidy.xml"));

        let bare = PackageData::new("Q".into(), temp.path().to_path_buf(), None);
        assert_eq!(html.input_for(0, &bare), None);
    }

    #[test]
    fn test_step_parameters_merge() {
        let temp = TempDir::new().unwrap();
        let pkg = PackageData::new("P".into(), temp.path().to_path_buf(), None);
        pkg.set_parameter("title", "Manual");

        let model = model();
        let render = model.pipeline("html").unwrap().step("render").unwrap();
        let params = render.step_parameters(&pkg);

        assert_eq!(params.get("style").map(String::as_str), Some("default.xsl"));
        assert_eq!(params.get("lang").map(String::as_str), Some("en"));
        assert_eq!(params.get("title").map(String::as_str), Some("Manual"));
        assert!(!params.contains_key("toc"));

        pkg.set_parameter("lang", "fr");
        assert_eq!(
            render.step_parameters(&pkg).get("lang").map(String::as_str),
            Some("fr")
        );
    }
}
