//! JSON model descriptors and the loader that binds them to steps.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::{Model, Pipeline, StepDefinition, StepInput, is_valid_id};
use crate::step::StepRegistry;
use crate::utils::fs::io_error;
use crate::{Error, Result};

/// Serialized form of a [`Model`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub pipelines: Vec<PipelineDescriptor>,
}

/// Serialized form of a [`Pipeline`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub accepts: Option<String>,
    #[serde(default, rename = "default")]
    pub is_default: bool,
    #[serde(default)]
    pub steps: Vec<StepDescriptor>,
}

/// Serialized form of a [`StepDefinition`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Registry key of the step implementation.
    pub executable: String,
    #[serde(default, rename = "async")]
    pub asynchronous: bool,
    #[serde(default = "default_true")]
    pub fail_on_error: bool,
    #[serde(default)]
    pub downloadable: bool,
    #[serde(default)]
    pub viewable: bool,
    #[serde(default)]
    pub wait: bool,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub inputs: Vec<StepInput>,
}

fn default_true() -> bool {
    true
}

impl Model {
    /// Build a model from its descriptor, resolving every executable.
    pub fn from_descriptor(descriptor: ModelDescriptor, registry: &StepRegistry) -> Result<Self> {
        if !is_valid_id(&descriptor.name) {
            return Err(Error::config(format!(
                "invalid model name '{}'",
                descriptor.name
            )));
        }

        let mut seen = HashSet::new();
        let mut defaults = 0;
        let mut pipelines = Vec::with_capacity(descriptor.pipelines.len());

        for pipeline in descriptor.pipelines {
            if !seen.insert(pipeline.id.clone()) {
                return Err(Error::config(format!(
                    "duplicate pipeline id '{}' in model '{}'",
                    pipeline.id, descriptor.name
                )));
            }
            if pipeline.is_default {
                defaults += 1;
            }
            pipelines.push(Arc::new(build_pipeline(&descriptor.name, pipeline, registry)?));
        }

        if defaults > 1 {
            return Err(Error::config(format!(
                "model '{}' declares {} default pipelines",
                descriptor.name, defaults
            )));
        }

        Ok(Self {
            name: descriptor.name,
            description: descriptor.description,
            pipelines,
        })
    }

    pub fn from_json_str(json: &str, registry: &StepRegistry) -> Result<Self> {
        let descriptor: ModelDescriptor = serde_json::from_str(json)
            .map_err(|e| Error::config(format!("invalid model descriptor: {e}")))?;
        Self::from_descriptor(descriptor, registry)
    }

    /// Load a model descriptor file.
    pub fn load(path: &Path, registry: &StepRegistry) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| io_error("reading model", path, e))?;
        let model = Self::from_json_str(&raw, registry).map_err(|e| match e {
            Error::Configuration(msg) => Error::config(format!("{}: {}", path.display(), msg)),
            other => other,
        })?;
        debug!(model = %model.name, path = %path.display(), "Model loaded");
        Ok(model)
    }
}

fn build_pipeline(
    model_name: &str,
    descriptor: PipelineDescriptor,
    registry: &StepRegistry,
) -> Result<Pipeline> {
    if !is_valid_id(&descriptor.id) {
        return Err(Error::config(format!(
            "invalid pipeline id '{}' in model '{}'",
            descriptor.id, model_name
        )));
    }

    let mut seen = HashSet::new();
    let mut steps = Vec::with_capacity(descriptor.steps.len());

    for step in descriptor.steps {
        if !is_valid_id(&step.id) {
            return Err(Error::config(format!(
                "invalid step id '{}' in pipeline '{}'",
                step.id, descriptor.id
            )));
        }
        if !seen.insert(step.id.clone()) {
            return Err(Error::config(format!(
                "duplicate step id '{}' in pipeline '{}'",
                step.id, descriptor.id
            )));
        }
        let implementation = registry.get(&step.executable).ok_or_else(|| {
            Error::config(format!(
                "unknown executable '{}' for step '{}'",
                step.executable, step.id
            ))
        })?;

        steps.push(Arc::new(StepDefinition {
            name: step.name.unwrap_or_else(|| step.id.clone()),
            id: step.id,
            executable: step.executable,
            pipeline_id: descriptor.id.clone(),
            asynchronous: step.asynchronous,
            fail_on_error: step.fail_on_error,
            downloadable: step.downloadable,
            viewable: step.viewable,
            wait: step.wait,
            output: step.output,
            parameters: step.parameters,
            inputs: step.inputs,
            step: implementation,
        }));
    }

    Ok(Pipeline {
        name: descriptor.name.unwrap_or_else(|| descriptor.id.clone()),
        id: descriptor.id,
        description: descriptor.description,
        accepts: descriptor.accepts,
        is_default: descriptor.is_default,
        steps,
    })
}

/// Load every `*.json` descriptor in `dir`, sorted by file name.
pub fn load_models_dir(dir: &Path, registry: &StepRegistry) -> Result<Vec<Arc<Model>>> {
    let entries = std::fs::read_dir(dir).map_err(|e| io_error("reading models directory", dir, e))?;

    let mut paths: Vec<_> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|x| x == "json"))
        .collect();
    paths.sort();

    let mut names = HashSet::new();
    let mut models = Vec::with_capacity(paths.len());
    for path in paths {
        let model = Model::load(&path, registry)?;
        if !names.insert(model.name.clone()) {
            return Err(Error::config(format!(
                "duplicate model name '{}' in {}",
                model.name,
                path.display()
            )));
        }
        models.push(Arc::new(model));
    }

    info!(count = models.len(), dir = %dir.display(), "Models loaded");
    Ok(models)
}
