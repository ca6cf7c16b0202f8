//! packflow: a content transformation engine.
//!
//! Packages are working directories created from an uploaded original.
//! Models describe pipelines of steps; the [`Engine`] queues packages
//! through them on fixed worker pools and sweeps out stale packages.

pub mod config;
pub mod engine;
pub mod error;
pub mod job;
pub mod logging;
pub mod manager;
pub mod model;
pub mod package;
pub mod processor;
pub mod queue;
pub mod step;
pub mod sweeper;
pub mod utils;
pub mod worker_pool;

pub use config::EngineConfig;
pub use engine::{Engine, EngineOverview, QueueOverview};
pub use error::{Error, Result};
pub use job::{JobKind, JobState, PipelineJob, QueuedJob, StatusSnapshot, StepJob};
pub use model::{Model, Pipeline, StepDefinition, load_models_dir};
pub use package::{PackageData, PackageStore};
pub use step::{ResultStatus, Step, StepContext, StepRegistry, StepResult};
