//! Engine configuration.
//!
//! Configuration is read from an optional JSON file and then overridden by
//! `PACKFLOW_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::queue::QueueConfig;
use crate::sweeper::SweeperConfig;
use crate::utils::fs::io_error;
use crate::worker_pool::WorkerPoolConfig;
use crate::{Error, Result};

pub const ENV_CONFIG_FILE: &str = "PACKFLOW_CONFIG";
pub const ENV_PACKAGES_ROOT: &str = "PACKFLOW_PACKAGES_ROOT";
pub const ENV_DOWNLOAD_DIR: &str = "PACKFLOW_DOWNLOAD_DIR";
pub const ENV_MODELS_DIR: &str = "PACKFLOW_MODELS_DIR";
pub const ENV_WORKERS: &str = "PACKFLOW_WORKERS";
pub const ENV_SLOW_THRESHOLD_BYTES: &str = "PACKFLOW_SLOW_THRESHOLD_BYTES";
pub const ENV_MAX_INACTIVE_MS: &str = "PACKFLOW_MAX_INACTIVE_MS";

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root directory holding one working directory per package.
    #[serde(default = "default_packages_root")]
    pub packages_root: PathBuf,

    /// Where downloadable artifacts are captured. Defaults to `<packages_root>/downloads`.
    #[serde(default)]
    pub download_dir: Option<PathBuf>,

    /// Shared upload staging directory. Defaults to `<packages_root>/upload`.
    #[serde(default)]
    pub upload_dir: Option<PathBuf>,

    /// Directory of model descriptor files.
    #[serde(default)]
    pub models_dir: Option<PathBuf>,

    /// Inputs larger than this many bytes are processed in the slow lane.
    #[serde(default = "default_slow_threshold_bytes")]
    pub slow_threshold_bytes: u64,

    /// Time after creation at which a finished job may be evicted.
    #[serde(default = "default_max_inactive_ms")]
    pub max_inactive_ms: u64,

    #[serde(default)]
    pub pipeline_queue: QueueConfig,

    #[serde(default)]
    pub step_queue: QueueConfig,

    #[serde(default)]
    pub pipeline_pool: WorkerPoolConfig,

    #[serde(default)]
    pub step_pool: WorkerPoolConfig,

    #[serde(default)]
    pub sweeper: SweeperConfig,
}

fn default_packages_root() -> PathBuf {
    PathBuf::from("./packages")
}

fn default_slow_threshold_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_max_inactive_ms() -> u64 {
    60 * 60 * 1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            packages_root: default_packages_root(),
            download_dir: None,
            upload_dir: None,
            models_dir: None,
            slow_threshold_bytes: default_slow_threshold_bytes(),
            max_inactive_ms: default_max_inactive_ms(),
            pipeline_queue: QueueConfig::default(),
            step_queue: QueueConfig::default(),
            pipeline_pool: WorkerPoolConfig::default(),
            step_pool: WorkerPoolConfig::default(),
            sweeper: SweeperConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn new(packages_root: impl Into<PathBuf>) -> Self {
        Self {
            packages_root: packages_root.into(),
            ..Self::default()
        }
    }

    /// Parse a JSON configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| io_error("reading config", path, e))?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::config(format!("invalid config file {}: {}", path.display(), e)))
    }

    /// Build the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(ENV_CONFIG_FILE) {
            Some(path) if !path.trim().is_empty() => Self::from_file(Path::new(path.trim()))?,
            _ => Self::default(),
        };

        if let Some(root) = lookup(ENV_PACKAGES_ROOT) {
            config.packages_root = PathBuf::from(root);
        }
        if let Some(dir) = lookup(ENV_DOWNLOAD_DIR) {
            config.download_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = lookup(ENV_MODELS_DIR) {
            config.models_dir = Some(PathBuf::from(dir));
        }
        if let Some(workers) = lookup(ENV_WORKERS) {
            let workers = parse_env(ENV_WORKERS, &workers)?;
            config.pipeline_pool.max_workers = workers;
            config.step_pool.max_workers = workers;
        }
        if let Some(bytes) = lookup(ENV_SLOW_THRESHOLD_BYTES) {
            config.slow_threshold_bytes = parse_env(ENV_SLOW_THRESHOLD_BYTES, &bytes)?;
        }
        if let Some(ms) = lookup(ENV_MAX_INACTIVE_MS) {
            config.max_inactive_ms = parse_env(ENV_MAX_INACTIVE_MS, &ms)?;
        }

        Ok(config)
    }

    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = Some(dir.into());
        self
    }

    pub fn with_upload_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.upload_dir = Some(dir.into());
        self
    }

    pub fn with_slow_threshold_bytes(mut self, bytes: u64) -> Self {
        self.slow_threshold_bytes = bytes;
        self
    }

    pub fn with_max_inactive_ms(mut self, ms: u64) -> Self {
        self.max_inactive_ms = ms;
        self
    }

    pub fn with_pipeline_pool(mut self, pool: WorkerPoolConfig) -> Self {
        self.pipeline_pool = pool;
        self
    }

    pub fn with_step_pool(mut self, pool: WorkerPoolConfig) -> Self {
        self.step_pool = pool;
        self
    }

    pub fn with_sweeper(mut self, sweeper: SweeperConfig) -> Self {
        self.sweeper = sweeper;
        self
    }

    /// Effective artifact directory.
    pub fn download_dir(&self) -> PathBuf {
        self.download_dir
            .clone()
            .unwrap_or_else(|| self.packages_root.join("downloads"))
    }

    /// Effective upload staging directory.
    pub fn upload_dir(&self) -> PathBuf {
        self.upload_dir
            .clone()
            .unwrap_or_else(|| self.packages_root.join("upload"))
    }

    pub fn max_inactive(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.max_inactive_ms)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline_pool.max_workers == 0 || self.step_pool.max_workers == 0 {
            return Err(Error::config("max_workers must be at least 1"));
        }
        if self.sweeper.enabled
            && (self.sweeper.max_inactive_ms == 0 || self.sweeper.check_interval_ms == 0)
        {
            return Err(Error::config(
                "sweeper max_inactive_ms and check_interval_ms must be positive",
            ));
        }
        if self.packages_root.as_os_str().is_empty() {
            return Err(Error::config("packages_root must not be empty"));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::config(format!("invalid value for {key}: '{value}' ({e})")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.packages_root, PathBuf::from("./packages"));
        assert_eq!(config.slow_threshold_bytes, 10 * 1024 * 1024);
        assert_eq!(config.max_inactive_ms, 3_600_000);
        assert_eq!(config.pipeline_queue.max_completed_jobs, 1000);
        assert_eq!(config.pipeline_pool.max_workers, 1);
        assert_eq!(config.pipeline_pool.rest_interval_ms, 1000);
        assert!(config.sweeper.enabled);
        assert_eq!(config.sweeper.check_interval_ms, 600_000);
        assert_eq!(
            config.download_dir(),
            PathBuf::from("./packages").join("downloads")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"packages_root": "/srv/pkg", "pipeline_pool": {"max_workers": 4}}"#,
        )
        .unwrap();
        assert_eq!(config.packages_root, PathBuf::from("/srv/pkg"));
        assert_eq!(config.pipeline_pool.max_workers, 4);
        assert_eq!(config.pipeline_pool.rest_interval_ms, 1000);
        assert_eq!(config.step_pool.max_workers, 1);
        assert_eq!(config.upload_dir(), PathBuf::from("/srv/pkg/upload"));
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = EngineConfig::from_lookup(lookup(&[
            (ENV_PACKAGES_ROOT, "/data/packages"),
            (ENV_WORKERS, "3"),
            (ENV_SLOW_THRESHOLD_BYTES, "2048"),
            (ENV_MAX_INACTIVE_MS, "500"),
        ]))
        .unwrap();

        assert_eq!(config.packages_root, PathBuf::from("/data/packages"));
        assert_eq!(config.pipeline_pool.max_workers, 3);
        assert_eq!(config.step_pool.max_workers, 3);
        assert_eq!(config.slow_threshold_bytes, 2048);
        assert_eq!(config.max_inactive_ms, 500);
    }

    #[test]
    fn test_from_lookup_reads_config_file_first() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("packflow.json");
        std::fs::write(&file, r#"{"slow_threshold_bytes": 42, "max_inactive_ms": 7}"#).unwrap();

        let path = file.to_string_lossy().to_string();
        let config = EngineConfig::from_lookup(lookup(&[
            (ENV_CONFIG_FILE, path.as_str()),
            (ENV_MAX_INACTIVE_MS, "9"),
        ]))
        .unwrap();

        assert_eq!(config.slow_threshold_bytes, 42);
        assert_eq!(config.max_inactive_ms, 9);
    }

    #[test]
    fn test_invalid_values_are_configuration_errors() {
        let err = EngineConfig::from_lookup(lookup(&[(ENV_WORKERS, "many")])).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let temp = TempDir::new().unwrap();
        let file = temp.path().join("bad.json");
        std::fs::write(&file, "{not json").unwrap();
        assert!(matches!(
            EngineConfig::from_file(&file),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = EngineConfig::default().with_pipeline_pool(WorkerPoolConfig {
            max_workers: 0,
            rest_interval_ms: 10,
        });
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        let config = EngineConfig::default().with_sweeper(SweeperConfig {
            enabled: true,
            max_inactive_ms: 1,
            check_interval_ms: 0,
        });
        assert!(config.validate().is_err());
    }
}
