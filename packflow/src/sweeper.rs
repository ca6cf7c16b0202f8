//! Background cleanup of expired package directories.
//!
//! The sweeper walks the packages root periodically. Top-level directories
//! are packages: they are left alone while a queue still holds work for
//! them or while they are fresh. Everything else is deleted once its
//! modification time is older than the configured max inactive time.
//! Paths on the ignore list are walked into but never deleted themselves.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::queue::ActivePackages;
use crate::utils::fs::io_error;
use crate::{Error, Result};

/// Configuration for the cleanup sweeper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Age after which files and package directories are removed.
    #[serde(default = "default_max_inactive_ms")]
    pub max_inactive_ms: u64,

    /// Pause between two sweeps.
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_max_inactive_ms() -> u64 {
    60 * 60 * 1000 // 1 hour
}

fn default_check_interval_ms() -> u64 {
    10 * 60 * 1000 // 10 minutes
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_inactive_ms: default_max_inactive_ms(),
            check_interval_ms: default_check_interval_ms(),
        }
    }
}

impl SweeperConfig {
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_max_inactive_ms(mut self, ms: u64) -> Self {
        self.max_inactive_ms = ms;
        self
    }

    pub fn with_check_interval_ms(mut self, ms: u64) -> Self {
        self.check_interval_ms = ms;
        self
    }
}

/// Lifecycle of the sweeper loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SweeperStatus {
    NotStarted,
    Running,
    WaitingNextIteration,
    Stopping,
    Stopped,
    Failed,
}

/// What happened to one node of the walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOutcome {
    /// Left alone without looking inside.
    Kept,
    Deleted,
    /// Examined but still present.
    Retained,
}

/// Counters for one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub files_deleted: usize,
    pub dirs_deleted: usize,
    /// Package directories skipped because they are active or fresh.
    pub kept: usize,
    pub errors: usize,
    /// The sweep was cut short by `stop`.
    pub interrupted: bool,
}

impl SweepReport {
    pub fn deleted(&self) -> usize {
        self.files_deleted + self.dirs_deleted
    }
}

/// Periodic deletion of expired content under a root directory.
pub struct CleanupSweeper {
    root: PathBuf,
    max_inactive: Duration,
    check_interval: Duration,
    active: Vec<Arc<dyn ActivePackages>>,
    ignores: RwLock<Vec<PathBuf>>,
    status: RwLock<SweeperStatus>,
    cancellation_token: CancellationToken,
}

impl CleanupSweeper {
    pub fn new(
        root: impl Into<PathBuf>,
        max_inactive: Duration,
        check_interval: Duration,
        active: Vec<Arc<dyn ActivePackages>>,
    ) -> Result<Self> {
        let root = root.into();
        if max_inactive.is_zero() {
            return Err(Error::config("sweeper max inactive time must be positive"));
        }
        if check_interval.is_zero() {
            return Err(Error::config("sweeper check interval must be positive"));
        }
        if !root.is_dir() {
            return Err(Error::config(format!(
                "sweeper root is not a directory: {}",
                root.display()
            )));
        }

        debug!(root = %root.display(), ?max_inactive, ?check_interval, "Cleanup sweeper created");

        Ok(Self {
            root,
            max_inactive,
            check_interval,
            active,
            ignores: RwLock::new(Vec::new()),
            status: RwLock::new(SweeperStatus::NotStarted),
            cancellation_token: CancellationToken::new(),
        })
    }

    pub fn from_config(
        root: impl Into<PathBuf>,
        config: &SweeperConfig,
        active: Vec<Arc<dyn ActivePackages>>,
    ) -> Result<Self> {
        Self::new(
            root,
            Duration::from_millis(config.max_inactive_ms),
            Duration::from_millis(config.check_interval_ms),
            active,
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn status(&self) -> SweeperStatus {
        *self.status.read()
    }

    /// Never delete `path` itself. Directories are still walked.
    pub fn add_ignore(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let mut ignores = self.ignores.write();
        if !ignores.contains(&path) {
            ignores.push(path);
        }
    }

    pub fn remove_ignore(&self, path: &Path) {
        self.ignores.write().retain(|p| p != path);
    }

    pub fn ignored(&self) -> Vec<PathBuf> {
        self.ignores.read().clone()
    }

    fn is_ignored(&self, path: &Path) -> bool {
        self.ignores.read().iter().any(|p| p == path)
    }

    fn is_active(&self, package_id: &str) -> bool {
        self.active.iter().any(|a| a.is_package_active(package_id))
    }

    fn is_expired(&self, modified: SystemTime, now: SystemTime) -> bool {
        now.duration_since(modified)
            .is_ok_and(|age| age > self.max_inactive)
    }

    /// Set the loop status unless a stop has been requested meanwhile.
    fn set_loop_status(&self, status: SweeperStatus) {
        let mut current = self.status.write();
        if *current != SweeperStatus::Stopping {
            *current = status;
        }
    }

    /// Run one sweep now.
    pub fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(SystemTime::now())
    }

    /// Run one sweep, judging expiry against `now`.
    pub fn sweep_at(&self, now: SystemTime) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        self.visit(&self.root, 0, now, &mut report)?;
        Ok(report)
    }

    fn visit(
        &self,
        path: &Path,
        depth: usize,
        now: SystemTime,
        report: &mut SweepReport,
    ) -> Result<NodeOutcome> {
        if self.cancellation_token.is_cancelled() {
            report.interrupted = true;
            return Ok(NodeOutcome::Retained);
        }

        let metadata = match std::fs::symlink_metadata(path) {
            Ok(m) => m,
            Err(e) if depth == 0 => return Err(io_error("reading metadata of", path, e)),
            Err(e) => {
                self.record_error(report, "reading metadata of", path, &e);
                return Ok(NodeOutcome::Retained);
            }
        };
        // Captured before any child is removed, which would bump it.
        let modified = metadata.modified().unwrap_or(now);
        let expired = self.is_expired(modified, now);
        let ignored = self.is_ignored(path);

        if metadata.is_dir() {
            return self.visit_dir(path, depth, expired, ignored, now, report);
        }

        if !expired || ignored {
            return Ok(NodeOutcome::Retained);
        }
        match std::fs::remove_file(path) {
            Ok(()) => {
                trace!(path = %path.display(), "Deleted file");
                report.files_deleted += 1;
                Ok(NodeOutcome::Deleted)
            }
            Err(e) => {
                self.record_error(report, "deleting file", path, &e);
                Ok(NodeOutcome::Retained)
            }
        }
    }

    fn visit_dir(
        &self,
        path: &Path,
        depth: usize,
        expired: bool,
        ignored: bool,
        now: SystemTime,
        report: &mut SweepReport,
    ) -> Result<NodeOutcome> {
        if depth == 1 && !ignored {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy())
                .unwrap_or_default();
            if self.is_active(&name) || !expired {
                trace!(path = %path.display(), expired, "Keeping package directory");
                report.kept += 1;
                return Ok(NodeOutcome::Kept);
            }
        }

        let children = match read_children(path) {
            Ok(children) => children,
            Err(e) if depth == 0 => return Err(e),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cleanup could not list directory");
                report.errors += 1;
                return Ok(NodeOutcome::Retained);
            }
        };

        let mut survivors = 0usize;
        for child in children {
            if self.visit(&child, depth + 1, now, report)? != NodeOutcome::Deleted {
                survivors += 1;
            }
        }

        if depth == 0 || report.interrupted || !expired || ignored || survivors > 0 {
            return Ok(NodeOutcome::Retained);
        }
        match std::fs::remove_dir(path) {
            Ok(()) => {
                trace!(path = %path.display(), "Deleted directory");
                report.dirs_deleted += 1;
                Ok(NodeOutcome::Deleted)
            }
            // Something was written into it after the listing.
            Err(e) if e.kind() == std::io::ErrorKind::DirectoryNotEmpty => {
                trace!(path = %path.display(), "Directory refilled during sweep");
                Ok(NodeOutcome::Retained)
            }
            Err(e) => {
                self.record_error(report, "deleting directory", path, &e);
                Ok(NodeOutcome::Retained)
            }
        }
    }

    fn record_error(&self, report: &mut SweepReport, op: &str, path: &Path, e: &std::io::Error) {
        warn!(path = %path.display(), error = %e, "Cleanup failed {}", op);
        report.errors += 1;
    }

    /// Spawn the periodic sweep loop.
    ///
    /// Each sweep runs on the blocking pool. A sweep that fails as a whole
    /// ends the loop with [`SweeperStatus::Failed`].
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                root = %self.root.display(),
                interval_ms = self.check_interval.as_millis() as u64,
                "Cleanup sweeper started"
            );

            loop {
                if self.cancellation_token.is_cancelled() {
                    break;
                }
                self.set_loop_status(SweeperStatus::Running);

                let sweeper = Arc::clone(&self);
                match tokio::task::spawn_blocking(move || sweeper.sweep()).await {
                    Ok(Ok(report)) => {
                        if report.deleted() > 0 || report.errors > 0 {
                            info!(
                                files = report.files_deleted,
                                dirs = report.dirs_deleted,
                                errors = report.errors,
                                "Cleanup sweep finished"
                            );
                        } else {
                            debug!(kept = report.kept, "Cleanup sweep finished, nothing to delete");
                        }
                    }
                    Ok(Err(e)) => {
                        error!(error = %e, "Cleanup sweep failed");
                        *self.status.write() = SweeperStatus::Failed;
                        return;
                    }
                    Err(e) => {
                        error!(error = %e, "Cleanup sweep task aborted");
                        *self.status.write() = SweeperStatus::Failed;
                        return;
                    }
                }

                self.set_loop_status(SweeperStatus::WaitingNextIteration);
                tokio::select! {
                    _ = self.cancellation_token.cancelled() => break,
                    _ = tokio::time::sleep(self.check_interval) => {}
                }
            }

            *self.status.write() = SweeperStatus::Stopped;
            info!("Cleanup sweeper stopped");
        })
    }

    /// Ask the loop (and any sweep in progress) to stop.
    pub fn stop(&self) {
        {
            let mut status = self.status.write();
            *status = match *status {
                SweeperStatus::NotStarted | SweeperStatus::Stopped => SweeperStatus::Stopped,
                SweeperStatus::Failed => SweeperStatus::Failed,
                _ => SweeperStatus::Stopping,
            };
        }
        self.cancellation_token.cancel();
    }
}

fn read_children(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| io_error("reading directory", dir, e))?;
    let mut children = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| io_error("reading directory", dir, e))?;
        children.push(entry.path());
    }
    Ok(children)
}
