//! Lock-free job status shared between a processor and its readers.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum JobState {
    NotStarted = 0,
    Processing = 1,
    Completed = 2,
    Failed = 3,
    /// Discarded by a shutdown before finishing.
    Stopped = 4,
}

impl JobState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::NotStarted,
            1 => Self::Processing,
            2 => Self::Completed,
            3 => Self::Failed,
            _ => Self::Stopped,
        }
    }

    /// Completed or failed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// No further transitions are accepted from this state.
    fn is_final(&self) -> bool {
        self.is_terminal() || *self == Self::Stopped
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time copy of a [`JobStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub state: JobState,
    pub percentage: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusSnapshot {
    pub fn has_completed(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Progress and state of one job.
///
/// State and percentage are independent atomics so readers never observe a
/// torn value. Once COMPLETED, FAILED or STOPPED, the state is frozen and
/// the percentage stops moving.
#[derive(Debug)]
pub struct JobStatus {
    state: AtomicU8,
    percentage: AtomicU8,
    message: Mutex<Option<String>>,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStatus {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(JobState::NotStarted as u8),
            percentage: AtomicU8::new(0),
            message: Mutex::new(None),
        }
    }

    pub fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn percentage(&self) -> u8 {
        self.percentage.load(Ordering::Acquire)
    }

    pub fn message(&self) -> Option<String> {
        self.message.lock().clone()
    }

    /// True once the job is COMPLETED or FAILED.
    pub fn has_completed(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let message = self.message.lock().clone();
        StatusSnapshot {
            state: self.state(),
            percentage: self.percentage(),
            message,
        }
    }

    fn transition(&self, to: JobState) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if JobState::from_u8(current).is_final() {
                    None
                } else {
                    Some(to as u8)
                }
            })
            .is_ok()
    }

    pub fn start(&self) -> bool {
        self.transition(JobState::Processing)
    }

    /// Raise the percentage to `percentage` (clamped to 100). Never lowers it.
    pub fn advance_to(&self, percentage: u8) {
        if self.state().is_final() {
            return;
        }
        self.percentage
            .fetch_max(percentage.min(100), Ordering::AcqRel);
    }

    pub fn complete(&self) -> bool {
        let _guard = self.message.lock();
        if self.state().is_final() {
            return false;
        }
        self.percentage.store(100, Ordering::Release);
        self.transition(JobState::Completed)
    }

    pub fn fail(&self, message: impl Into<String>) -> bool {
        let mut guard = self.message.lock();
        let changed = self.transition(JobState::Failed);
        if changed {
            *guard = Some(message.into());
        }
        changed
    }

    pub fn stop(&self) -> bool {
        let mut guard = self.message.lock();
        let changed = self.transition(JobState::Stopped);
        if changed {
            *guard = Some("stopped by shutdown".to_string());
        }
        changed
    }
}
