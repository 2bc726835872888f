//! Run-time lifecycle of the served application process.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dockwright_shared::errors::{DockwrightError, DockwrightResult};

/// Lifecycle status of the foreground process.
///
/// State machine:
/// ```text
/// CREATED → RUNNING → EXITED
///                   ↘ KILLED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Configuration resolved, process not spawned yet.
    Created,

    /// Process spawned and owning the listen socket.
    Running,

    /// Process exited on its own or after a forwarded signal.
    Exited,

    /// Process did not stop within the grace period and was sent SIGKILL.
    Killed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Exited | RunStatus::Killed)
    }

    pub fn can_transition_to(&self, target: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, target),
            (Created, Running) | (Running, Exited) | (Running, Killed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Created => "CREATED",
            RunStatus::Running => "RUNNING",
            RunStatus::Exited => "EXITED",
            RunStatus::Killed => "KILLED",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current status plus what is known about the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub status: RunStatus,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub last_updated: DateTime<Utc>,
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

impl RunState {
    pub fn new() -> Self {
        Self {
            status: RunStatus::Created,
            pid: None,
            exit_code: None,
            last_updated: Utc::now(),
        }
    }

    /// Move to `target`, rejecting transitions the state machine does not allow.
    pub fn transition_to(&mut self, target: RunStatus) -> DockwrightResult<()> {
        if !self.status.can_transition_to(target) {
            return Err(DockwrightError::InvalidState(format!(
                "Cannot transition from {} to {}",
                self.status, target
            )));
        }

        tracing::trace!(from = %self.status, to = %target, "Run state transition");
        self.status = target;
        self.last_updated = Utc::now();
        Ok(())
    }

    pub fn mark_running(&mut self, pid: u32) -> DockwrightResult<()> {
        self.transition_to(RunStatus::Running)?;
        self.pid = Some(pid);
        Ok(())
    }

    pub fn mark_finished(&mut self, exit_code: i32, killed: bool) -> DockwrightResult<()> {
        let target = if killed {
            RunStatus::Killed
        } else {
            RunStatus::Exited
        };
        self.transition_to(target)?;
        self.exit_code = Some(exit_code);
        Ok(())
    }
}
