// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Lifecycle states for jobs and GPU controllers.
//!
//! Job status is derived on every read by comparing the saved process
//! identity with the live one; controller state is derived by the pool on
//! every listing. Neither is ever persisted as an authority.

use serde::{Deserialize, Serialize};

/// Observable status of a managed job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created but no process recorded yet.
    #[default]
    Pending,

    /// The saved PID is alive and still runs the saved command line.
    Running,

    /// The process exited while it was being managed by this daemon.
    Done,

    /// No process at the saved PID.
    Halted,

    /// The saved PID now belongs to an unrelated process.
    Stale,

    /// The job was last seen on a different host.
    Remote,
}

impl JobStatus {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Halted => "halted",
            Self::Stale => "stale",
            Self::Remote => "remote",
        }
    }

    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Classification of a GPU controller within a pool.
///
/// FREE → BUSY → STALE. Stale entries are dropped on the next
/// reconciliation and never come back as free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    /// Alive, unattached and configured like the caller expects.
    Free,

    /// Booked, attaching, or attached to a live workload.
    Busy,

    /// Dead, unresponsive, orphaned, or configured incompatibly.
    Stale,
}

impl ControllerState {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Busy => "busy",
            Self::Stale => "stale",
        }
    }
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_running_is_running() {
        for status in [
            JobStatus::Pending,
            JobStatus::Done,
            JobStatus::Halted,
            JobStatus::Stale,
            JobStatus::Remote,
        ] {
            assert!(!status.is_running(), "{} reported running", status);
        }
        assert!(JobStatus::Running.is_running());
    }

    #[test]
    fn test_status_serde_names() {
        let json = serde_json::to_string(&JobStatus::Halted).unwrap();
        assert_eq!(json, "\"halted\"");
        let state: ControllerState = serde_json::from_str("\"stale\"").unwrap();
        assert_eq!(state, ControllerState::Stale);
    }
}
