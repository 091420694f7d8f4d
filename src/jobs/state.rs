//! Job state machine.
//!
//! `queued → running → {completed, failed}` with `running ⇄ paused`, and any
//! active state → failed on cancellation or a fatal transport error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted, dispatcher not yet consuming.
    Queued,
    /// Dispatcher is pulling messages.
    Running,
    /// Dispatcher stopped pulling; in-flight sends finish.
    Paused,
    /// Every message reached a terminal status.
    Completed,
    /// Cancelled or aborted.
    Failed,
}

impl JobStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            // From Queued
            (Queued, Running) | (Queued, Paused) | (Queued, Failed) |
            // From Running
            (Running, Paused) | (Running, Completed) | (Running, Failed) |
            // From Paused
            (Paused, Running) | (Paused, Failed)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Check if the job is active (not terminal).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    /// Previous state.
    pub from: JobStatus,
    /// New state.
    pub to: JobStatus,
    /// When the transition occurred.
    pub timestamp: DateTime<Utc>,
    /// Reason for the transition.
    pub reason: Option<String>,
}

/// Cap on retained transition history (pause/resume can cycle indefinitely).
pub const MAX_TRANSITIONS: usize = 200;
